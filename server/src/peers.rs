//! Peer Link Manager: the full mesh of control connections between nodes.
//!
//! The lower id of every pair dials, the higher id accepts. A dialled link
//! opens with `PeerHello` so the acceptor learns who called, then both
//! ends send `CurrLeader` with their current belief. Dropped links are
//! redialled every `reconnect_interval`. All inbound control messages,
//! from every link, land in a single inbox owned by the node controller.

use crate::config::NodeConfig;
use crate::network::{run_duplex, HANDSHAKE_TIMEOUT};
use log::{debug, info, warn};
use shared::{read_frame, write_frame, NodeId, PeerMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;

/// A control message together with the link it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: NodeId,
    pub message: PeerMessage,
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<PeerMessage>,
}

/// State shared by the accept loop, the dialers and the public handle.
struct Mesh {
    id: NodeId,
    links: RwLock<HashMap<NodeId, Link>>,
    generations: AtomicU64,
    leader: watch::Sender<Option<NodeId>>,
    inbox: mpsc::UnboundedSender<Inbound>,
}

pub struct PeerLinks {
    mesh: Arc<Mesh>,
    tasks: JoinSet<()>,
}

impl PeerLinks {
    /// Binds this node's control address and starts linking to every peer.
    pub async fn start(
        config: &NodeConfig,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Inbound>)> {
        let own = config.own().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("node {} is not in the peer list", config.id),
            )
        })?;

        let listener = TcpListener::bind(own.control_addr).await?;
        info!(
            "Node {} control listener bound on {}",
            config.id,
            listener.local_addr()?
        );

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (leader, _) = watch::channel(None);
        let mesh = Arc::new(Mesh {
            id: config.id,
            links: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(1),
            leader,
            inbox,
        });

        let mut tasks = JoinSet::new();
        let known: Vec<NodeId> = config.others().map(|p| p.id).collect();
        tasks.spawn(accept_loop(listener, Arc::clone(&mesh), known));

        for peer in config.others().filter(|p| p.id > config.id) {
            tasks.spawn(dial_loop(
                Arc::clone(&mesh),
                peer.id,
                peer.control_addr,
                config.timings.reconnect_interval,
            ));
        }

        Ok((Self { mesh, tasks }, inbox_rx))
    }

    pub fn id(&self) -> NodeId {
        self.mesh.id
    }

    /// Queues `message` for `peer`. Returns false if there is no live link.
    pub async fn send_to(&self, peer: NodeId, message: PeerMessage) -> bool {
        let links = self.mesh.links.read().await;
        links
            .get(&peer)
            .is_some_and(|link| link.outbound.send(message).is_ok())
    }

    /// Queues `message` for every linked peer and returns how many it reached.
    pub async fn broadcast(&self, message: PeerMessage) -> usize {
        let links = self.mesh.links.read().await;
        links
            .values()
            .filter(|link| link.outbound.send(message.clone()).is_ok())
            .count()
    }

    /// Peers with a live link, in id order.
    pub async fn reachable(&self) -> Vec<NodeId> {
        let links = self.mesh.links.read().await;
        let mut ids: Vec<NodeId> = links.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Records the believed leader; new links advertise it in `CurrLeader`.
    pub fn set_leader(&self, leader: Option<NodeId>) {
        self.mesh.leader.send_replace(leader);
    }

    pub fn leader(&self) -> Option<NodeId> {
        *self.mesh.leader.borrow()
    }

    /// Closes every link and the control listener.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}

async fn accept_loop(listener: TcpListener, mesh: Arc<Mesh>, known: Vec<NodeId>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let mesh = Arc::clone(&mesh);
                    let known = known.clone();
                    connections.spawn(async move {
                        let _ = stream.set_nodelay(true);
                        let mut stream = stream;
                        let hello = tokio::time::timeout(
                            HANDSHAKE_TIMEOUT,
                            read_frame::<_, PeerMessage>(&mut stream),
                        )
                        .await;
                        match hello {
                            Ok(Ok(Some(PeerMessage::PeerHello { server_id })))
                                if known.contains(&server_id) =>
                            {
                                run_link(mesh, server_id, stream).await;
                            }
                            Ok(Ok(Some(other))) => {
                                warn!("Unexpected {} from {} as peer hello", other.kind(), addr)
                            }
                            Ok(Ok(None)) => debug!("{} closed before peer hello", addr),
                            Ok(Err(e)) => warn!("Bad peer hello from {}: {}", addr, e),
                            Err(_) => warn!("{} sent no peer hello in time", addr),
                        }
                    });
                }
                Err(e) => {
                    warn!("Control accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn dial_loop(mesh: Arc<Mesh>, peer: NodeId, addr: std::net::SocketAddr, retry: Duration) {
    loop {
        let linked = mesh.links.read().await.contains_key(&peer);
        if !linked {
            match TcpStream::connect(addr).await {
                Ok(mut stream) => {
                    let _ = stream.set_nodelay(true);
                    let hello = PeerMessage::PeerHello { server_id: mesh.id };
                    match write_frame(&mut stream, &hello).await {
                        Ok(()) => run_link(Arc::clone(&mesh), peer, stream).await,
                        Err(e) => debug!("Peer hello to node {} failed: {}", peer, e),
                    }
                }
                Err(e) => debug!("Node {} unreachable at {}: {}", peer, addr, e),
            }
        }
        tokio::time::sleep(retry).await;
    }
}

/// Registers the link, advertises the current leader belief and pumps
/// frames until the connection drops.
async fn run_link(mesh: Arc<Mesh>, peer: NodeId, stream: TcpStream) {
    let generation = mesh.generations.fetch_add(1, Ordering::Relaxed);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    let believed = *mesh.leader.borrow();
    let _ = outbound.send(PeerMessage::CurrLeader {
        leader: believed,
        from: mesh.id,
    });

    let replaced = mesh
        .links
        .write()
        .await
        .insert(peer, Link {
            generation,
            outbound,
        })
        .is_some();
    if replaced {
        info!("Node {} replaced its link to node {}", mesh.id, peer);
    } else {
        info!("Node {} linked to node {}", mesh.id, peer);
    }

    let (reader, writer) = stream.into_split();
    let inbox = mesh.inbox.clone();
    let label = format!("node {}", peer);
    run_duplex(reader, writer, outbound_rx, &label, |message: PeerMessage| {
        debug!("Node {} got {} from node {}", mesh.id, message.kind(), peer);
        inbox.send(Inbound { from: peer, message }).is_ok()
    })
    .await;

    let mut links = mesh.links.write().await;
    if links.get(&peer).is_some_and(|link| link.generation == generation) {
        links.remove(&peer);
        warn!("Node {} lost its link to node {}", mesh.id, peer);
    }
}
