//! Leader-side service listener and shared connection plumbing
//!
//! Every accepted socket gets one task that classifies it by its first
//! frame and then pumps frames in both directions. Tasks never touch the
//! game state; they report through [`ConnectionEvent`]s that the leader's
//! tick loop drains.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{
    read_frame, write_frame, ClientMessage, ClientRequest, FollowerMessage, Hello, NodeId,
    ReplicaMessage, Tick,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const BIND_ATTEMPTS: u32 = 10;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Identifies one accepted connection. Never reused within a listener.
pub type ConnId = u64;

/// Messages sent from connection tasks to the leader loop
#[derive(Debug)]
pub enum ConnectionEvent {
    ClientJoined {
        client_id: ConnId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    },
    ClientRequest {
        client_id: ConnId,
        request: ClientRequest,
    },
    ClientLeft {
        client_id: ConnId,
    },
    FollowerJoined {
        server_id: NodeId,
        conn: ConnId,
        outbound: mpsc::UnboundedSender<ReplicaMessage>,
    },
    Ack {
        server_id: NodeId,
        conn: ConnId,
        tick: Tick,
    },
    FollowerLeft {
        server_id: NodeId,
        conn: ConnId,
    },
}

/// The client-facing socket held by whichever role currently leads.
///
/// Dropping it, or calling [`ServiceListener::shutdown`], aborts the
/// accept loop and every connection task, closing their sockets.
pub struct ServiceListener {
    local_addr: SocketAddr,
    tasks: JoinSet<()>,
}

impl ServiceListener {
    /// Binds `addr`, retrying briefly while a previous owner releases it.
    pub async fn bind(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> std::io::Result<Self> {
        let mut attempt = 1;
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) if attempt < BIND_ATTEMPTS => {
                    debug!("Bind {} failed ({}), retrying", addr, e);
                    attempt += 1;
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };

        let local_addr = listener.local_addr()?;
        info!("Service listener bound on {}", local_addr);

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(listener, events));
        Ok(Self { local_addr, tasks })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
        info!("Service listener on {} released", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<ConnectionEvent>) {
    let mut connections = JoinSet::new();
    let mut next_conn: ConnId = 1;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn = next_conn;
                    next_conn += 1;
                    connections.spawn(serve_connection(stream, addr, conn, events.clone()));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            // Reap finished connection tasks so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame::<_, Hello>(&mut reader)).await;
    match hello {
        Ok(Ok(Some(Hello::Client))) => serve_client(reader, writer, addr, conn, events).await,
        Ok(Ok(Some(Hello::Follower { server_id }))) => {
            serve_follower(reader, writer, server_id, conn, events).await
        }
        Ok(Ok(None)) => debug!("{} closed before saying hello", addr),
        Ok(Err(e)) => warn!("Bad hello from {}: {}", addr, e),
        Err(_) => warn!("{} did not say hello within {:?}", addr, HANDSHAKE_TIMEOUT),
    }
}

async fn serve_client(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    addr: SocketAddr,
    client_id: ConnId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    if events
        .send(ConnectionEvent::ClientJoined {
            client_id,
            addr,
            outbound,
        })
        .is_err()
    {
        return;
    }

    let label = format!("client {}", client_id);
    run_duplex(reader, writer, outbound_rx, &label, |request: ClientRequest| {
        events
            .send(ConnectionEvent::ClientRequest { client_id, request })
            .is_ok()
    })
    .await;

    let _ = events.send(ConnectionEvent::ClientLeft { client_id });
}

async fn serve_follower(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    server_id: NodeId,
    conn: ConnId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    if events
        .send(ConnectionEvent::FollowerJoined {
            server_id,
            conn,
            outbound,
        })
        .is_err()
    {
        return;
    }

    let label = format!("follower {}", server_id);
    run_duplex(
        reader,
        writer,
        outbound_rx,
        &label,
        |message: FollowerMessage| match message {
            FollowerMessage::Ack { tick } => events
                .send(ConnectionEvent::Ack {
                    server_id,
                    conn,
                    tick,
                })
                .is_ok(),
        },
    )
    .await;

    let _ = events.send(ConnectionEvent::FollowerLeft { server_id, conn });
}

/// Pumps one framed connection until either direction ends.
///
/// Inbound frames go to `on_frame`, which returns false to stop. The
/// writer side ends when every sender for `outbound` is dropped, which is
/// how the owner closes a connection. A single undecodable frame is
/// logged and skipped.
pub(crate) async fn run_duplex<In, Out, F>(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Out>,
    label: &str,
    mut on_frame: F,
) where
    In: DeserializeOwned,
    Out: Serialize,
    F: FnMut(In) -> bool,
{
    let read = async {
        loop {
            match read_frame::<_, In>(&mut reader).await {
                Ok(Some(message)) => {
                    if !on_frame(message) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("{} closed the connection", label);
                    break;
                }
                Err(e) if e.is_recoverable() => warn!("Dropping frame from {}: {}", label, e),
                Err(e) => {
                    warn!("Read from {} failed: {}", label, e);
                    break;
                }
            }
        }
    };

    let write = async {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                warn!("Write to {} failed: {}", label, e);
                break;
            }
        }
    };

    tokio::select! {
        _ = read => {}
        _ = write => {}
    }
}
