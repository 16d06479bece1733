//! Leader Role: the authoritative tick loop.
//!
//! Each tick runs collect, simulate, propose, gate, commit and publish in
//! that order, then the periodic heartbeat and clock sync. Connection
//! tasks and peer links only feed channels; every mutation of the world
//! happens here.

use crate::client_manager::ClientManager;
use crate::network::{ConnId, ConnectionEvent, ServiceListener};
use crate::node::{BoxError, NodeContext, RoleExit};
use crate::peers::Inbound;
use crate::replication::{FollowerSet, Proposal};
use log::{debug, info, warn};
use shared::{
    unix_millis, ClientMessage, Event, NodeId, PeerMessage, ReplicaMessage, Tick, TickClock,
    CLOCK_SYNC_INTERVAL,
};
use std::time::Instant;
use tokio::sync::mpsc;

/// Runs the leader role until demoted. The client-facing listener is
/// bound on entry and released before returning.
pub async fn run(ctx: &mut NodeContext) -> Result<RoleExit, BoxError> {
    let id = ctx.id();
    let addr = ctx
        .config
        .own()
        .map(|peer| peer.client_addr)
        .ok_or("own peer entry missing")?;

    let (events_tx, events) = mpsc::unbounded_channel();
    let listener = ServiceListener::bind(addr, events_tx).await?;

    ctx.peers.set_leader(Some(id));
    let reached = ctx.peers.broadcast(PeerMessage::LeaderAnnounce { from: id }).await;
    info!(
        "Node {} leading from tick {}, announced to {} peers",
        id, ctx.tick, reached
    );

    let max_clients = ctx.config.max_clients;
    let mut role = LeaderRole {
        ctx,
        clients: ClientManager::new(max_clients),
        followers: FollowerSet::new(),
        joining: Vec::new(),
        arriving: Vec::new(),
        events,
    };
    let exit = role.run_loop().await;
    drop(role);

    listener.shutdown().await;
    exit
}

struct LeaderRole<'a> {
    ctx: &'a mut NodeContext,
    clients: ClientManager,
    followers: FollowerSet,
    /// Followers waiting for their welcome at the next tick boundary.
    joining: Vec<(NodeId, ConnId, mpsc::UnboundedSender<ReplicaMessage>)>,
    /// Clients that connected while a batch was awaiting acks. They get
    /// their snapshot once that batch is published.
    arriving: Vec<ConnectionEvent>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl LeaderRole<'_> {
    async fn run_loop(&mut self) -> Result<RoleExit, BoxError> {
        let mut clock = TickClock::new(
            self.ctx.config.timings.tick_rate,
            self.ctx.tick,
            Instant::now(),
        );

        loop {
            let deadline = tokio::time::Instant::from_std(clock.next_deadline());
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    while let Some(tick) = clock.try_advance(Instant::now()) {
                        self.run_tick(tick).await?;
                    }
                }
                event = self.events.recv() => {
                    let event = event.ok_or("service listener stopped")?;
                    self.on_connection_event(event);
                }
                inbound = self.ctx.inbox.recv() => {
                    let inbound = inbound.ok_or("peer inbox closed")?;
                    if let Some(exit) = self.on_peer_message(inbound).await {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn run_tick(&mut self, tick: Tick) -> Result<(), BoxError> {
        self.welcome_joining();

        // Collect and simulate
        let requests = self.clients.take_requests();
        let batch = self.ctx.replica.simulate(tick, requests);
        self.ctx.tick = tick;

        if !batch.is_empty() {
            debug!("Tick {}: {} events", tick, batch.len());
            if !self.followers.is_empty() {
                self.replicate(tick, &batch).await?;
            }
            // Publish only once every follower has the batch committed
            self.clients.broadcast(&ClientMessage::Update { tick, data: batch });
            self.ctx.publish_world();
        }
        for joined in std::mem::take(&mut self.arriving) {
            self.on_connection_event(joined);
        }

        let timings = &self.ctx.config.timings;
        if tick % timings.heartbeat_interval == 0 {
            self.followers.broadcast(&ReplicaMessage::Heartbeat {
                leader_id: self.ctx.id(),
                tick,
            });
        }

        if tick % CLOCK_SYNC_INTERVAL == 0 {
            self.clients.broadcast(&ClientMessage::Clock {
                server_tick: tick,
                timestamp: unix_millis(),
            });
        }

        if tick % 60 == 0 {
            debug!(
                "Tick {}: {} clients, {} followers, {} peers linked, {} pending timers",
                tick,
                self.clients.len(),
                self.followers.len(),
                self.ctx.peers.reachable().await.len(),
                self.ctx.replica.queue().len()
            );
        }

        self.ctx.publish_tick();
        Ok(())
    }

    /// Proposes `batch`, waits for every follower's ack with bounded
    /// retries, evicts the silent ones and commits to the rest.
    async fn replicate(&mut self, tick: Tick, batch: &[Event]) -> Result<(), BoxError> {
        let timings = self.ctx.config.timings.clone();
        let proposal_message = ReplicaMessage::Event {
            tick,
            data: batch.to_vec(),
        };
        let mut proposal = Proposal::new(tick, self.followers.ids());

        while !proposal.is_complete() && proposal.attempts() < timings.max_proposal_attempts {
            proposal.record_attempt();
            let targets = proposal.silent();
            if proposal.attempts() > 1 {
                warn!(
                    "Tick {}: no ack from {:?}, resending (attempt {}/{})",
                    tick,
                    targets,
                    proposal.attempts(),
                    timings.max_proposal_attempts
                );
            }

            for server_id in targets {
                if !self.followers.send(server_id, proposal_message.clone()) {
                    proposal.forget(server_id);
                }
            }

            let deadline = tokio::time::Instant::now() + timings.ack_timeout;
            self.await_acks(&mut proposal, deadline).await?;
        }

        for server_id in proposal.silent() {
            self.followers.evict(server_id);
        }

        self.followers.broadcast(&ReplicaMessage::Commit { tick });
        Ok(())
    }

    async fn await_acks(
        &mut self,
        proposal: &mut Proposal,
        deadline: tokio::time::Instant,
    ) -> Result<(), BoxError> {
        while !proposal.is_complete() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = self.events.recv() => {
                    match event.ok_or("service listener stopped")? {
                        ConnectionEvent::Ack { server_id, tick, .. } => {
                            if !proposal.ack(server_id, tick) {
                                debug!(
                                    "Ignoring ack for tick {} from follower {}",
                                    tick, server_id
                                );
                            }
                        }
                        ConnectionEvent::FollowerLeft { server_id, conn } => {
                            if self.followers.remove(server_id, conn) {
                                proposal.forget(server_id);
                            }
                            self.joining.retain(|(_, c, _)| *c != conn);
                        }
                        // The replica already holds this uncommitted batch
                        joined @ ConnectionEvent::ClientJoined { .. } => {
                            self.arriving.push(joined);
                        }
                        ConnectionEvent::ClientLeft { client_id } => {
                            self.arriving.retain(|event| {
                                !matches!(
                                    event,
                                    ConnectionEvent::ClientJoined { client_id: id, .. }
                                        if *id == client_id
                                )
                            });
                            self.clients.remove_client(client_id);
                        }
                        other => self.on_connection_event(other),
                    }
                }
            }
        }
        Ok(())
    }

    fn welcome_joining(&mut self) {
        for (server_id, conn, outbound) in std::mem::take(&mut self.joining) {
            let snapshot = self.ctx.replica.snapshot(self.ctx.tick);
            let size = bincode::serialized_size(&snapshot).unwrap_or(0);
            let welcome = ReplicaMessage::Welcome {
                leader_id: self.ctx.id(),
                snapshot,
            };
            if outbound.send(welcome).is_ok() {
                info!(
                    "Welcomed follower {} at tick {} with a {} byte snapshot",
                    server_id, self.ctx.tick, size
                );
                self.followers.insert(server_id, conn, outbound);
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::ClientJoined {
                client_id,
                addr,
                outbound,
            } => {
                let player = self
                    .clients
                    .add_client(client_id, addr, outbound, self.ctx.replica.state())
                    .map(|client| client.player);
                if let Some(local_player) = player {
                    let snapshot = self.ctx.replica.snapshot(self.ctx.tick);
                    self.clients.send_to(
                        client_id,
                        ClientMessage::Init {
                            snapshot,
                            local_player,
                        },
                    );
                }
            }
            ConnectionEvent::ClientRequest { client_id, request } => {
                self.clients.queue_request(client_id, request);
            }
            ConnectionEvent::ClientLeft { client_id } => {
                self.clients.remove_client(client_id);
            }
            ConnectionEvent::FollowerJoined {
                server_id,
                conn,
                outbound,
            } => {
                info!("Follower {} connected, welcome at next tick", server_id);
                self.joining.push((server_id, conn, outbound));
            }
            ConnectionEvent::Ack { server_id, tick, .. } => {
                debug!("Late ack for tick {} from follower {}", tick, server_id);
            }
            ConnectionEvent::FollowerLeft { server_id, conn } => {
                self.followers.remove(server_id, conn);
                self.joining.retain(|(_, c, _)| *c != conn);
            }
        }
    }

    async fn on_peer_message(&mut self, inbound: Inbound) -> Option<RoleExit> {
        let id = self.ctx.id();
        match inbound.message {
            PeerMessage::Bully { from } if from > id => {
                self.ctx
                    .peers
                    .send_to(from, PeerMessage::BullyOk { from: id })
                    .await;
                self.ctx
                    .peers
                    .send_to(from, PeerMessage::LeaderAnnounce { from: id })
                    .await;
                None
            }
            PeerMessage::LeaderAnnounce { from } if from < id => {
                info!("Node {} demoted by lower node {}", id, from);
                Some(RoleExit::Demoted { leader: from })
            }
            PeerMessage::LeaderAnnounce { from } if from > id => {
                warn!("Node {} also claims leadership, re-announcing", from);
                self.ctx
                    .peers
                    .broadcast(PeerMessage::LeaderAnnounce { from: id })
                    .await;
                None
            }
            PeerMessage::CurrLeader {
                leader: Some(other),
                from,
            } if other > id => {
                info!("Node {} follows node {}, announcing to it", from, other);
                self.ctx
                    .peers
                    .send_to(from, PeerMessage::LeaderAnnounce { from: id })
                    .await;
                None
            }
            PeerMessage::StateRequest { from } => {
                self.ctx.reply_state(from).await;
                None
            }
            other => {
                debug!("Leader ignoring {} from {}", other.kind(), inbound.from);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PeerConfig, Timings};
    use shared::{read_frame, write_frame, ArenaRules, ClientRequest, FollowerMessage, Hello};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn free_addr() -> SocketAddr {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    /// Node 1 leading alone; node 2 is configured but never started.
    type LeaderTask = JoinHandle<Result<RoleExit, BoxError>>;

    async fn start_leader(timings: Timings) -> (SocketAddr, LeaderTask) {
        let client_addr = free_addr();
        let peers = vec![
            PeerConfig {
                id: 1,
                control_addr: free_addr(),
                client_addr,
            },
            PeerConfig {
                id: 2,
                control_addr: free_addr(),
                client_addr: free_addr(),
            },
        ];
        let config = NodeConfig::new(1, peers, timings, 4, None).unwrap();
        let mut ctx = NodeContext::new(config, Arc::new(ArenaRules::default()))
            .await
            .unwrap();
        let handle = tokio::spawn(async move { run(&mut ctx).await });
        (client_addr, handle)
    }

    async fn connect<T: serde::Serialize>(addr: SocketAddr, hello: &T) -> TcpStream {
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(addr).await {
                write_frame(&mut stream, hello).await.unwrap();
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("leader never listened on {}", addr);
    }

    async fn next_frame<T: serde::de::DeserializeOwned>(stream: &mut TcpStream) -> Option<T> {
        timeout(Duration::from_secs(5), read_frame(stream))
            .await
            .unwrap()
            .ok()
            .flatten()
    }

    fn step_right() -> Event {
        Event::PlayerMove {
            player: 1,
            dx: 1,
            dy: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_follower_is_evicted_and_batch_published() {
        let timings = Timings {
            ack_timeout: Duration::from_millis(500),
            max_proposal_attempts: 2,
            ..Timings::default()
        };
        let (addr, leader) = start_leader(timings).await;

        // A follower that takes the snapshot and never acks
        let mut follower = connect(addr, &Hello::Follower { server_id: 2 }).await;
        let welcome: ReplicaMessage = next_frame(&mut follower).await.unwrap();
        assert!(matches!(welcome, ReplicaMessage::Welcome { leader_id: 1, .. }));

        let mut player = connect(addr, &Hello::Client).await;
        match next_frame(&mut player).await.unwrap() {
            ClientMessage::Init { local_player, .. } => assert_eq!(local_player, Some(1)),
            other => panic!("expected init, got {:?}", other),
        }
        write_frame(&mut player, &ClientRequest::Move { dx: 1, dy: 0 })
            .await
            .unwrap();

        let proposed = loop {
            match next_frame(&mut follower).await.unwrap() {
                ReplicaMessage::Event { tick, data } => {
                    assert_eq!(data, vec![step_right()]);
                    break tick;
                }
                ReplicaMessage::Heartbeat { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        };

        // A client arriving mid-gate hears nothing until the batch is published
        let mut late = connect(addr, &Hello::Client).await;
        let early = timeout(
            Duration::from_millis(200),
            read_frame::<_, ClientMessage>(&mut late),
        )
        .await;
        assert!(early.is_err(), "snapshot sent before commit");

        let published = loop {
            match next_frame(&mut player).await.unwrap() {
                ClientMessage::Update { tick, data } => break (tick, data),
                ClientMessage::Clock { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(published, (proposed, vec![step_right()]));

        match next_frame(&mut late).await.unwrap() {
            ClientMessage::Init { snapshot, .. } => {
                assert_eq!(snapshot.tick, proposed);
                assert_eq!(snapshot.state.players[&1].x, 1);
            }
            other => panic!("expected init, got {:?}", other),
        }

        // The follower saw the proposal resent, never a commit, then lost its link
        loop {
            match next_frame::<ReplicaMessage>(&mut follower).await {
                Some(ReplicaMessage::Commit { .. }) => panic!("evicted follower got a commit"),
                Some(_) => continue,
                None => break,
            }
        }
        assert!(!leader.is_finished());
        leader.abort();
    }

    #[tokio::test]
    async fn test_acked_batch_commits_before_publish() {
        let (addr, leader) = start_leader(Timings::default()).await;

        let mut follower = connect(addr, &Hello::Follower { server_id: 2 }).await;
        let _: ReplicaMessage = next_frame(&mut follower).await.unwrap();

        let mut player = connect(addr, &Hello::Client).await;
        let _: ClientMessage = next_frame(&mut player).await.unwrap();
        write_frame(&mut player, &ClientRequest::Move { dx: 1, dy: 0 })
            .await
            .unwrap();

        let proposed = loop {
            if let ReplicaMessage::Event { tick, .. } = next_frame(&mut follower).await.unwrap() {
                break tick;
            }
        };
        write_frame(&mut follower, &FollowerMessage::Ack { tick: proposed })
            .await
            .unwrap();
        let committed = loop {
            if let ReplicaMessage::Commit { tick } = next_frame(&mut follower).await.unwrap() {
                break tick;
            }
        };
        assert_eq!(committed, proposed);

        let published = loop {
            if let ClientMessage::Update { tick, .. } = next_frame(&mut player).await.unwrap() {
                break tick;
            }
        };
        assert_eq!(published, proposed);
        leader.abort();
    }
}
