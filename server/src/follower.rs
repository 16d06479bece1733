//! Follower Role: mirrors the leader.
//!
//! A proposed batch is acked immediately and held until its commit
//! arrives; nothing uncommitted ever touches the replica. Heartbeats
//! hard-set the local tick. Silence longer than the heartbeat timeout, a
//! commit that never comes, or a dropped link ends the role with
//! [`RoleExit::NeedElection`].

use crate::network::run_duplex;
use crate::node::{BoxError, NodeContext, RoleExit};
use crate::peers::Inbound;
use log::{debug, info, warn};
use shared::{
    write_frame, Event, FollowerMessage, Hello, NodeId, PeerMessage, ReplicaMessage, Tick,
    TickClock,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Follows `leader` until it fails or is superseded.
pub async fn run(ctx: &mut NodeContext, leader: NodeId) -> Result<RoleExit, BoxError> {
    ctx.peers.set_leader(Some(leader));
    let Some(addr) = ctx.config.peer(leader).map(|peer| peer.client_addr) else {
        warn!("Leader {} is not a configured peer", leader);
        return Ok(RoleExit::NeedElection);
    };

    let timeout = ctx.config.timings.state_transfer_timeout;
    let Some(stream) = connect(addr, ctx.id(), timeout).await else {
        warn!("Could not reach leader {} at {}", leader, addr);
        return Ok(RoleExit::NeedElection);
    };

    // The link task is aborted when `link` drops, closing the socket.
    let (replica_tx, replica_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel::<FollowerMessage>();
    let mut link = JoinSet::new();
    link.spawn(async move {
        let (reader, writer) = stream.into_split();
        let label = format!("leader {}", leader);
        run_duplex(reader, writer, ack_rx, &label, |message: ReplicaMessage| {
            replica_tx.send(message).is_ok()
        })
        .await;
    });

    let mut role = FollowerRole {
        ctx,
        leader,
        replica_rx,
        ack_tx,
        pending: BTreeMap::new(),
    };

    if let Some(exit) = role.await_welcome(timeout).await? {
        return Ok(exit);
    }
    role.run_loop().await
}

async fn connect(
    addr: std::net::SocketAddr,
    id: NodeId,
    timeout: Duration,
) -> Option<TcpStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.set_nodelay(true);
                match write_frame(&mut stream, &Hello::Follower { server_id: id }).await {
                    Ok(()) => return Some(stream),
                    Err(e) => debug!("Hello to leader at {} failed: {}", addr, e),
                }
            }
            Ok(Err(e)) => debug!("Connect to leader at {} failed: {}", addr, e),
            Err(_) => return None,
        }
        if tokio::time::Instant::now() + CONNECT_RETRY >= deadline {
            return None;
        }
        tokio::time::sleep(CONNECT_RETRY).await;
    }
}

struct FollowerRole<'a> {
    ctx: &'a mut NodeContext,
    leader: NodeId,
    replica_rx: mpsc::UnboundedReceiver<ReplicaMessage>,
    ack_tx: mpsc::UnboundedSender<FollowerMessage>,
    /// Acked but uncommitted batches, with the time they were received.
    pending: BTreeMap<Tick, (Vec<Event>, Instant)>,
}

impl FollowerRole<'_> {
    /// Waits for the leader's snapshot. Returns an exit if the role ends
    /// before one arrives.
    async fn await_welcome(&mut self, timeout: Duration) -> Result<Option<RoleExit>, BoxError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("No welcome from leader {} within {:?}", self.leader, timeout);
                    return Ok(Some(RoleExit::NeedElection));
                }
                message = self.replica_rx.recv() => match message {
                    Some(ReplicaMessage::Welcome { leader_id, snapshot }) => {
                        info!(
                            "Node {} following {} from tick {}",
                            self.ctx.id(),
                            leader_id,
                            snapshot.tick
                        );
                        self.ctx.tick = snapshot.tick;
                        self.ctx.replica.restore(snapshot);
                        self.ctx.publish_world();
                        return Ok(None);
                    }
                    Some(other) => debug!("Ignoring {:?} before welcome", other),
                    None => {
                        warn!("Leader {} closed the link before welcoming", self.leader);
                        return Ok(Some(RoleExit::NeedElection));
                    }
                },
                inbound = self.ctx.inbox.recv() => {
                    let inbound = inbound.ok_or("peer inbox closed")?;
                    if let Some(exit) = self.on_peer_message(inbound).await {
                        return Ok(Some(exit));
                    }
                }
            }
        }
    }

    async fn run_loop(&mut self) -> Result<RoleExit, BoxError> {
        let timings = self.ctx.config.timings.clone();
        let mut clock = TickClock::new(timings.tick_rate, self.ctx.tick, Instant::now());
        let mut last_heartbeat = self.ctx.tick;

        loop {
            let deadline = tokio::time::Instant::from_std(clock.next_deadline());
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    while let Some(tick) = clock.try_advance(Instant::now()) {
                        self.ctx.tick = self.ctx.tick.max(tick);
                    }
                    self.ctx.publish_tick();

                    let silent = self.ctx.tick.saturating_sub(last_heartbeat);
                    if silent >= timings.heartbeat_timeout {
                        warn!(
                            "No heartbeat from leader {} for {} ticks",
                            self.leader, silent
                        );
                        return Ok(RoleExit::NeedElection);
                    }

                    let stalled = self
                        .pending
                        .iter()
                        .find(|(_, (_, received))| received.elapsed() >= timings.commit_timeout);
                    if let Some((tick, _)) = stalled {
                        warn!("Batch for tick {} was never committed", tick);
                        return Ok(RoleExit::NeedElection);
                    }
                }
                message = self.replica_rx.recv() => match message {
                    Some(message) => {
                        if let Some(tick) = self.on_replica_message(message) {
                            clock.set_tick(tick);
                            last_heartbeat = tick;
                        }
                    }
                    None => {
                        warn!("Lost link to leader {}", self.leader);
                        return Ok(RoleExit::NeedElection);
                    }
                },
                inbound = self.ctx.inbox.recv() => {
                    let inbound = inbound.ok_or("peer inbox closed")?;
                    if let Some(exit) = self.on_peer_message(inbound).await {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// Returns the tick to resynchronise to, for heartbeats and fresh snapshots.
    fn on_replica_message(&mut self, message: ReplicaMessage) -> Option<Tick> {
        match message {
            ReplicaMessage::Event { tick, data } => {
                if self.ack_tx.send(FollowerMessage::Ack { tick }).is_err() {
                    warn!("Could not ack tick {}", tick);
                }
                self.pending.insert(tick, (data, Instant::now()));
                None
            }
            ReplicaMessage::Commit { tick } => {
                match self.pending.remove(&tick) {
                    Some((batch, _)) => {
                        let rejected = self.ctx.replica.apply_committed(tick, &batch);
                        if rejected > 0 {
                            warn!("Tick {}: {} committed events did not apply", tick, rejected);
                        }
                        self.ctx.tick = self.ctx.tick.max(tick);
                        self.ctx.publish_world();
                    }
                    None => debug!("Commit for unknown tick {}", tick),
                }
                // The leader gates ticks in order, so anything older is abandoned
                self.pending = self.pending.split_off(&tick);
                None
            }
            ReplicaMessage::Heartbeat { leader_id, tick } => {
                if leader_id != self.leader {
                    warn!("Heartbeat from {} while following {}", leader_id, self.leader);
                }
                self.ctx.tick = tick;
                Some(tick)
            }
            ReplicaMessage::Welcome { leader_id, snapshot } => {
                let tick = snapshot.tick;
                info!("Re-welcomed by {} at tick {}", leader_id, tick);
                self.ctx.tick = tick;
                self.ctx.replica.restore(snapshot);
                self.pending.clear();
                self.ctx.publish_world();
                Some(tick)
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
                None
            }
            PeerMessage::LeaderAnnounce { from } if from < self.leader => {
                info!("Node {} switching from leader {} to {}", id, self.leader, from);
                Some(RoleExit::LeaderSwitch { leader: from })
            }
            PeerMessage::StateRequest { from } => {
                self.ctx.reply_state(from).await;
                None
            }
            other => {
                debug!("Follower ignoring {} from {}", other.kind(), inbound.from);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PeerConfig, Timings};
    use shared::{read_frame, ArenaRules, GameState, Replica, DEFAULT_LEVEL};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn free_addr() -> SocketAddr {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    /// Node 2 with a scripted node 1 listening where the leader's clients would.
    async fn follower_with_scripted_leader(timings: Timings) -> (NodeContext, TcpListener) {
        let leader = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peers = vec![
            PeerConfig {
                id: 1,
                control_addr: free_addr(),
                client_addr: leader.local_addr().unwrap(),
            },
            PeerConfig {
                id: 2,
                control_addr: free_addr(),
                client_addr: free_addr(),
            },
        ];
        let config = NodeConfig::new(2, peers, timings, 4, None).unwrap();
        let ctx = NodeContext::new(config, Arc::new(ArenaRules::default()))
            .await
            .unwrap();
        (ctx, leader)
    }

    async fn accept_and_welcome(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let hello: Hello = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello, Hello::Follower { server_id: 2 });

        let snapshot = Replica::new(
            GameState::from_layout(DEFAULT_LEVEL).unwrap(),
            Arc::new(ArenaRules::default()),
        )
        .snapshot(0);
        write_frame(
            &mut stream,
            &ReplicaMessage::Welcome {
                leader_id: 1,
                snapshot,
            },
        )
        .await
        .unwrap();
        stream
    }

    fn step_right() -> Vec<Event> {
        vec![Event::PlayerMove {
            player: 1,
            dx: 1,
            dy: 0,
        }]
    }

    #[tokio::test]
    async fn test_silent_leader_triggers_election() {
        let timings = Timings {
            heartbeat_timeout: 30,
            ..Timings::default()
        };
        let (mut ctx, listener) = follower_with_scripted_leader(timings).await;

        // Welcomes, then keeps the socket open without a word
        let leader = tokio::spawn(async move {
            let _stream = accept_and_welcome(&listener).await;
            std::future::pending::<()>().await;
        });

        let started = Instant::now();
        let exit = timeout(Duration::from_secs(5), run(&mut ctx, 1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, RoleExit::NeedElection);
        // 30 ticks at 60 Hz
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(ctx.tick >= 30);
        leader.abort();
    }

    #[tokio::test]
    async fn test_uncommitted_batch_times_out() {
        let timings = Timings {
            heartbeat_timeout: 6_000,
            commit_timeout: Duration::from_millis(300),
            ..Timings::default()
        };
        let (mut ctx, listener) = follower_with_scripted_leader(timings).await;

        let (acked_tx, acked_rx) = oneshot::channel();
        let leader = tokio::spawn(async move {
            let mut stream = accept_and_welcome(&listener).await;
            write_frame(
                &mut stream,
                &ReplicaMessage::Event {
                    tick: 5,
                    data: step_right(),
                },
            )
            .await
            .unwrap();
            let ack: FollowerMessage = read_frame(&mut stream).await.unwrap().unwrap();
            let _ = acked_tx.send(ack);
            std::future::pending::<()>().await;
        });

        let exit = timeout(Duration::from_secs(5), run(&mut ctx, 1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, RoleExit::NeedElection);
        assert_eq!(acked_rx.await.unwrap(), FollowerMessage::Ack { tick: 5 });
        // Never committed, so never applied
        assert_eq!(ctx.replica.state().players[&1].x, 0);
        leader.abort();
    }

    #[tokio::test]
    async fn test_batch_applies_only_after_commit() {
        let (mut ctx, listener) = follower_with_scripted_leader(Timings::default()).await;

        let leader = tokio::spawn(async move {
            let mut stream = accept_and_welcome(&listener).await;
            write_frame(
                &mut stream,
                &ReplicaMessage::Event {
                    tick: 3,
                    data: step_right(),
                },
            )
            .await
            .unwrap();
            let ack: FollowerMessage = read_frame(&mut stream).await.unwrap().unwrap();
            assert_eq!(ack, FollowerMessage::Ack { tick: 3 });
            write_frame(&mut stream, &ReplicaMessage::Commit { tick: 3 })
                .await
                .unwrap();
            // Give the commit time to land before the link drops
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let mut status = ctx.status();
        let exit = timeout(Duration::from_secs(5), run(&mut ctx, 1))
            .await
            .unwrap()
            .unwrap();

        // The scripted leader hung up
        assert_eq!(exit, RoleExit::NeedElection);
        assert_eq!(ctx.replica.state().players[&1].x, 1);
        assert!(ctx.tick >= 3);
        assert_eq!(status.borrow_and_update().world.players[&1].x, 1);
        leader.await.unwrap();
    }
}
