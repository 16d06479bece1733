//! Node Controller: picks the initial role, runs it, and moves between
//! Leader and Follower until the process is stopped.
//!
//! ```text
//! Startup -> discover leader -> [state transfer] -> Leader | Follower
//!                                                       |
//!            Demoted / LeaderSwitch -> Follower <-------+
//!            NeedElection -> bully election -> Leader | Follower
//! ```
//!
//! Only one role runs at a time and each role releases its sockets
//! before returning, so the client-facing listener is never held twice.

use crate::config::NodeConfig;
use crate::election::{Action, Election, Outcome};
use crate::peers::{Inbound, PeerLinks};
use crate::{follower, leader};
use log::{debug, info, warn};
use shared::{ArenaRules, GameState, NodeId, PeerMessage, Replica, Tick, Transition};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    Leader,
    Follower { leader: NodeId },
}

/// Why a role loop returned control to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleExit {
    /// A lower id announced itself while this node was leading.
    Demoted { leader: NodeId },
    /// The leader went silent or unreachable.
    NeedElection,
    /// A lower id than the current leader announced itself.
    LeaderSwitch { leader: NodeId },
}

/// Externally observable node state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// `None` while discovering or electing.
    pub role: Option<ClusterRole>,
    pub tick: Tick,
    /// World as of the last applied batch or snapshot.
    pub world: Arc<GameState>,
}

/// Everything a role needs, lent to it for the duration of its loop.
pub struct NodeContext {
    pub config: NodeConfig,
    pub replica: Replica,
    pub tick: Tick,
    pub peers: PeerLinks,
    pub inbox: mpsc::UnboundedReceiver<Inbound>,
    status: watch::Sender<NodeStatus>,
}

impl NodeContext {
    /// Builds the static world and starts the peer mesh.
    pub async fn new(config: NodeConfig, rules: Arc<dyn Transition>) -> Result<Self, BoxError> {
        let world = config.initial_world()?;
        let (peers, inbox) = PeerLinks::start(&config).await?;
        let (status, _) = watch::channel(NodeStatus {
            role: None,
            tick: 0,
            world: Arc::new(world.clone()),
        });

        Ok(Self {
            config,
            replica: Replica::new(world, rules),
            tick: 0,
            peers,
            inbox,
            status,
        })
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    /// Answers a `StateRequest` with this node's snapshot.
    pub async fn reply_state(&self, to: NodeId) {
        let snapshot = self.replica.snapshot(self.tick);
        let sent = self
            .peers
            .send_to(
                to,
                PeerMessage::CurrState {
                    snapshot,
                    from: self.id(),
                },
            )
            .await;
        if sent {
            info!("Node {} sent state at tick {} to node {}", self.id(), self.tick, to);
        } else {
            warn!("Node {} could not send state to node {}", self.id(), to);
        }
    }

    pub fn publish_tick(&self) {
        let tick = self.tick;
        self.status.send_if_modified(|status| {
            let changed = status.tick != tick;
            status.tick = tick;
            changed
        });
    }

    pub fn publish_world(&self) {
        let world = Arc::new(self.replica.state().clone());
        let tick = self.tick;
        self.status.send_modify(|status| {
            status.world = world;
            status.tick = tick;
        });
    }

    fn publish_role(&self, role: Option<ClusterRole>) {
        self.status.send_modify(|status| status.role = role);
    }
}

enum Discovery {
    NoPeers,
    NoLeader,
    Leader(NodeId),
}

pub struct Node {
    ctx: NodeContext,
}

impl Node {
    /// Binds the control listener and starts linking to peers, using the
    /// built-in arena rules.
    pub async fn start(config: NodeConfig) -> Result<Self, BoxError> {
        Self::with_rules(config, Arc::new(ArenaRules::default())).await
    }

    pub async fn with_rules(
        config: NodeConfig,
        rules: Arc<dyn Transition>,
    ) -> Result<Self, BoxError> {
        Ok(Self {
            ctx: NodeContext::new(config, rules).await?,
        })
    }

    pub fn id(&self) -> NodeId {
        self.ctx.id()
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.ctx.status()
    }

    /// Runs roles until an unrecoverable error, then closes every peer link.
    pub async fn run(mut self) -> Result<(), BoxError> {
        let result = self.run_roles().await;
        self.ctx.peers.shutdown().await;
        result
    }

    async fn run_roles(&mut self) -> Result<(), BoxError> {
        let mut role = self.initial_role().await?;

        loop {
            info!("Node {} entering {:?} at tick {}", self.id(), role, self.ctx.tick);
            self.ctx.publish_role(Some(role));

            let exit = match role {
                ClusterRole::Leader => leader::run(&mut self.ctx).await?,
                ClusterRole::Follower { leader } => follower::run(&mut self.ctx, leader).await?,
            };
            info!("Node {} left {:?}: {:?}", self.id(), role, exit);
            self.ctx.publish_role(None);

            role = match exit {
                RoleExit::Demoted { leader } | RoleExit::LeaderSwitch { leader } => {
                    ClusterRole::Follower { leader }
                }
                RoleExit::NeedElection => self.elect().await?,
            };
        }
    }

    async fn initial_role(&mut self) -> Result<ClusterRole, BoxError> {
        match self.discover_leader().await? {
            Discovery::NoPeers => {
                info!("Node {} found no peers, starting as leader", self.id());
                Ok(ClusterRole::Leader)
            }
            Discovery::NoLeader => self.elect().await,
            Discovery::Leader(leader) => {
                self.transfer_state(leader).await?;
                if self.id() < leader {
                    // Entering the leader role announces us, demoting `leader`.
                    Ok(ClusterRole::Leader)
                } else {
                    Ok(ClusterRole::Follower { leader })
                }
            }
        }
    }

    /// Collects `CurrLeader` reports until every peer has answered or the
    /// discovery timeout expires, and returns the lowest reported leader.
    async fn discover_leader(&mut self) -> Result<Discovery, BoxError> {
        let id = self.id();
        let expected = self.ctx.config.others().count();
        let deadline =
            tokio::time::Instant::now() + self.ctx.config.timings.discovery_timeout;
        let mut reports: BTreeMap<NodeId, Option<NodeId>> = BTreeMap::new();

        while reports.len() < expected {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                inbound = self.ctx.inbox.recv() => {
                    let Inbound { from, message } = inbound.ok_or("peer inbox closed")?;
                    match message {
                        PeerMessage::CurrLeader { leader, .. } => {
                            reports.insert(from, leader.filter(|&l| l != id));
                        }
                        PeerMessage::LeaderAnnounce { from: leader } => {
                            reports.insert(from, Some(leader));
                        }
                        PeerMessage::Bully { from: challenger } if challenger > id => {
                            self.ctx
                                .peers
                                .send_to(challenger, PeerMessage::BullyOk { from: id })
                                .await;
                        }
                        PeerMessage::StateRequest { from: requester } => {
                            self.ctx.reply_state(requester).await;
                        }
                        other => debug!("Discovery ignoring {} from {}", other.kind(), from),
                    }
                }
            }
        }

        info!("Node {} discovery reports: {:?}", id, reports);
        if reports.is_empty() {
            return Ok(Discovery::NoPeers);
        }
        Ok(match reports.values().flatten().min() {
            Some(&leader) => Discovery::Leader(leader),
            None => Discovery::NoLeader,
        })
    }

    /// Replaces the local world with `leader`'s, keeping the static world
    /// if no answer arrives in time.
    async fn transfer_state(&mut self, leader: NodeId) -> Result<(), BoxError> {
        let id = self.id();
        let requested = self
            .ctx
            .peers
            .send_to(leader, PeerMessage::StateRequest { from: id })
            .await;
        if !requested {
            warn!("Node {} has no link to presumed leader {}", id, leader);
            return Ok(());
        }

        let deadline =
            tokio::time::Instant::now() + self.ctx.config.timings.state_transfer_timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Node {} timed out waiting for state from node {}", id, leader);
                    return Ok(());
                }
                inbound = self.ctx.inbox.recv() => {
                    let Inbound { from, message } = inbound.ok_or("peer inbox closed")?;
                    match message {
                        PeerMessage::CurrState { snapshot, .. } if from == leader => {
                            info!(
                                "Node {} received state for tick {} from node {}",
                                id, snapshot.tick, leader
                            );
                            self.ctx.tick = snapshot.tick;
                            self.ctx.replica.restore(snapshot);
                            self.ctx.publish_world();
                            return Ok(());
                        }
                        PeerMessage::StateRequest { from: requester } => {
                            self.ctx.reply_state(requester).await;
                        }
                        other => debug!("State transfer ignoring {} from {}", other.kind(), from),
                    }
                }
            }
        }
    }

    async fn elect(&mut self) -> Result<ClusterRole, BoxError> {
        debug!(
            "Node {} dropping leader belief {:?}",
            self.id(),
            self.ctx.peers.leader()
        );
        self.ctx.peers.set_leader(None);
        let mut election = Election::new(self.id(), self.ctx.config.timings.election_timeout);
        let actions = election.start(Instant::now());
        self.perform(actions).await;

        loop {
            if let Some(outcome) = election.outcome() {
                info!(
                    "Node {} election settled on {:?} after {} round(s)",
                    self.id(),
                    outcome,
                    election.rounds()
                );
                return Ok(match outcome {
                    Outcome::Leader => ClusterRole::Leader,
                    Outcome::Follower(leader) => ClusterRole::Follower { leader },
                });
            }

            let deadline = election
                .deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let actions = election.poll(Instant::now());
                    self.perform(actions).await;
                }
                inbound = self.ctx.inbox.recv() => {
                    let Inbound { from, message } = inbound.ok_or("peer inbox closed")?;
                    if let PeerMessage::StateRequest { from: requester } = message {
                        self.ctx.reply_state(requester).await;
                    } else {
                        let actions = election.handle(from, &message, Instant::now());
                        self.perform(actions).await;
                    }
                }
            }
        }
    }

    async fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(message) => {
                    let reached = self.ctx.peers.broadcast(message).await;
                    debug!("Node {} broadcast reached {} peers", self.id(), reached);
                }
                Action::SendTo(peer, message) => {
                    self.ctx.peers.send_to(peer, message).await;
                }
            }
        }
    }
}
