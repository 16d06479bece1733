//! Follower registry and per-tick acknowledgement tracking.

use crate::network::ConnId;
use log::{info, warn};
use shared::{NodeId, ReplicaMessage, Tick};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;

struct FollowerLink {
    conn: ConnId,
    outbound: mpsc::UnboundedSender<ReplicaMessage>,
}

/// Followers currently counted towards the quorum.
///
/// Entries are keyed by server id and tagged with the connection they
/// arrived on, so a stale disconnect from a replaced connection cannot
/// remove the live one.
#[derive(Default)]
pub struct FollowerSet {
    followers: BTreeMap<NodeId, FollowerLink>,
}

impl FollowerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        server_id: NodeId,
        conn: ConnId,
        outbound: mpsc::UnboundedSender<ReplicaMessage>,
    ) {
        if self
            .followers
            .insert(server_id, FollowerLink { conn, outbound })
            .is_some()
        {
            info!("Follower {} reconnected, replacing its old link", server_id);
        } else {
            info!("Follower {} joined the quorum", server_id);
        }
    }

    /// Removes `server_id` only if it is still on connection `conn`.
    pub fn remove(&mut self, server_id: NodeId, conn: ConnId) -> bool {
        match self.followers.get(&server_id) {
            Some(link) if link.conn == conn => {
                self.followers.remove(&server_id);
                info!("Follower {} left the quorum", server_id);
                true
            }
            _ => false,
        }
    }

    /// Drops a follower from the quorum and closes its connection.
    pub fn evict(&mut self, server_id: NodeId) -> bool {
        let evicted = self.followers.remove(&server_id).is_some();
        if evicted {
            warn!("Evicted follower {} from the quorum", server_id);
        }
        evicted
    }

    pub fn contains(&self, server_id: NodeId) -> bool {
        self.followers.contains_key(&server_id)
    }

    pub fn send(&mut self, server_id: NodeId, message: ReplicaMessage) -> bool {
        let delivered = self
            .followers
            .get(&server_id)
            .is_some_and(|link| link.outbound.send(message).is_ok());
        if !delivered && self.followers.remove(&server_id).is_some() {
            warn!("Follower {} link is gone", server_id);
        }
        delivered
    }

    /// Sends to every follower and returns the ids that could not be reached;
    /// those are no longer members.
    pub fn broadcast(&mut self, message: &ReplicaMessage) -> Vec<NodeId> {
        let dead: Vec<NodeId> = self
            .followers
            .iter()
            .filter(|(_, link)| link.outbound.send(message.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.followers.remove(id);
            warn!("Follower {} link is gone", id);
        }
        dead
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.followers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.followers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.followers.is_empty()
    }
}

/// Outstanding acknowledgements for one proposed batch.
#[derive(Debug)]
pub struct Proposal {
    tick: Tick,
    waiting: BTreeSet<NodeId>,
    attempts: u32,
}

impl Proposal {
    pub fn new<I: IntoIterator<Item = NodeId>>(tick: Tick, followers: I) -> Self {
        Self {
            tick,
            waiting: followers.into_iter().collect(),
            attempts: 0,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Records an ack. Acks for other ticks and repeated acks are ignored.
    pub fn ack(&mut self, server_id: NodeId, tick: Tick) -> bool {
        tick == self.tick && self.waiting.remove(&server_id)
    }

    /// Stops waiting for a follower that left the quorum.
    pub fn forget(&mut self, server_id: NodeId) {
        self.waiting.remove(&server_id);
    }

    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Followers that have not acked yet, in id order.
    pub fn silent(&self) -> Vec<NodeId> {
        self.waiting.iter().copied().collect()
    }
}
