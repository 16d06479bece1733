//! Message kinds for both wire protocols.
//!
//! The control mesh between nodes carries [`PeerMessage`]. The leader's
//! client-facing listener carries everything else: a [`Hello`] frame
//! classifies the connection, after which a follower link exchanges
//! [`ReplicaMessage`]/[`FollowerMessage`] and a client link exchanges
//! [`ClientMessage`]/[`crate::ClientRequest`].

use crate::event::Event;
use crate::replica::Snapshot;
use crate::{NodeId, PlayerId, Tick};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    PeerHello { server_id: NodeId },
    CurrLeader { leader: Option<NodeId>, from: NodeId },
    Bully { from: NodeId },
    BullyOk { from: NodeId },
    LeaderAnnounce { from: NodeId },
    StateRequest { from: NodeId },
    CurrState { snapshot: Snapshot, from: NodeId },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::PeerHello { .. } => "peer_hello",
            PeerMessage::CurrLeader { .. } => "curr_leader",
            PeerMessage::Bully { .. } => "bully",
            PeerMessage::BullyOk { .. } => "bully_ok",
            PeerMessage::LeaderAnnounce { .. } => "leader_announce",
            PeerMessage::StateRequest { .. } => "state_request",
            PeerMessage::CurrState { .. } => "curr_state",
        }
    }
}

/// First frame on a connection to the leader's service listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    Client,
    Follower { server_id: NodeId },
}

/// Leader to follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMessage {
    Welcome { leader_id: NodeId, snapshot: Snapshot },
    Event { tick: Tick, data: Vec<Event> },
    Commit { tick: Tick },
    Heartbeat { leader_id: NodeId, tick: Tick },
}

/// Follower to leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowerMessage {
    Ack { tick: Tick },
}

/// Leader to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Init {
        snapshot: Snapshot,
        local_player: Option<PlayerId>,
    },
    Update {
        tick: Tick,
        data: Vec<Event>,
    },
    Clock {
        server_tick: Tick,
        timestamp: u64,
    },
}
