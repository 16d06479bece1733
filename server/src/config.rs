//! Static cluster configuration.
//!
//! Every node is started with the full peer list, its own entry included.
//! Membership never changes at runtime.

use shared::{GameState, LevelError, NodeId, Tick, DEFAULT_LEVEL, DEFAULT_TICK_RATE};
use std::collections::BTreeMap;
use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("peer {0:?} is not of the form ID=CONTROL_ADDR,CLIENT_ADDR")]
    MalformedPeer(String),
    #[error("peer id {0:?} is not a number")]
    InvalidId(String),
    #[error("invalid address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("node {0} is listed more than once")]
    DuplicatePeer(NodeId),
    #[error("node {0} is not in the peer list")]
    MissingSelf(NodeId),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid level: {0}")]
    Level(#[from] LevelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: NodeId,
    /// Node-to-node control mesh.
    pub control_addr: SocketAddr,
    /// Game clients, and followers while this node leads.
    pub client_addr: SocketAddr,
}

/// Parses `ID=CONTROL_ADDR,CLIENT_ADDR`, e.g. `1=127.0.0.1:7001,127.0.0.1:8001`.
pub fn parse_peer(arg: &str) -> Result<PeerConfig, ConfigError> {
    let (id, addrs) = arg
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedPeer(arg.to_string()))?;
    let (control, client) = addrs
        .split_once(',')
        .ok_or_else(|| ConfigError::MalformedPeer(arg.to_string()))?;

    let id = id
        .trim()
        .parse::<NodeId>()
        .map_err(|_| ConfigError::InvalidId(id.to_string()))?;

    Ok(PeerConfig {
        id,
        control_addr: parse_addr(control)?,
        client_addr: parse_addr(client)?,
    })
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.trim()
        .parse()
        .map_err(|source| ConfigError::InvalidAddress {
            addr: addr.to_string(),
            source,
        })
}

/// Protocol timings. Tick-denominated values follow the leader's clock.
#[derive(Debug, Clone)]
pub struct Timings {
    pub tick_rate: u32,
    pub heartbeat_interval: Tick,
    pub heartbeat_timeout: Tick,
    pub election_timeout: Duration,
    pub discovery_timeout: Duration,
    pub state_transfer_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_proposal_attempts: u32,
    pub commit_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            heartbeat_interval: 30,
            heartbeat_timeout: 120,
            election_timeout: Duration::from_millis(200),
            discovery_timeout: Duration::from_millis(2000),
            state_transfer_timeout: Duration::from_millis(2000),
            ack_timeout: Duration::from_millis(250),
            max_proposal_attempts: 4,
            commit_timeout: Duration::from_millis(2000),
            reconnect_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub peers: BTreeMap<NodeId, PeerConfig>,
    pub timings: Timings,
    pub max_clients: usize,
    /// Text layout of the world a fresh leader starts from.
    pub level: String,
}

impl NodeConfig {
    pub fn new(
        id: NodeId,
        peers: Vec<PeerConfig>,
        timings: Timings,
        max_clients: usize,
        level: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut table = BTreeMap::new();
        for peer in peers {
            let peer_id = peer.id;
            if table.insert(peer_id, peer).is_some() {
                return Err(ConfigError::DuplicatePeer(peer_id));
            }
        }

        let config = Self {
            id,
            peers: table,
            timings,
            max_clients,
            level: level.unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.peers.contains_key(&self.id) {
            return Err(ConfigError::MissingSelf(self.id));
        }
        if self.timings.tick_rate == 0 {
            return Err(ConfigError::Zero("tick rate"));
        }
        if self.timings.heartbeat_interval == 0 {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if self.timings.heartbeat_timeout == 0 {
            return Err(ConfigError::Zero("heartbeat timeout"));
        }
        if self.timings.max_proposal_attempts == 0 {
            return Err(ConfigError::Zero("max proposal attempts"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Zero("max clients"));
        }
        self.initial_world()?;
        Ok(())
    }

    pub fn initial_world(&self) -> Result<GameState, LevelError> {
        GameState::from_layout(&self.level)
    }

    pub fn peer(&self, id: NodeId) -> Option<&PeerConfig> {
        self.peers.get(&id)
    }

    pub fn own(&self) -> Option<&PeerConfig> {
        self.peers.get(&self.id)
    }

    /// Every configured node except this one, in id order.
    pub fn others(&self) -> impl Iterator<Item = &PeerConfig> + '_ {
        self.peers.values().filter(move |p| p.id != self.id)
    }
}
