//! # Arena Cluster Server Library
//!
//! This library provides a replicated, authoritative server for the grid
//! arena game. Several nodes run side by side; exactly one leads at a time
//! and every state transition it makes is replicated to the others before
//! any client is allowed to see it.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The leader runs the only clock that matters. Each tick it admits client
//! requests, fires due timers and records every event that took effect in
//! an ordered batch. The world itself lives in a [`shared::Replica`] and
//! is mutated only by the tick loop.
//!
//! ### Primary-Backup Replication
//! A non-empty batch is proposed to every follower, gated on all of their
//! acknowledgements (with bounded retries and eviction of followers that
//! stay silent), committed, and only then published to clients. Followers
//! apply a batch strictly after its commit.
//!
//! ### Failure Detection and Election
//! Followers expect a heartbeat every few ticks. When the leader goes
//! silent or its link drops they run a bully election over the control
//! mesh; the lowest reachable id wins and announces itself.
//!
//! ## Module Organization
//!
//! ### Configuration (`config`)
//! Static peer list, protocol timings and level layout.
//!
//! ### Peer Link Manager (`peers`)
//! Full mesh of control connections with automatic redial, a shared
//! inbound queue and the advertised leader belief.
//!
//! ### Election Module (`election`)
//! Bully algorithm as a pure state machine driven by the node controller.
//!
//! ### Network Module (`network`)
//! The leader's client-facing listener, which classifies each connection
//! as a game client or a follower by its first frame.
//!
//! ### Client Manager (`client_manager`) and Replication (`replication`)
//! Registries of connected clients and followers, plus per-tick ack
//! tracking.
//!
//! ### Roles (`leader`, `follower`) and Node Controller (`node`)
//! The two role loops and the state machine that moves between them.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::{parse_peer, NodeConfig, Timings};
//! use server::node::Node;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let peers = vec![
//!         parse_peer("1=127.0.0.1:7001,127.0.0.1:8001")?,
//!         parse_peer("2=127.0.0.1:7002,127.0.0.1:8002")?,
//!         parse_peer("3=127.0.0.1:7003,127.0.0.1:8003")?,
//!     ];
//!     let config = NodeConfig::new(1, peers, Timings::default(), 16, None)?;
//!
//!     // Discovers the current leader, transfers state if needed, then
//!     // runs the leader or follower role until the process is stopped.
//!     Node::start(config).await?.run().await
//! }
//! ```
//!
//! ## Known Limitations
//!
//! A partitioned minority may elect its own leader. When the partition
//! heals the lower id wins and the other side is overwritten by its
//! snapshot; state already published by the losing side is not rolled
//! back for clients.

pub mod client_manager;
pub mod config;
pub mod election;
pub mod follower;
pub mod leader;
pub mod network;
pub mod node;
pub mod peers;
pub mod replication;
