//! # Arena Client Library
//!
//! A headless client for the replicated arena server. It connects to
//! whichever cluster node is currently leading, mirrors the authoritative
//! world and, optionally, plays as a bot.
//!
//! ## Architecture Overview
//!
//! ### No Prediction
//! The leader only publishes a batch after every follower has acknowledged
//! it, so what the client receives is already final. The mirror replays
//! each batch through the same transition function the servers use and
//! never guesses ahead.
//!
//! ### Failover
//! Only the leader accepts client connections. When the link drops the
//! client forgets its mirror and walks the configured server list until
//! some node answers, which after an election is the new leader. The fresh
//! `Init` snapshot replaces whatever was known before.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The local mirror: snapshot restore, batch replay and clock offset.
//!
//! ### Input Module (`input`)
//! A random bot that only issues moves and bomb drops the mirror says are
//! legal.
//!
//! ### Network Module (`network`)
//! Framed TCP connection to the leader and the reconnecting session loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new(ClientConfig {
//!         servers: vec!["127.0.0.1:8001".into(), "127.0.0.1:8002".into()],
//!         bot: true,
//!         ..ClientConfig::default()
//!     });
//!     client.run().await
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
