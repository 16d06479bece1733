use clap::Parser;
use log::{error, info};
use server::config::{parse_peer, NodeConfig, PeerConfig, Timings};
use server::node::Node;
use std::time::Duration;

/// Replicated arena game server node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// This node's id; lower ids win elections
    #[arg(long)]
    id: u32,

    /// Cluster member as ID=CONTROL_ADDR,CLIENT_ADDR (repeat for every node, this one included)
    #[arg(long = "peer", value_parser = parse_peer, required = true)]
    peers: Vec<PeerConfig>,

    /// Simulation ticks per second
    #[arg(long, default_value = "60")]
    tick_rate: u32,

    /// Ticks between leader heartbeats
    #[arg(long, default_value = "30")]
    heartbeat_interval: u64,

    /// Ticks without a heartbeat before a follower calls an election
    #[arg(long, default_value = "120")]
    heartbeat_timeout: u64,

    #[arg(long, default_value = "200")]
    election_timeout_ms: u64,

    /// How long to wait for peers to report their leader at startup
    #[arg(long, default_value = "2000")]
    discovery_timeout_ms: u64,

    #[arg(long, default_value = "2000")]
    state_transfer_timeout_ms: u64,

    /// Per-attempt wait for follower acknowledgements
    #[arg(long, default_value = "250")]
    ack_timeout_ms: u64,

    /// Proposal attempts before silent followers are evicted
    #[arg(long, default_value = "4")]
    max_proposal_attempts: u32,

    /// How long a follower holds an uncommitted batch before giving up on the leader
    #[arg(long, default_value = "2000")]
    commit_timeout_ms: u64,

    #[arg(long, default_value = "1000")]
    reconnect_interval_ms: u64,

    /// Maximum concurrent game clients
    #[arg(long, default_value = "16")]
    max_clients: usize,

    /// Text level layout: '#' wall, '.' floor, '1'-'9' player spawn
    #[arg(long)]
    level: Option<std::path::PathBuf>,
}

impl Args {
    fn timings(&self) -> Timings {
        Timings {
            tick_rate: self.tick_rate,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            state_transfer_timeout: Duration::from_millis(self.state_transfer_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_proposal_attempts: self.max_proposal_attempts,
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let level = match &args.level {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };
    let timings = args.timings();
    let config = NodeConfig::new(args.id, args.peers, timings, args.max_clients, level)?;

    info!(
        "Starting node {} of {} at {} Hz",
        config.id,
        config.peers.len(),
        config.timings.tick_rate
    );

    let node = Node::start(config).await?;

    tokio::select! {
        result = node.run() => {
            if let Err(e) = &result {
                error!("Node stopped: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
