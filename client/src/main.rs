use clap::Parser;
use client::network::{Client, ClientConfig};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Client address of a cluster node (repeat for every node)
    #[arg(short = 's', long = "server", default_value = "127.0.0.1:8001")]
    servers: Vec<String>,

    /// Play automatically with random moves and bombs
    #[arg(long)]
    bot: bool,

    /// Bot actions per second
    #[arg(long, default_value = "2.0")]
    actions_per_second: f64,

    /// Pause between reconnection sweeps
    #[arg(long, default_value = "500")]
    reconnect_delay_ms: u64,

    /// Log the arena on every n-th clock sync (0 disables)
    #[arg(long, default_value = "1")]
    render_every: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Cluster: {}", args.servers.join(", "));
    if args.bot {
        info!("Bot enabled at {} actions/s", args.actions_per_second);
    }

    let mut client = Client::new(ClientConfig {
        servers: args.servers,
        bot: args.bot,
        actions_per_second: args.actions_per_second,
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        render_every: args.render_every,
    });

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
    }

    Ok(())
}
