//! Meshcore node binary.
//!
//! Starts the full connection core: DHT, direct-TLS listener, hole
//! punching, relay, and gossip, then idles until interrupted.

use clap::Parser;
use meshcore::config::{Config, ListenMode};
use meshcore::identity::NodeId;
use meshcore::wiring::Node;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "meshcore", version, about = "Meshcore: peer-to-peer connection core")]
struct Args {
    /// Direct TLS listen port
    #[arg(short, long, default_value = "8888")]
    port: u16,

    /// DHT UDP port
    #[arg(long, default_value = "8889")]
    dht_port: u16,

    /// Hole punch UDP port
    #[arg(long, default_value = "8890")]
    punch_port: u16,

    /// Data directory (identity, peer cache)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// DHT seed nodes (comma-separated host:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Display name announced to peers
    #[arg(short, long)]
    name: Option<String>,

    /// Volunteer as a relay for other peers
    #[arg(long)]
    volunteer_relay: bool,

    /// Listen on IPv4 only (default is dual-stack)
    #[arg(long)]
    ipv4_only: bool,

    /// Optional JSON config file; CLI flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connect to this peer after startup (node-<32 hex>)
    #[arg(long)]
    connect: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcore=info")),
        )
        .init();

    let args = Args::parse();
    info!("Meshcore v{}", VERSION);

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot load config {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    config.data_dir = args.data_dir;
    config.p2p.listen_port = args.port;
    config.dht.port = args.dht_port;
    config.hole_punch.port = args.punch_port;
    config.relay.volunteer |= args.volunteer_relay;
    if args.ipv4_only {
        config.p2p.listen_mode = ListenMode::Ipv4;
    }
    if let Some(name) = args.name {
        config.display_name = Some(name);
    }
    if let Some(seeds) = args.seeds {
        config.dht.seed_nodes = seeds.split(',').map(str::trim).map(String::from).collect();
    }

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("Node startup failed: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Node {} listening on port {} (dht {}, punch {})",
        node.node_id,
        node.p2p.listen_port(),
        node.dht.advertise_port(),
        node.punch.as_ref().map(|p| p.local_port()).unwrap_or(0),
    );

    if let Some(target) = args.connect {
        match NodeId::parse(&target) {
            Ok(target) => match node.connect(&target).await {
                Ok(connection) => info!(
                    "Connected to {} via {}",
                    target,
                    connection.strategy_used().unwrap_or_else(|| "?".into())
                ),
                Err(e) => error!("Connect to {} failed: {}", target, e),
            },
            Err(e) => error!("Invalid node id '{}': {}", target, e),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Interrupt received, shutting down");
    node.shutdown().await;
}
