#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod config;
mod shutdown;

use clap::Parser;
use std::path::PathBuf;
use strata_cluster::NodeCoordinator;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stratad")]
#[command(about = "Strata - sharded metadata node daemon")]
#[command(version)]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    node_id: Option<u32>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Cluster roster as host:port:id entries
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    let mut node_config = match &args.config {
        Some(path) => match config::NodeConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => config::NodeConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        node_config.node_id = node_id;
    }
    if let Some(port) = args.port {
        node_config.listen_port = port;
    }
    if !args.peers.is_empty() {
        node_config.peer_servers = args.peers.clone();
    }

    init_tracing(&node_config.log_filter);

    info!(
        target: "strata",
        node_id = node_config.node_id,
        listen_port = node_config.listen_port,
        cluster_size = node_config.peer_servers.len(),
        "Starting stratad v{}",
        env!("CARGO_PKG_VERSION")
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let shutdown_signal = shutdown::install_signal_handlers(shutdown_tx.clone());

    let coordinator = NodeCoordinator::new(node_config.cluster_config());
    if let Err(e) = coordinator.start().await {
        error!(target: "strata", error = %e, "Failed to start node");
        std::process::exit(1);
    }

    // Log controller changes as they settle
    let mut controller_watch = coordinator.controller_watch();
    let watch_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut shutdown_rx = watch_shutdown;
        loop {
            tokio::select! {
                changed = controller_watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(controller) = *controller_watch.borrow() {
                        info!(target: "strata", controller, "Cluster controller settled");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    shutdown_signal.await;

    coordinator.shutdown().await;
    info!(target: "strata", "stratad shutdown complete");
}

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &std::path::Path) -> std::io::Result<()> {
    let config = config::NodeConfig::default();

    let content = format!(
        r#"# Strata node configuration
# Generated by: stratad --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# Unique node identifier within the cluster
node_id = {}

# Port for peer connections
listen_port = {}

# Hostname announced to peers
advertise_host = "{}"

# Full cluster roster as "host:port:id", this node included
# Example: ["node1:8001:1", "node2:8002:2", "node3:8003:3"]
peer_servers = []

# Workers draining the inbound packet queue
worker_count = {}

# Inbound packet queue capacity
inbound_queue = {}

# Reconnect attempts per peer before giving up (-1 = unlimited)
reconnect_retry_limit = {}

# Default timeout for synchronous requests in milliseconds
request_timeout_ms = {}

# Log filter applied when RUST_LOG is unset
log_filter = "{}"
"#,
        path.display(),
        config.node_id,
        config.listen_port,
        config.advertise_host,
        config.worker_count,
        config.inbound_queue,
        config.reconnect_retry_limit,
        config.request_timeout_ms,
        config.log_filter,
    );

    std::fs::write(path, content)
}
