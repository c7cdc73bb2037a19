use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use teapotnet::{Config, Keypair, Node};

#[derive(Parser, Debug)]
#[command(name = "teapotnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON); missing files use defaults.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the listen port from the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Tracker to announce to, e.g. tracker.example.org.
    #[arg(short, long)]
    tracker: Option<String>,

    /// Peers to connect to directly at startup.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// File holding the node's PKCS#8 key; created when absent.
    #[arg(short, long, default_value = "node.key")]
    key: PathBuf,

    /// Seconds between status log lines.
    #[arg(long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.tracker.is_some() {
        config.tracker = args.tracker.clone();
    }

    let keypair = load_or_create_keypair(&args.key)?;
    let node = Node::bind_with_keypair(config, keypair).await?;
    info!("Node identity: {}", node.node_id());

    if !args.bootstrap.is_empty() {
        match node.bootstrap(&args.bootstrap).await {
            Ok(true) => info!("Bootstrap complete"),
            Ok(false) => warn!("Bootstrap found no reachable peer"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut status = time::interval(Duration::from_secs(args.status_interval.max(1)));
    status.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting");
                break;
            }
            _ = status.tick() => {
                info!(
                    neighbors = node.neighbor_count(),
                    sessions = node.network().session_count(),
                    "status"
                );
            }
        }
    }

    Ok(())
}

fn load_or_create_keypair(path: &PathBuf) -> Result<Keypair> {
    if path.exists() {
        let der = std::fs::read(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        return Keypair::from_pkcs8_der(&der);
    }

    info!("Generating RSA key (this takes a moment)...");
    let keypair = Keypair::generate()?;
    std::fs::write(path, keypair.private_key_pkcs8_der()?)
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    Ok(keypair)
}
