use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use destra::{write_key_files, Cli, Command, Keypair, Node, NodeConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Command::Keygen { force }) => keygen(&cli.node, force),
        None => run(cli.node).await,
    };
    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
}

fn keygen(config: &NodeConfig, force: bool) -> Result<()> {
    if force {
        for path in [&config.private_key_path, &config.public_key_path] {
            if path.exists() {
                std::fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
    }
    let keypair = Keypair::generate();
    write_key_files(&keypair, &config.private_key_path, &config.public_key_path)?;
    info!(
        peer = %keypair.peer_id(),
        private = %config.private_key_path.display(),
        public = %config.public_key_path.display(),
        "identity written"
    );
    println!("{}", keypair.peer_id());
    Ok(())
}

async fn run(config: NodeConfig) -> Result<()> {
    let announcer = config.announcer().context("invalid registry configuration")?;

    let node = match Node::start(config.node_options()).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("startup failed at step '{}': {e}", e.step());
            process::exit(1);
        }
    };

    let peers = node.bootstrap().await;
    info!(peers, "routing table populated");

    match node.announce(&announcer).await {
        Ok(Some(receipt)) => info!(tx = %receipt.tx_hash, "registry updated"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "registry announcement failed, node keeps running"),
    }

    info!(
        peer = %node.peer_id(),
        listen = %node.listen_multiaddr(),
        "all set, bootstrap node is up and running"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    node.shutdown().await;
    Ok(())
}
