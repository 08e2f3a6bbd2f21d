//! TorrentChain CLI application

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use torrentchain::crypto::Keypair;
use torrentchain::{NodeConfig, TorrentChainNode};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "torrentchain-cli")]
#[command(about = "Peer-to-peer chunk distribution secured by a proof-of-useful-work chain")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Host to bind and advertise [default: 127.0.0.1]
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on [default: 21000]
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of peers [default: 10]
    #[arg(short = 'n', long)]
    max_peers: Option<usize>,

    /// JSON node configuration; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for chunk files (in-memory when absent)
    #[arg(short, long)]
    storage_dir: Option<PathBuf>,

    /// Hex ed25519 key file, created if missing
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a TorrentChain node
    Start {
        /// Peers to dial on startup, as host:port
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Initial mining difficulty
        #[arg(long)]
        difficulty: Option<u32>,
    },
    /// Generate a new keypair
    Keygen,
    /// Publish a file as one chunk to the given peers and mine it into a block
    Publish {
        file: PathBuf,

        #[arg(long = "peer")]
        peers: Vec<String>,
    },
    /// Show version information
    Version,
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NodeConfig> {
    match path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
        },
        None => Ok(NodeConfig::default()),
    }
}

/// Flags given on the command line win over the config file
fn apply_flags(cli: &Cli, mut config: NodeConfig, difficulty: Option<u32>) -> NodeConfig {
    if let Some(host) = &cli.host {
        config.network.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(max_peers) = cli.max_peers {
        config.network.max_peers = max_peers;
    }
    if let Some(difficulty) = difficulty {
        config.chain.initial_difficulty = difficulty;
    }
    config
}

async fn build_node(cli: &Cli, difficulty: Option<u32>) -> anyhow::Result<TorrentChainNode> {
    let config = load_config(cli.config.as_ref()).await?;
    let mut builder = TorrentChainNode::builder().with_config(apply_flags(cli, config, difficulty));
    if let Some(dir) = &cli.storage_dir {
        builder = builder.with_storage_dir(dir);
    }
    if let Some(key_file) = &cli.key_file {
        builder = builder.with_keypair(Keypair::load_or_generate(key_file).await?);
    }
    Ok(builder.build().await?)
}

async fn dial_all(node: &TorrentChainNode, peers: &[String]) {
    for peer in peers {
        if let Err(e) = node.connect_to_peer(peer).await {
            warn!("Could not connect to {}: {}", peer, e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match &cli.command {
        Some(Commands::Start { peers, difficulty }) => {
            let node = build_node(&cli, *difficulty).await?;
            node.start().await?;
            info!("Node {} started on port {}", node.id(), node.port());
            dial_all(&node, peers).await;

            tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;

            info!("Shutting down node...");
            node.stop().await?;
        },
        None => {
            let node = build_node(&cli, None).await?;
            node.start().await?;
            info!("Node {} started on port {}", node.id(), node.port());
            tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
            node.stop().await?;
        },
        Some(Commands::Keygen) => {
            let keypair = Keypair::generate();
            println!("Generated new keypair:");
            println!("Private key: {}", keypair.secret_hex());
            println!("Public key: {}", keypair.public_key_hex());
        },
        Some(Commands::Publish { file, peers }) => {
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let node = build_node(&cli, None).await?;
            node.start().await?;
            dial_all(&node, peers).await;

            let chunk_hash = node.publish_chunk(&data, peers.clone()).await?;
            println!("Chunk: {}", chunk_hash);
            if let Some(block) = node.mine().await? {
                println!("Block {}: {}", block.index, block.hash);
            }
            node.stop().await?;
        },
        Some(Commands::Version) => {
            println!("TorrentChain Rust v{}", torrentchain::VERSION);
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config() -> NodeConfig {
        serde_json::from_str(
            r#"{ "network": { "host": "0.0.0.0", "port": 0, "max_peers": 4 }, "chain": { "initial_difficulty": 3 } }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_config_file_applies_without_flags() {
        let cli = Cli::parse_from(["torrentchain-cli", "--config", "node.json", "start"]);
        let config = apply_flags(&cli, file_config(), None);
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.network.port, 0);
        assert_eq!(config.network.max_peers, 4);
        assert_eq!(config.chain.initial_difficulty, 3);
    }

    #[test]
    fn test_flags_override_config_file() {
        let cli = Cli::parse_from([
            "torrentchain-cli",
            "--config",
            "node.json",
            "--port",
            "21005",
            "--max-peers",
            "2",
            "start",
            "--difficulty",
            "1",
        ]);
        let difficulty = match &cli.command {
            Some(Commands::Start { difficulty, .. }) => *difficulty,
            _ => None,
        };
        let config = apply_flags(&cli, file_config(), difficulty);
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.network.port, 21005);
        assert_eq!(config.network.max_peers, 2);
        assert_eq!(config.chain.initial_difficulty, 1);
    }

    #[test]
    fn test_defaults_without_config_file() {
        let cli = Cli::parse_from(["torrentchain-cli"]);
        let config = apply_flags(&cli, NodeConfig::default(), None);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.port, torrentchain::DEFAULT_PORT);
        assert_eq!(config.network.max_peers, torrentchain::DEFAULT_MAX_PEERS);
    }
}
