//! Agora CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::U256;
use alloy_signer_local::PrivateKeySigner;
use clap::{Args, Parser, Subcommand};
use eyre::Result;
use tracing::info;

use agora_node::{AgoraNode, LogArgs, NodeConfig, init_logging};
use agora_overlay::{LocalOverlayNetwork, Overlay, PeerInfo};
use agora_primitives::{PeerId, wei};
use agora_settlement::{ChainBackend, mock::MockChainBackend};

/// Agora - peer-to-peer agent network node.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct AgoraCli {
    /// Logging configuration (applies to all subcommands).
    #[command(flatten)]
    pub logs: LogArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: AgoraCommands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum AgoraCommands {
    /// Run an Agora node.
    Node(NodeArgs),
}

/// Arguments for the `node` command.
#[derive(Debug, Args)]
pub struct NodeArgs {
    /// Directory for the ledger and node state.
    #[arg(long = "data-dir", default_value = "./agora-data")]
    pub data_dir: PathBuf,

    /// Capabilities to advertise, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub capabilities: Vec<String>,

    /// Price demanded per answered request (18-decimal string).
    #[arg(long = "price-per-request")]
    pub price_per_request: Option<String>,

    /// Chain id for the local development chain.
    #[arg(long = "chain-id", default_value_t = 1)]
    pub chain_id: u64,
}

/// Parse arguments and run the selected command.
pub async fn run() -> Result<()> {
    let cli = AgoraCli::parse();
    init_logging(&cli.logs)?;

    match cli.command {
        AgoraCommands::Node(args) => run_node(args).await,
    }
}

/// Run a single node on an in-process overlay and development chain.
///
/// The gossip transport and the EVM endpoint are external collaborators; a
/// production deployment swaps them in behind the same traits.
async fn run_node(args: NodeArgs) -> Result<()> {
    let signer = PrivateKeySigner::random();
    let peer = PeerId::new(signer.address());

    let backend = Arc::new(MockChainBackend::new(args.chain_id));
    backend.fund(signer.address(), wei::WEI_PER_TOKEN * U256::from(1_000u64));

    let network = LocalOverlayNetwork::new();
    let overlay = Arc::new(network.join(PeerInfo::new(peer, args.capabilities.clone())));

    let mut config = NodeConfig::new(&args.data_dir).with_capabilities(args.capabilities);
    if let Some(price) = args.price_per_request {
        config = config.with_price_per_request(price);
    }

    let node = AgoraNode::launch(
        config,
        overlay as Arc<dyn Overlay>,
        vec![backend as Arc<dyn ChainBackend>],
        Some(signer),
        None,
    )?;

    info!(%peer, data_dir = %args.data_dir.display(), "Node running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown();
    info!("Shutting down");
    Ok(())
}
