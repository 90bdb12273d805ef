//! Node configuration and logging arguments.

use std::path::PathBuf;

use clap::Args;

use agora_payments::PaymentConfig;
use agora_settlement::SettlementConfig;

/// Logging configuration (applies to all subcommands).
#[derive(Debug, Clone, Default, Args)]
#[command(next_help_heading = "Logging")]
pub struct LogArgs {
    /// Silence everything below error level.
    #[arg(long, short)]
    pub quiet: bool,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Extra tracing filter directives, comma separated.
    #[arg(long = "log.filter")]
    pub filter: Option<String>,
}

/// Everything an Agora node needs to run.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the ledger and other node state.
    pub data_dir: PathBuf,
    /// Capabilities this node advertises on the overlay.
    pub capabilities: Vec<String>,
    /// Price demanded per answered request; `None` answers for free.
    pub price_per_request: Option<String>,
    /// Payment state machine tuning.
    pub payment: PaymentConfig,
    /// Settlement client tuning.
    pub settlement: SettlementConfig,
}

impl NodeConfig {
    /// A config rooted at `data_dir` with defaults everywhere else.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            capabilities: Vec::new(),
            price_per_request: None,
            payment: PaymentConfig::default(),
            settlement: SettlementConfig::default(),
        }
    }

    /// Advertise the given capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Charge `amount` per answered request.
    pub fn with_price_per_request(mut self, amount: impl Into<String>) -> Self {
        self.price_per_request = Some(amount.into());
        self
    }

    /// Path of the node's ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.redb")
    }
}
