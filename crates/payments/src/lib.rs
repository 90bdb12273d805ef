//! Payment state machine.
//!
//! [`PaymentManager`] owns the node's live payment state: pending one-shot
//! payments with their 60-second deadlines, milestone escrows, streaming
//! meters, swarm splits, and the bounded invoice queue. Every mutation
//! writes through to the durable ledger; the in-memory maps are caches.
//!
//! Three pricing disciplines, three invariant sets:
//!
//! - **per-request**: a pending ledger row exists before the invoice is
//!   transmitted; the deadline timer and the inbound proof race under a
//!   first-to-settle-wins discipline; the processed-proof set makes
//!   settlement idempotent.
//! - **streaming**: all mutation of one channel is serialised by a
//!   per-channel mutex; the accumulated amount never decreases while the
//!   channel is active.
//! - **escrow**: milestone release commits through a conditional ledger
//!   update; of two racing releases exactly one succeeds.

mod error;
mod escrow;
mod manager;
mod streaming;
mod swarm;

pub use error::PaymentError;
pub use manager::PaymentManager;
pub use streaming::StreamingUpdate;

use std::time::Duration;

use alloy_primitives::Address;

use agora_primitives::PeerId;

/// Result alias for payment operations.
pub type PaymentResult<T> = Result<T, PaymentError>;

/// Hard cap on the invoice queue.
pub const INVOICE_QUEUE_CAP: usize = 1000;

/// Deadline for a required payment.
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Payment state machine configuration.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Deadline for a required payment.
    pub payment_timeout: Duration,
    /// Validity window stamped on issued invoices, ms.
    pub invoice_validity_ms: u64,
    /// Invoice queue capacity.
    pub invoice_queue_cap: usize,
    /// Rate used when an inbound tick opens a channel lazily; `None`
    /// rejects ticks for unknown channels.
    pub stream_rate_per_token: Option<String>,
    /// Chain for lazily-opened streaming channels.
    pub default_chain_id: u64,
    /// Token symbol for lazily-opened streaming channels.
    pub default_token: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            payment_timeout: PAYMENT_TIMEOUT,
            invoice_validity_ms: 10 * 60 * 1000,
            invoice_queue_cap: INVOICE_QUEUE_CAP,
            stream_rate_per_token: None,
            default_chain_id: 1,
            default_token: "ETH".into(),
        }
    }
}

/// Who pays whom, for what, on which chain.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    /// The job being charged for.
    pub job_id: String,
    /// The paying peer.
    pub payer: PeerId,
    /// Wallet the payment goes to.
    pub recipient: Address,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token symbol.
    pub token: String,
    /// ERC-20 contract, `None` for native.
    pub token_address: Option<Address>,
}

/// [`PaymentContext`] plus streaming-specific fields.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Channel id (reused from the originating request id).
    pub channel_id: String,
    /// Payment routing.
    pub payment: PaymentContext,
    /// Price per generated token, 18-decimal string.
    pub rate_per_token: String,
}
