//! On-chain settlement for Agora payments.
//!
//! One [`ChainBackend`] per chain id, a per-chain [`NonceManager`], and a
//! [`SettlementClient`] that submits transfers, batches queued invoices per
//! `(recipient, chain, token)` group, and verifies inbound payment proofs by
//! reading receipts.

mod backend;
mod client;
mod error;
mod nonce;

pub use backend::{ChainBackend, LogEntry, TransferRequest, TxInfo, TxReceipt, mock};
pub use client::{BatchResult, SettlementClient, SettlementConfig};
pub use error::SettlementError;
pub use nonce::NonceManager;

/// Result alias for settlement operations.
pub type SettlementResult<T> = Result<T, SettlementError>;
