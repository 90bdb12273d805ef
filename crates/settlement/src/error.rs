//! Settlement error types.

use alloy_primitives::{B256, U256};

use agora_primitives::wei::WeiError;

/// Errors from settlement operations.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// No backend configured for this chain.
    #[error("unknown chain id: {0}")]
    UnknownChain(u64),

    /// Invoice amount failed to parse or is not positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] WeiError),

    /// Amount exceeds the sanity ceiling.
    #[error("amount {amount} exceeds the settlement ceiling")]
    AmountTooLarge {
        /// The offending amount string.
        amount: String,
    },

    /// Transfers to the zero address are always a mistake.
    #[error("recipient is the zero address")]
    ZeroRecipient,

    /// Sender balance cannot cover the transfer.
    #[error("insufficient balance: have {balance} wei, need {required} wei")]
    InsufficientBalance {
        /// Current balance in wei.
        balance: U256,
        /// Required amount in wei.
        required: U256,
    },

    /// The backend rejected the transaction.
    #[error("transaction submission failed: {0}")]
    SubmitFailed(String),

    /// The transaction landed but reverted.
    #[error("transaction {tx_hash} failed on-chain")]
    TransactionFailed {
        /// Hash of the reverted transaction.
        tx_hash: B256,
    },

    /// No receipt appeared within the polling budget.
    #[error("no receipt for {tx_hash} within the polling budget")]
    ReceiptTimeout {
        /// Hash of the unconfirmed transaction.
        tx_hash: B256,
    },

    /// Backend transport failure.
    #[error("chain backend error: {0}")]
    Backend(String),
}
