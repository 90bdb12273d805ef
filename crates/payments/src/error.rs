//! Payment state machine errors.

use agora_ledger::LedgerError;
use agora_overlay::OverlayError;
use agora_primitives::{InvoiceError, PeerId, records::RecordError, wei::WeiError};
use agora_settlement::SettlementError;

/// Errors from payment operations.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Malformed amount.
    #[error("invalid amount: {0}")]
    Amount(#[from] WeiError),

    /// Record validation failed.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Invoice validation or signature failure.
    #[error(transparent)]
    Invoice(#[from] InvoiceError),

    /// No such agreement, channel, or invoice.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not the configured approver.
    #[error("peer {caller} is not the approver for escrow {job_id}")]
    Unauthorized {
        /// The rejected caller.
        caller: PeerId,
        /// The escrow's job.
        job_id: String,
    },

    /// A conditional update lost a race.
    #[error("concurrent update of {0}")]
    ConcurrentUpdate(String),

    /// The target was already settled, released, or closed.
    #[error("already settled: {0}")]
    AlreadySettled(String),

    /// The payment deadline elapsed.
    #[error("payment timeout for invoice {0}")]
    Timeout(String),

    /// The invoice queue is at capacity; flush with `settle_all` first.
    #[error("invoice queue full (capacity {capacity}); settle before queueing more")]
    QueueFull {
        /// The configured cap.
        capacity: usize,
    },

    /// The streaming channel is closed.
    #[error("streaming channel {0} is closed")]
    StreamClosed(String),

    /// No expectation exists for this inbound invoice.
    #[error("unsolicited invoice for job {0}")]
    UnsolicitedInvoice(String),

    /// The invoice came from a peer other than the expected recipient.
    #[error("invoice for job {job_id} from {from}, expected {expected}")]
    WrongInvoicer {
        /// The offending job.
        job_id: String,
        /// Actual sender.
        from: PeerId,
        /// The recorded expectation.
        expected: PeerId,
    },

    /// Signing failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Settlement failure.
    #[error(transparent)]
    Settlement(#[from] SettlementError),

    /// Overlay publish failure.
    #[error("transport error: {0}")]
    Transport(#[from] OverlayError),
}
