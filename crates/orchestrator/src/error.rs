//! Orchestrator error types.

use agora_ledger::LedgerError;
use agora_overlay::OverlayError;

use crate::aggregation::AggregationError;

/// Errors from orchestration.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No candidate peers and no caller-supplied responses.
    #[error("no agents matched the query")]
    NoAgents,

    /// Fewer candidates than the configured minimum.
    #[error("insufficient agents: found {found}, need {required}")]
    InsufficientAgents {
        /// Candidates available (including caller-supplied responses).
        found: usize,
        /// The configured minimum.
        required: usize,
    },

    /// Nothing responded before the deadline.
    #[error("no agent responded before the deadline")]
    Timeout,

    /// Every selected agent failed.
    #[error("all agents failed")]
    AllAgentsFailed,

    /// Aggregation could not produce a result.
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// Overlay failure.
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
