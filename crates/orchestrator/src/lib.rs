//! Fan-out orchestration.
//!
//! One orchestration selects a subset of capability-matched peers, issues a
//! correlated request to each, collects responses under deadline and
//! partial-failure policy, and reduces them to one aggregated result. Load
//! state feeds back into the next selection.

pub mod aggregation;
pub mod load;
pub mod orchestrator;
pub mod response;
pub mod selection;

mod error;

pub use aggregation::{AggregationOutcome, AggregationStrategy, aggregate};
pub use error::OrchestratorError;
pub use load::{AgentLoadState, LoadTracker, MAX_TRACKED_REQUESTS};
pub use orchestrator::{AggregatedResult, Orchestrator, OrchestrationMetrics, QueryConfig};
pub use response::{ResponseConfig, ResponseError, ResponseHandler};
pub use selection::{MAX_FANOUT, SelectionConfig, SelectionStrategy, select_peers};

use agora_primitives::PeerId;

/// One peer's answer (or failure) within an orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    /// The answering peer.
    pub peer: PeerId,
    /// The peer's capability match score.
    pub match_score: f64,
    /// Response text, `None` on failure.
    pub response: Option<String>,
    /// Observed latency in milliseconds.
    pub latency_ms: f64,
    /// Whether the peer answered successfully.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
}

impl AgentResponse {
    /// A successful answer.
    pub fn ok(peer: PeerId, match_score: f64, response: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            peer,
            match_score,
            response: Some(response.into()),
            latency_ms,
            success: true,
            error: None,
        }
    }

    /// A failed slot.
    pub fn failed(peer: PeerId, match_score: f64, error: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            peer,
            match_score,
            response: None,
            latency_ms,
            success: false,
            error: Some(error.into()),
        }
    }
}
