//! Overlay protocol messages.
//!
//! One sum type with a variant per protocol message; the serde `type` tag is
//! the wire discriminator. A pattern match at the dispatch boundary replaces
//! per-call schema validation.

use serde::{Deserialize, Serialize};

use crate::invoice::{Invoice, PaymentProof};

/// A correlated request to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Correlated request id (`{orchestration}-{peer}`).
    pub request_id: String,
    /// The prompt to answer.
    pub prompt: String,
    /// Caller-defined extra fields, passed through opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A peer's answer (or failure) to a correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    /// The request being answered.
    pub request_id: String,
    /// Response text on success.
    pub response: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
}

/// One chunk of an interleaved streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    /// The stream's request id.
    pub request_id: String,
    /// Chunk text.
    pub chunk: String,
    /// More chunks follow.
    pub partial: Option<bool>,
}

/// End of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamComplete {
    /// The stream's request id.
    pub request_id: String,
    /// Full text, for receivers that missed chunks.
    pub text: String,
    /// Always true; kept for wire compatibility.
    pub complete: Option<bool>,
}

/// A streaming-meter tick reporting generated tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingTick {
    /// Channel to meter; defaults to the sender's open channel.
    pub channel_id: Option<String>,
    /// Tokens generated since the last tick.
    pub tokens_generated: u64,
}

/// Approval for releasing one escrow milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowApproval {
    /// The escrow's job id.
    pub job_id: String,
    /// The milestone to release.
    pub milestone_id: String,
}

/// Notification of a computed swarm split and its invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmDistribution {
    /// The split being distributed.
    pub split_id: String,
    /// One invoice per participant.
    pub invoices: Vec<Invoice>,
}

/// Every message that travels between peers on the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    /// A correlated request.
    AgentRequest(AgentRequest),
    /// A direct (non-streamed) reply.
    AgentResponse(AgentReply),
    /// A streamed reply chunk.
    StreamChunk(StreamChunk),
    /// End of a streamed reply.
    StreamComplete(StreamComplete),
    /// A payment claim.
    Invoice(Invoice),
    /// Proof that an invoice was paid.
    SubmitPaymentProof(PaymentProof),
    /// A streaming-meter tick.
    StreamingTick(StreamingTick),
    /// An escrow release approval.
    EscrowApproval(EscrowApproval),
    /// A swarm split notification.
    SwarmDistribution(SwarmDistribution),
}

impl AgentMessage {
    /// The correlation id, for messages that carry one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentMessage::AgentRequest(m) => Some(&m.request_id),
            AgentMessage::AgentResponse(m) => Some(&m.request_id),
            AgentMessage::StreamChunk(m) => Some(&m.request_id),
            AgentMessage::StreamComplete(m) => Some(&m.request_id),
            _ => None,
        }
    }

    /// Whether this message belongs to the response path (as opposed to the
    /// payment path).
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            AgentMessage::AgentResponse(_)
                | AgentMessage::StreamChunk(_)
                | AgentMessage::StreamComplete(_)
        )
    }
}
