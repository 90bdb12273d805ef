//! The fan-out orchestrator.
//!
//! `execute` runs one orchestration: match, select, publish correlated
//! requests, collect under deadline, aggregate, and feed latencies back
//! into load state. The finalize path (active-count decrement, inbound
//! pump teardown, handler cleanup) runs on every exit, panic or cancel
//! included.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, warn};

use agora_ledger::LedgerStore;
use agora_overlay::{AgentQuery, Overlay, PeerMatch};
use agora_primitives::{
    AgentMessage, PeerId, message::AgentRequest, new_id, records::ExpectedInvoice, request_id,
    unix_ms,
};

use crate::{
    AgentResponse, LoadTracker, OrchestratorError,
    aggregation::{AggregationStrategy, aggregate},
    response::{ResponseConfig, ResponseError, ResponseHandler},
    selection::{SelectionConfig, select_peers},
};

/// Window during which a selected peer may invoice its request.
pub const EXPECTED_INVOICE_WINDOW_MS: u64 = 5 * 60 * 1000;

/// One orchestration's policy.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Capabilities the peers must advertise.
    pub capabilities: Vec<String>,
    /// Minimum candidates (caller-supplied responses count toward this).
    pub min_agents: usize,
    /// Aggregate whatever succeeded instead of failing on partial results.
    pub allow_partial_results: bool,
    /// Confidence at or above which consensus is achieved.
    pub consensus_threshold: f64,
    /// Reduction strategy.
    pub aggregation: AggregationStrategy,
    /// Peer selection policy.
    pub selection: SelectionConfig,
    /// Per-request limits.
    pub response: ResponseConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            min_agents: 1,
            allow_partial_results: true,
            consensus_threshold: 0.6,
            aggregation: AggregationStrategy::default(),
            selection: SelectionConfig::top_n(3),
            response: ResponseConfig::default(),
        }
    }
}

/// Aggregate counters for one orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestrationMetrics {
    /// Responses considered (peers plus caller-supplied).
    pub total_agents: usize,
    /// Successful responses.
    pub successful_agents: usize,
    /// Failed or timed-out responses.
    pub failed_agents: usize,
    /// Wall-clock duration, ms.
    pub duration_ms: u64,
}

/// The outcome of one orchestration.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    /// Orchestration id.
    pub orchestration_id: String,
    /// The aggregated answer.
    pub result: String,
    /// Aggregation confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether confidence met the consensus threshold.
    pub consensus_achieved: bool,
    /// Responses agreeing with the answer.
    pub agreement_count: usize,
    /// Counters.
    pub metrics: OrchestrationMetrics,
    /// Every response considered.
    pub responses: Vec<AgentResponse>,
}

/// Selects peers, fans out requests, and aggregates the replies.
pub struct Orchestrator {
    overlay: Arc<dyn Overlay>,
    ledger: Arc<LedgerStore>,
    loads: Arc<LoadTracker>,
}

impl Orchestrator {
    /// An orchestrator over the given overlay and ledger.
    pub fn new(overlay: Arc<dyn Overlay>, ledger: Arc<LedgerStore>) -> Self {
        Self {
            overlay,
            ledger,
            loads: Arc::new(LoadTracker::new()),
        }
    }

    /// The load tracker feeding selection.
    pub fn loads(&self) -> &Arc<LoadTracker> {
        &self.loads
    }

    /// Run one orchestration.
    ///
    /// `additional_responses` are caller-supplied answers aggregated
    /// alongside the peers'; they count toward `min_agents`.
    pub async fn execute(
        &self,
        prompt: &str,
        extra: serde_json::Map<String, serde_json::Value>,
        config: &QueryConfig,
        additional_responses: Vec<AgentResponse>,
    ) -> Result<AggregatedResult, OrchestratorError> {
        let started = Instant::now();
        let orchestration_id = new_id();

        let matches = self
            .overlay
            .find_agents(&AgentQuery::new(config.capabilities.iter().cloned()))
            .await?;
        let local = self.overlay.local_peer();
        let candidates: Vec<PeerMatch> = matches
            .into_iter()
            .filter(|m| m.peer.peer_id != local)
            .collect();

        if candidates.is_empty() && additional_responses.is_empty() {
            return Err(OrchestratorError::NoAgents);
        }
        let available = candidates.len() + additional_responses.len();
        if available < config.min_agents {
            return Err(OrchestratorError::InsufficientAgents {
                found: available,
                required: config.min_agents,
            });
        }

        let selected = select_peers(&candidates, &self.loads.snapshot(), &config.selection);
        if selected.is_empty() && additional_responses.is_empty() {
            return Err(OrchestratorError::NoAgents);
        }
        debug!(
            orchestration = %orchestration_id,
            selected = selected.len(),
            candidates = candidates.len(),
            "Fanning out"
        );
        counter!("agora_orchestrations_total").increment(1);
        histogram!("agora_orchestration_fanout").record(selected.len() as f64);

        let handler = ResponseHandler::new(config.response.clone(), None);
        let mut inbound = self.overlay.subscribe();
        let pump = {
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    match inbound.recv().await {
                        Ok(delivered) => {
                            if delivered.message.is_response() {
                                handler.handle(&delivered.message);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Inbound pump lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let peers: Vec<PeerId> = selected.iter().map(|m| m.peer.peer_id).collect();
        self.loads.begin_request(&peers);

        // Everything after this point runs under the finalize guard:
        // whatever happens, active counts come back down, the pump dies,
        // and outstanding resolvers are cancelled.
        let finalize = scopeguard::guard(
            (Arc::clone(&self.loads), handler.clone(), pump, peers),
            |(loads, handler, pump, peers)| {
                pump.abort();
                handler.cleanup();
                loads.finalize(&peers);
            },
        );

        let mut waiters = Vec::with_capacity(selected.len());
        for peer_match in &selected {
            let peer = peer_match.peer.peer_id;
            let rid = request_id(&orchestration_id, &peer);
            let rx = handler.add_pending(&rid);

            self.ledger.write_expected_invoice(&ExpectedInvoice {
                job_id: rid.clone(),
                expected_recipient: peer,
                expires_at: unix_ms() + EXPECTED_INVOICE_WINDOW_MS,
            })?;

            let message = AgentMessage::AgentRequest(AgentRequest {
                request_id: rid.clone(),
                prompt: prompt.to_owned(),
                extra: extra.clone(),
            });
            if let Err(e) = self.overlay.send(peer, message).await {
                // One unreachable peer fails one slot, not the orchestration.
                warn!(%peer, request = %rid, error = %e, "Publish failed");
                handler.reject(&rid, ResponseError::Cancelled(format!("publish failed: {e}")));
            }

            waiters.push((peer_match.clone(), rx));
        }

        let collected = futures::future::join_all(waiters.into_iter().map(
            |(peer_match, rx)| async move {
                let issued = Instant::now();
                let outcome = rx.await;
                let latency_ms = issued.elapsed().as_secs_f64() * 1000.0;
                match outcome {
                    Ok(Ok(text)) => AgentResponse::ok(
                        peer_match.peer.peer_id,
                        peer_match.match_score,
                        text,
                        latency_ms,
                    ),
                    Ok(Err(e)) => AgentResponse::failed(
                        peer_match.peer.peer_id,
                        peer_match.match_score,
                        e.to_string(),
                        latency_ms,
                    ),
                    Err(_) => AgentResponse::failed(
                        peer_match.peer.peer_id,
                        peer_match.match_score,
                        "orchestration cancelled",
                        latency_ms,
                    ),
                }
            },
        ))
        .await;

        for response in &collected {
            self.loads
                .record_response(response.peer, response.latency_ms, response.success);
        }

        let mut responses = additional_responses;
        responses.extend(collected);

        let successful = responses.iter().filter(|r| r.success).count();
        let metrics = OrchestrationMetrics {
            total_agents: responses.len(),
            successful_agents: successful,
            failed_agents: responses.len() - successful,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        histogram!("agora_orchestration_duration_ms").record(metrics.duration_ms as f64);

        if successful == 0 {
            drop(finalize);
            if config.allow_partial_results {
                // Nothing to aggregate, but the caller asked for whatever
                // is available: an empty, unconfident result.
                return Ok(AggregatedResult {
                    orchestration_id,
                    result: String::new(),
                    confidence: 0.0,
                    consensus_achieved: false,
                    agreement_count: 0,
                    metrics,
                    responses,
                });
            }
            let all_timeouts = responses
                .iter()
                .all(|r| matches!(&r.error, Some(e) if e == &ResponseError::Timeout.to_string()));
            return Err(if all_timeouts {
                OrchestratorError::Timeout
            } else {
                OrchestratorError::AllAgentsFailed
            });
        }

        let outcome = aggregate(&responses, &config.aggregation)?;
        let consensus_achieved = outcome.confidence >= config.consensus_threshold;

        drop(finalize);
        debug!(
            orchestration = %orchestration_id,
            confidence = outcome.confidence,
            consensus_achieved,
            successful,
            "Orchestration complete"
        );
        Ok(AggregatedResult {
            orchestration_id,
            result: outcome.result,
            confidence: outcome.confidence,
            consensus_achieved,
            agreement_count: outcome.agreement_count,
            metrics,
            responses,
        })
    }
}
