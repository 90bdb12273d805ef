//! Inbound message dispatch.
//!
//! One task per node subscribes to the overlay and routes payment-path
//! messages into the payment state machine. Response-path messages are
//! consumed by each orchestration's own pump and ignored here; requests are
//! answered through the pluggable responder (the LLM backend stand-in).

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agora_overlay::Overlay;
use agora_payments::{PaymentContext, PaymentManager};
use agora_primitives::{AgentMessage, PeerId, message::AgentReply};

use crate::node::ResponderFn;

/// Routes inbound overlay messages to their owners.
pub struct Dispatcher {
    payments: Arc<PaymentManager>,
    overlay: Arc<dyn Overlay>,
    responder: Option<ResponderFn>,
    price_per_request: Option<String>,
}

impl Dispatcher {
    /// A dispatcher for one node.
    pub fn new(
        payments: Arc<PaymentManager>,
        overlay: Arc<dyn Overlay>,
        responder: Option<ResponderFn>,
        price_per_request: Option<String>,
    ) -> Self {
        Self {
            payments,
            overlay,
            responder,
            price_per_request,
        }
    }

    /// Run the dispatch loop until the overlay closes.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut inbox = self.overlay.subscribe();
        tokio::spawn(async move {
            loop {
                match inbox.recv().await {
                    Ok(delivered) => self.route(delivered.from, delivered.message).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dispatcher lagged behind the overlay");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn route(&self, from: PeerId, message: AgentMessage) {
        match message {
            AgentMessage::Invoice(invoice) => {
                if let Err(e) = self.payments.handle_invoice(from, &invoice).await {
                    warn!(%from, invoice = %invoice.id, error = %e, "Rejected inbound invoice");
                }
            }
            AgentMessage::SubmitPaymentProof(proof) => {
                if let Err(e) = self.payments.handle_payment_proof(from, &proof).await {
                    warn!(%from, invoice = %proof.invoice_id, error = %e, "Proof handling failed");
                }
            }
            AgentMessage::StreamingTick(tick) => {
                if let Err(e) = self
                    .payments
                    .handle_streaming_tick(from, tick.channel_id.as_deref(), tick.tokens_generated)
                    .await
                {
                    warn!(%from, error = %e, "Streaming tick rejected");
                }
            }
            AgentMessage::EscrowApproval(approval) => {
                if let Err(e) =
                    self.payments
                        .handle_escrow_approval(from, &approval.job_id, &approval.milestone_id)
                {
                    warn!(%from, job = %approval.job_id, error = %e, "Escrow approval rejected");
                }
            }
            AgentMessage::SwarmDistribution(distribution) => {
                if let Err(e) = self.payments.handle_swarm_distribution(
                    from,
                    &distribution.split_id,
                    &distribution.invoices,
                ) {
                    warn!(%from, split = %distribution.split_id, error = %e, "Swarm distribution rejected");
                }
            }
            AgentMessage::AgentRequest(request) => self.answer(from, request).await,
            // Consumed by the orchestration that owns the request id.
            AgentMessage::AgentResponse(_)
            | AgentMessage::StreamChunk(_)
            | AgentMessage::StreamComplete(_) => {}
        }
    }

    /// Answer a request through the responder, then demand payment for it
    /// when a price is configured.
    async fn answer(&self, from: PeerId, request: agora_primitives::message::AgentRequest) {
        let Some(responder) = &self.responder else {
            debug!(%from, request = %request.request_id, "No responder; request ignored");
            return;
        };

        let text = responder(&request.prompt);
        if let Err(e) = self
            .overlay
            .send(
                from,
                AgentMessage::AgentResponse(AgentReply {
                    request_id: request.request_id.clone(),
                    response: Some(text),
                    error: None,
                }),
            )
            .await
        {
            warn!(%from, request = %request.request_id, error = %e, "Answer publish failed");
            return;
        }

        if let Some(price) = self.price_per_request.clone() {
            let payments = Arc::clone(&self.payments);
            let ctx = PaymentContext {
                job_id: request.request_id.clone(),
                payer: from,
                recipient: payments.wallet(),
                chain_id: payments.config().default_chain_id,
                token: payments.config().default_token.clone(),
                token_address: None,
            };
            // The waiter runs its own 60 s deadline; answering must not
            // block on it.
            tokio::spawn(async move {
                match payments.require_payment(&ctx, &price).await {
                    Ok(proof) => {
                        debug!(invoice = %proof.invoice_id, job = %ctx.job_id, "Request paid");
                    }
                    Err(e) => warn!(job = %ctx.job_id, error = %e, "Request payment failed"),
                }
            });
        }
    }
}
