//! Node lifecycle and wiring.

use std::sync::Arc;

use alloy_signer_local::PrivateKeySigner;
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use agora_ledger::LedgerStore;
use agora_orchestrator::{AggregatedResult, Orchestrator, QueryConfig};
use agora_overlay::Overlay;
use agora_payments::PaymentManager;
use agora_settlement::{ChainBackend, SettlementClient};

use crate::{Dispatcher, NodeConfig};

/// Stand-in for the LLM backend: turns a prompt into response text.
pub type ResponderFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A running Agora node.
///
/// Owns the ledger, payment manager, orchestrator, and the dispatcher task
/// that feeds inbound payment messages into the state machine.
pub struct AgoraNode {
    config: NodeConfig,
    payments: Arc<PaymentManager>,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl AgoraNode {
    /// Wire up and start a node.
    ///
    /// The overlay identity should be `PeerId::new(signer.address())` so
    /// counterparties can verify this node's invoice signatures against its
    /// declared sender id.
    pub fn launch(
        config: NodeConfig,
        overlay: Arc<dyn Overlay>,
        backends: Vec<Arc<dyn ChainBackend>>,
        signer: Option<PrivateKeySigner>,
        responder: Option<ResponderFn>,
    ) -> Result<Arc<Self>> {
        let peer = overlay.local_peer();
        let wallet = signer
            .as_ref()
            .map(|s| s.address())
            .unwrap_or_else(|| peer.address());

        let ledger = Arc::new(LedgerStore::open(config.ledger_path()));

        let mut settlement = SettlementClient::new(wallet, config.settlement.clone());
        for backend in backends {
            settlement = settlement.with_backend(backend);
        }
        let settlement = Arc::new(settlement);

        let payments = Arc::new(PaymentManager::new(
            peer,
            wallet,
            signer,
            Arc::clone(&ledger),
            settlement,
            Arc::clone(&overlay),
            config.payment.clone(),
        ));
        payments.hydrate().wrap_err("hydrating payment state")?;

        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&overlay), ledger));

        let dispatcher = Dispatcher::new(
            Arc::clone(&payments),
            overlay,
            responder,
            config.price_per_request.clone(),
        )
        .spawn();

        info!(%peer, %wallet, "Agora node started");
        Ok(Arc::new(Self {
            config,
            payments,
            orchestrator,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    /// The active configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The payment state machine.
    pub fn payments(&self) -> &Arc<PaymentManager> {
        &self.payments
    }

    /// The orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Fan a query out to the network and aggregate the answers.
    pub async fn query(&self, prompt: &str, config: &QueryConfig) -> Result<AggregatedResult> {
        self.orchestrator
            .execute(prompt, serde_json::Map::new(), config, Vec::new())
            .await
            .wrap_err("orchestration failed")
    }

    /// Stop the dispatcher. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }
}

impl Drop for AgoraNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}
