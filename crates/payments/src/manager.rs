//! The payment manager: live state, pending payments, invoice queue.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use agora_ledger::LedgerStore;
use agora_overlay::Overlay;
use agora_primitives::{
    AgentMessage, Invoice, PaymentProof, PeerId, unix_ms,
    records::{
        EscrowAgreement, LedgerEntry, LedgerKind, LedgerStatus, ProcessedProof, StreamStatus,
        StreamingAgreement, TimedOutPayment, TimedOutStatus,
    },
    wei,
};
use agora_settlement::{BatchResult, SettlementClient};

use crate::{PaymentConfig, PaymentContext, PaymentError, PaymentResult};

pub(crate) struct PendingPayment {
    pub(crate) invoice: Invoice,
    tx: oneshot::Sender<PaymentResult<PaymentProof>>,
}

/// Owns the node's payment state and its transitions.
///
/// Every durable entity is singly owned by this manager; the in-memory maps
/// shadow the ledger tables and writes go through the store.
pub struct PaymentManager {
    pub(crate) node: PeerId,
    pub(crate) wallet: Address,
    signer: Option<PrivateKeySigner>,
    pub(crate) ledger: Arc<LedgerStore>,
    pub(crate) settlement: Arc<SettlementClient>,
    pub(crate) overlay: Arc<dyn Overlay>,
    pub(crate) config: PaymentConfig,
    /// Live escrows by job id.
    pub(crate) escrows: RwLock<HashMap<String, EscrowAgreement>>,
    /// Active streaming channels by channel id.
    pub(crate) streams: RwLock<HashMap<String, StreamingAgreement>>,
    /// Waiters for required payments, by invoice id. Removing an entry is
    /// the settle-once point: whoever takes it out owns the resolution.
    pending: Mutex<HashMap<String, PendingPayment>>,
    /// Per-channel serialisation locks, created on first use.
    pub(crate) channel_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Bounded invoice queue, drained by [`settle_all`](Self::settle_all).
    pub(crate) queue: Mutex<Vec<Invoice>>,
}

impl PaymentManager {
    /// A manager for `node`, paying into `wallet`.
    pub fn new(
        node: PeerId,
        wallet: Address,
        signer: Option<PrivateKeySigner>,
        ledger: Arc<LedgerStore>,
        settlement: Arc<SettlementClient>,
        overlay: Arc<dyn Overlay>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            node,
            wallet,
            signer,
            ledger,
            settlement,
            overlay,
            config,
            escrows: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            channel_locks: DashMap::new(),
            queue: Mutex::new(Vec::new()),
        }
    }

    /// This node's peer id.
    pub fn node(&self) -> PeerId {
        self.node
    }

    /// The wallet issued invoices pay into.
    pub fn wallet(&self) -> Address {
        self.wallet
    }

    /// The durable store behind this manager.
    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// The active configuration.
    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Reload live state from the ledger after a restart.
    pub fn hydrate(&self) -> PaymentResult<()> {
        for escrow in self.ledger.load_escrows()? {
            if !escrow.status.is_terminal() {
                self.escrows.write().insert(escrow.job_id.clone(), escrow);
            }
        }
        for stream in self.ledger.load_streams()? {
            if stream.status == StreamStatus::Active {
                self.streams.write().insert(stream.id.clone(), stream);
            }
        }
        let persisted = self.ledger.load_pending_settlements()?;
        let mut queue = self.queue.lock();
        for invoice in persisted.into_iter().take(self.config.invoice_queue_cap) {
            queue.push(invoice);
        }
        Ok(())
    }

    /// Attach this node's signature to an invoice, when a signer is
    /// configured.
    pub(crate) fn sign_invoice(&self, invoice: Invoice) -> PaymentResult<Invoice> {
        let Some(signer) = &self.signer else {
            return Ok(invoice);
        };
        let hash = invoice.signing_hash()?;
        let sig = signer
            .sign_hash_sync(&hash)
            .map_err(|e| PaymentError::Signing(e.to_string()))?;
        Ok(invoice.with_signature(sig, None))
    }

    /// Number of invoices currently queued.
    pub fn queued_invoices(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether a waiter exists for this invoice.
    pub fn has_pending_payment(&self, invoice_id: &str) -> bool {
        self.pending.lock().contains_key(invoice_id)
    }

    /// Demand payment for a job: issue an invoice to the payer and wait for
    /// a verified proof or the deadline.
    ///
    /// The pending ledger row is written before the invoice leaves the
    /// node. On timeout the invoice moves to the timed-out index (still
    /// recoverable by a late proof) and the pending row is deleted.
    pub async fn require_payment(
        &self,
        ctx: &PaymentContext,
        amount: &str,
    ) -> PaymentResult<PaymentProof> {
        wei::to_wei_positive(amount)?;

        let invoice = self.sign_invoice(Invoice::new(
            ctx.job_id.clone(),
            ctx.chain_id,
            ctx.token.clone(),
            ctx.token_address,
            amount,
            ctx.recipient,
            self.config.invoice_validity_ms,
        ))?;
        invoice.validate()?;

        let entry = LedgerEntry::new(
            &invoice.id,
            LedgerKind::Standard,
            LedgerStatus::Pending,
            ctx.chain_id,
            &ctx.token,
            amount,
            ctx.recipient,
            ctx.payer,
            Some(ctx.job_id.clone()),
            unix_ms(),
        );
        self.ledger.write_entry(&entry)?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            invoice.id.clone(),
            PendingPayment {
                invoice: invoice.clone(),
                tx,
            },
        );
        counter!("agora_invoices_issued_total").increment(1);

        if let Err(e) = self
            .overlay
            .send(ctx.payer, AgentMessage::Invoice(invoice.clone()))
            .await
        {
            // The invoice never left the node: compensate the in-memory
            // waiter and the pending row before surfacing the failure.
            self.pending.lock().remove(&invoice.id);
            self.ledger.delete_entry(&invoice.id)?;
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.payment_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(PaymentError::Timeout(invoice.id.clone())),
            Err(_elapsed) => {
                let expired = self.pending.lock().remove(&invoice.id);
                match expired {
                    Some(pending) => {
                        counter!("agora_payment_timeouts_total").increment(1);
                        self.ledger.write_timed_out(&TimedOutPayment {
                            invoice: pending.invoice,
                            timed_out_at: unix_ms(),
                            status: TimedOutStatus::Pending,
                        })?;
                        self.ledger.delete_entry(&invoice.id)?;
                        debug!(invoice = %invoice.id, "Payment deadline elapsed");
                        Err(PaymentError::Timeout(invoice.id))
                    }
                    // A proof won the race against the deadline; its result
                    // is already on the channel.
                    None => match rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(PaymentError::Timeout(invoice.id)),
                    },
                }
            }
        }
    }

    /// Verify an inbound payment proof.
    ///
    /// True iff the proof is fresh, binds to a live or timed-out invoice,
    /// and checks out on-chain. The processed-proof insert and the
    /// timed-out-payment recovery happen in one ledger transaction; that
    /// insert is the idempotence gate, so a replay or a concurrent
    /// duplicate observes `false`.
    pub async fn verify_payment(&self, proof: &PaymentProof) -> PaymentResult<bool> {
        let tx_key = proof.tx_hash.to_string();
        if self.ledger.has_processed_proof(&tx_key)? {
            debug!(invoice = %proof.invoice_id, tx = %tx_key, "Replayed proof ignored");
            return Ok(false);
        }

        let invoice = {
            let pending = self.pending.lock();
            pending.get(&proof.invoice_id).map(|p| p.invoice.clone())
        };
        let invoice = match invoice {
            Some(invoice) => Some(invoice),
            None => self
                .ledger
                .get_timed_out(&proof.invoice_id)?
                .map(|t| t.invoice),
        };
        let Some(invoice) = invoice else {
            debug!(invoice = %proof.invoice_id, "Proof for unknown invoice");
            return Ok(false);
        };

        if !self.settlement.verify_payment(proof, &invoice).await? {
            warn!(invoice = %proof.invoice_id, "On-chain verification failed");
            return Ok(false);
        }

        let fresh = self.ledger.record_proof_and_recover(&ProcessedProof {
            tx_hash: proof.tx_hash,
            chain_id: proof.chain_id,
            invoice_id: proof.invoice_id.clone(),
            processed_at: unix_ms(),
        })?;
        if !fresh {
            debug!(invoice = %proof.invoice_id, "Proof already settled");
            return Ok(false);
        }
        counter!("agora_proofs_verified_total").increment(1);

        let waiter = self.pending.lock().remove(&proof.invoice_id);
        if let Some(pending) = waiter {
            if let Some(entry) = self.ledger.get_entry(&proof.invoice_id)? {
                self.ledger
                    .write_entry(&entry.settled(proof.tx_hash, unix_ms()))?;
            }
            let _ = pending.tx.send(Ok(proof.clone()));
        }
        // With no waiter this was a late recovery: the timed-out row has
        // just transitioned to `recovered` in the same transaction as the
        // proof insert.
        Ok(true)
    }

    /// Dispatcher entry point for `submit-payment-proof` messages.
    pub async fn handle_payment_proof(
        &self,
        from: PeerId,
        proof: &PaymentProof,
    ) -> PaymentResult<bool> {
        let accepted = self.verify_payment(proof).await?;
        if !accepted {
            warn!(%from, invoice = %proof.invoice_id, "Rejected payment proof");
        }
        Ok(accepted)
    }

    /// Dispatcher entry point for inbound invoices: gate against the
    /// expected-invoice index, verify the signature, pay, and send the
    /// proof back.
    pub async fn handle_invoice(
        &self,
        from: PeerId,
        invoice: &Invoice,
    ) -> PaymentResult<PaymentProof> {
        invoice.validate()?;

        let now = unix_ms();
        self.ledger.prune_expected_invoices(now)?;
        let expected = self
            .ledger
            .get_expected_invoice(&invoice.job_id)?
            .ok_or_else(|| PaymentError::UnsolicitedInvoice(invoice.job_id.clone()))?;
        if expected.expected_recipient != from {
            return Err(PaymentError::WrongInvoicer {
                job_id: invoice.job_id.clone(),
                from,
                expected: expected.expected_recipient,
            });
        }
        if invoice.is_signed() {
            invoice.verify(&from)?;
        }

        let proof = self.settlement.pay(invoice).await?;
        self.ledger.remove_expected_invoice(&invoice.job_id)?;

        // Record the outflow.
        let entry = LedgerEntry::new(
            &invoice.id,
            LedgerKind::Standard,
            LedgerStatus::Pending,
            invoice.chain_id,
            &invoice.token,
            &invoice.amount,
            invoice.recipient,
            self.node,
            Some(invoice.job_id.clone()),
            now,
        )
        .settled(proof.tx_hash, unix_ms());
        self.ledger.write_entry(&entry)?;

        if let Err(e) = self
            .overlay
            .send(from, AgentMessage::SubmitPaymentProof(proof.clone()))
            .await
        {
            warn!(%from, invoice = %invoice.id, error = %e, "Failed to return payment proof");
        }
        Ok(proof)
    }

    /// Push an invoice onto the bounded settlement queue.
    pub fn queue_invoice(&self, invoice: Invoice) -> PaymentResult<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.invoice_queue_cap {
            return Err(PaymentError::QueueFull {
                capacity: self.config.invoice_queue_cap,
            });
        }
        self.ledger.write_pending_settlement(&invoice)?;
        queue.push(invoice);
        Ok(())
    }

    /// Drain the queue and settle it, one transfer per
    /// `(recipient, chain, token)` group.
    ///
    /// Settled groups clear their pending-settlement rows and mark their
    /// ledger entries; failed groups keep their durable rows for a later
    /// retry.
    pub async fn settle_all(&self) -> PaymentResult<Vec<BatchResult>> {
        let drained: Vec<Invoice> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.settlement.batch_settle(&drained).await;
        for result in &results {
            match &result.outcome {
                Ok(proof) => {
                    for invoice_id in &result.invoice_ids {
                        self.ledger.delete_pending_settlement(invoice_id)?;
                        if let Some(entry) = self.ledger.get_entry(invoice_id)? {
                            if entry.status.can_transition(LedgerStatus::Settled) {
                                self.ledger
                                    .write_entry(&entry.settled(proof.tx_hash, unix_ms()))?;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        recipient = %result.recipient,
                        chain = result.chain_id,
                        error = %e,
                        "Settlement group failed; keeping rows for retry"
                    );
                }
            }
        }
        Ok(results)
    }
}
