//! Swarm splits: dividing one payment across contributors pro rata.

use alloy_primitives::Address;
use metrics::counter;
use tracing::{debug, warn};

use agora_primitives::{
    AgentMessage, Invoice, PeerId, new_id, unix_ms,
    message::SwarmDistribution,
    records::{
        LedgerEntry, LedgerKind, LedgerStatus, SplitStatus, SwarmSplit, compute_swarm_shares,
    },
    wei,
};

use crate::{PaymentContext, PaymentError, PaymentManager, PaymentResult};

impl PaymentManager {
    /// Split `total_amount` across `contributions` and queue one invoice
    /// per participant.
    ///
    /// Admission is atomic: when the queue cannot take every invoice,
    /// nothing is enqueued and no rows are written.
    pub async fn distribute_to_swarm(
        &self,
        ctx: &PaymentContext,
        total_amount: &str,
        contributions: &[(PeerId, Address, f64)],
    ) -> PaymentResult<SwarmSplit> {
        let participants = compute_swarm_shares(total_amount, contributions)?;

        let split_id = new_id();
        let mut invoices = Vec::with_capacity(participants.len());
        for participant in &participants {
            // Zero shares (all-remainder participants) get no invoice.
            if wei::to_wei(&participant.amount)?.is_zero() {
                continue;
            }
            let invoice = self.sign_invoice(Invoice::new(
                ctx.job_id.clone(),
                ctx.chain_id,
                ctx.token.clone(),
                ctx.token_address,
                participant.amount.clone(),
                participant.wallet_address,
                self.config.invoice_validity_ms,
            ))?;
            invoices.push((participant.peer_id, invoice));
        }

        let split = SwarmSplit {
            id: split_id.clone(),
            job_id: ctx.job_id.clone(),
            payer: ctx.payer,
            total_amount: total_amount.to_owned(),
            chain_id: ctx.chain_id,
            token: ctx.token.clone(),
            participants,
            status: SplitStatus::Pending,
            created_at: unix_ms(),
        };

        // Queue admission, the split row, the ledger rows, and the enqueue
        // happen under the queue lock so a full queue rejects atomically.
        let stored = {
            let mut queue = self.queue.lock();
            if queue.len() + invoices.len() > self.config.invoice_queue_cap {
                return Err(PaymentError::QueueFull {
                    capacity: self.config.invoice_queue_cap,
                });
            }

            let stored = self.ledger.write_split_distributed(&split)?;
            for (peer, invoice) in &invoices {
                let mut entry = LedgerEntry::new(
                    &invoice.id,
                    LedgerKind::Swarm,
                    LedgerStatus::Pending,
                    invoice.chain_id,
                    &invoice.token,
                    &invoice.amount,
                    invoice.recipient,
                    *peer,
                    Some(invoice.job_id.clone()),
                    unix_ms(),
                );
                entry.metadata = Some(format!("split:{split_id}"));
                self.ledger.write_entry(&entry)?;
                self.ledger.write_pending_settlement(invoice)?;
            }
            queue.extend(invoices.iter().map(|(_, invoice)| invoice.clone()));
            stored
        };
        counter!("agora_swarm_splits_total").increment(1);

        // Tell every participant what the swarm earned them; delivery
        // failures do not unwind the split.
        let distribution = SwarmDistribution {
            split_id: split_id.clone(),
            invoices: invoices.iter().map(|(_, i)| i.clone()).collect(),
        };
        for (peer, _) in &invoices {
            if let Err(e) = self
                .overlay
                .send(*peer, AgentMessage::SwarmDistribution(distribution.clone()))
                .await
            {
                warn!(%peer, split = %split_id, error = %e, "Swarm notification failed");
            }
        }

        debug!(split = %split_id, participants = stored.participants.len(), "Swarm split distributed");
        Ok(stored)
    }

    /// A split by id, for observers.
    pub fn swarm_split(&self, split_id: &str) -> PaymentResult<SwarmSplit> {
        self.ledger
            .get_split(split_id)?
            .ok_or_else(|| PaymentError::NotFound(format!("swarm split {split_id}")))
    }

    /// Dispatcher entry point for `swarm-distribution` messages: record the
    /// share addressed to this node as an expected inbound payment.
    pub fn handle_swarm_distribution(
        &self,
        from: PeerId,
        split_id: &str,
        invoices: &[Invoice],
    ) -> PaymentResult<()> {
        for invoice in invoices {
            if invoice.recipient != self.wallet {
                continue;
            }
            invoice.validate()?;
            if invoice.is_signed() {
                invoice.verify(&from)?;
            }
            let mut entry = LedgerEntry::new(
                &invoice.id,
                LedgerKind::Swarm,
                LedgerStatus::Pending,
                invoice.chain_id,
                &invoice.token,
                &invoice.amount,
                invoice.recipient,
                from,
                Some(invoice.job_id.clone()),
                unix_ms(),
            );
            entry.metadata = Some(format!("split:{split_id}"));
            self.ledger.write_entry(&entry)?;
            debug!(split = %split_id, amount = %invoice.amount, "Recorded inbound swarm share");
        }
        Ok(())
    }
}
