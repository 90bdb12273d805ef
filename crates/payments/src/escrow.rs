//! Milestone escrows.

use metrics::counter;
use tracing::{debug, warn};

use agora_ledger::LedgerError;
use agora_primitives::{
    Invoice, PeerId, new_id, unix_ms,
    records::{
        EscrowAgreement, EscrowStatus, LedgerEntry, LedgerKind, LedgerStatus, Milestone,
        RecordError,
    },
};

use crate::{PaymentContext, PaymentError, PaymentManager, PaymentResult};

impl PaymentManager {
    /// Lock funds for a job behind a set of milestones.
    ///
    /// Milestone amounts must be strictly positive and sum to
    /// `total_amount`.
    pub fn create_escrow(
        &self,
        ctx: &PaymentContext,
        total_amount: &str,
        milestones: Vec<(String, String)>,
        requires_approval: bool,
        approver: Option<PeerId>,
    ) -> PaymentResult<EscrowAgreement> {
        let escrow = EscrowAgreement {
            id: new_id(),
            job_id: ctx.job_id.clone(),
            payer: ctx.payer,
            recipient: ctx.recipient,
            chain_id: ctx.chain_id,
            token: ctx.token.clone(),
            total_amount: total_amount.to_owned(),
            milestones: milestones
                .into_iter()
                .map(|(id, amount)| Milestone::new(id, amount))
                .collect(),
            status: EscrowStatus::Locked,
            created_at: unix_ms(),
            requires_approval,
            approver,
        };
        escrow.validate()?;

        self.ledger.write_escrow(&escrow)?;
        self.escrows
            .write()
            .insert(escrow.job_id.clone(), escrow.clone());
        debug!(job = %escrow.job_id, escrow = %escrow.id, "Escrow locked");
        Ok(escrow)
    }

    /// The live escrow for a job, from cache or ledger.
    pub fn escrow(&self, job_id: &str) -> PaymentResult<EscrowAgreement> {
        if let Some(escrow) = self.escrows.read().get(job_id) {
            return Ok(escrow.clone());
        }
        let escrow = self
            .ledger
            .load_escrows()?
            .into_iter()
            .find(|e| e.job_id == job_id)
            .ok_or_else(|| PaymentError::NotFound(format!("escrow for job {job_id}")))?;
        self.escrows
            .write()
            .insert(job_id.to_owned(), escrow.clone());
        Ok(escrow)
    }

    /// Release one milestone.
    ///
    /// Commits through the conditional ledger update: of two racing
    /// releases of the same milestone, exactly one succeeds. The loser sees
    /// `AlreadySettled` when the milestone is released in the current
    /// state, `ConcurrentUpdate` otherwise; both are terminal for the
    /// caller.
    pub fn release_milestone(
        &self,
        caller: PeerId,
        job_id: &str,
        milestone_id: &str,
    ) -> PaymentResult<EscrowAgreement> {
        let escrow = self.escrow(job_id)?;
        if escrow.status.is_terminal() {
            return Err(PaymentError::AlreadySettled(format!(
                "escrow {} is {}",
                escrow.id, escrow.status
            )));
        }
        if escrow.requires_approval && escrow.approver != Some(caller) {
            return Err(PaymentError::Unauthorized {
                caller,
                job_id: job_id.to_owned(),
            });
        }

        let expected = escrow.milestones.clone();
        let next = escrow
            .apply_release(milestone_id, unix_ms())
            .map_err(|e| match e {
                RecordError::MilestoneAlreadyReleased(id) => PaymentError::AlreadySettled(id),
                RecordError::MilestoneNotFound(id) => PaymentError::NotFound(id),
                other => PaymentError::Record(other),
            })?;

        match self
            .ledger
            .update_escrow_if_milestones_unchanged(&next, &expected)
        {
            Ok(()) => {}
            Err(LedgerError::ConcurrentUpdate(_)) => {
                // Re-inspect the winning state to classify the failure.
                let current = self
                    .ledger
                    .get_escrow(&escrow.id)?
                    .ok_or_else(|| PaymentError::NotFound(escrow.id.clone()))?;
                self.escrows
                    .write()
                    .insert(job_id.to_owned(), current.clone());
                let released = current
                    .milestone(milestone_id)
                    .is_some_and(|m| m.released);
                return Err(if released {
                    PaymentError::AlreadySettled(milestone_id.to_owned())
                } else {
                    PaymentError::ConcurrentUpdate(escrow.id.clone())
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.escrows.write().insert(job_id.to_owned(), next.clone());
        counter!("agora_milestones_released_total").increment(1);

        // Queue the payout for the released milestone; the ledger row
        // precedes the invoice.
        let milestone = next
            .milestone(milestone_id)
            .ok_or_else(|| PaymentError::NotFound(milestone_id.to_owned()))?;
        let invoice = self.sign_invoice(Invoice::new(
            next.job_id.clone(),
            next.chain_id,
            next.token.clone(),
            None,
            milestone.amount.clone(),
            next.recipient,
            self.config.invoice_validity_ms,
        ))?;
        let mut entry = LedgerEntry::new(
            &invoice.id,
            LedgerKind::Escrow,
            LedgerStatus::Pending,
            next.chain_id,
            &next.token,
            &milestone.amount,
            next.recipient,
            next.payer,
            Some(next.job_id.clone()),
            unix_ms(),
        );
        entry.metadata = Some(format!("milestone:{milestone_id}"));
        self.ledger.write_entry(&entry)?;
        if let Err(e) = self.queue_invoice(invoice) {
            warn!(job = %job_id, milestone = %milestone_id, error = %e, "Milestone payout not queued");
        }

        debug!(job = %job_id, milestone = %milestone_id, status = %next.status, "Milestone released");
        Ok(next)
    }

    /// Dispatcher entry point for `escrow-approval` messages: the sender is
    /// the caller.
    pub fn handle_escrow_approval(
        &self,
        from: PeerId,
        job_id: &str,
        milestone_id: &str,
    ) -> PaymentResult<EscrowAgreement> {
        self.release_milestone(from, job_id, milestone_id)
    }
}
