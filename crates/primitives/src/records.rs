//! Durable payment records.
//!
//! One type per ledger table: escrow agreements with milestones, streaming
//! agreements, swarm splits, ledger entries, and the small index rows
//! (processed proofs, expected invoices, timed-out payments). Status
//! transitions are encoded here so every writer goes through the same
//! tables.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    PeerId,
    invoice::Invoice,
    wei::{self, WeiError},
};

/// Errors from record validation and pure state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Amount arithmetic failed.
    #[error(transparent)]
    Wei(#[from] WeiError),

    /// Escrow has no milestones.
    #[error("escrow has no milestones")]
    EmptyMilestones,

    /// Swarm split has no participants.
    #[error("swarm split has no participants")]
    EmptyParticipants,

    /// All contributions scale to zero weight.
    #[error("sum of contributions is zero")]
    ZeroContributions,

    /// No milestone with this id.
    #[error("milestone {0:?} not found")]
    MilestoneNotFound(String),

    /// The milestone was already released.
    #[error("milestone {0:?} already released")]
    MilestoneAlreadyReleased(String),

    /// The milestone was cancelled and cannot be released.
    #[error("milestone {0:?} is cancelled")]
    MilestoneCancelled(String),

    /// The status transition is not in the table.
    #[error("invalid escrow transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: EscrowStatus,
        /// Attempted status.
        to: EscrowStatus,
    },
}

/// Escrow lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EscrowStatus {
    /// Funds locked, nothing released.
    Locked,
    /// Some, but not all, milestones released.
    PartiallyReleased,
    /// Every live milestone released.
    FullyReleased,
    /// Terminated without full release.
    Cancelled,
}

impl EscrowStatus {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition(self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Locked, PartiallyReleased)
                | (Locked, FullyReleased)
                | (Locked, Cancelled)
                | (PartiallyReleased, FullyReleased)
                | (PartiallyReleased, Cancelled)
        )
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, EscrowStatus::FullyReleased | EscrowStatus::Cancelled)
    }
}

/// Per-milestone state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MilestoneStatus {
    /// Not yet released.
    Pending,
    /// Released to the recipient.
    Released,
    /// Cancelled; excluded from terminal-state computation.
    Cancelled,
}

/// A named chunk of an escrow's total, releasable independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    /// Milestone id, unique within the escrow.
    pub id: String,
    /// Amount as an 18-decimal string, strictly positive.
    pub amount: String,
    /// Release flag; never reverts to `false` once set.
    pub released: bool,
    /// Lifecycle status.
    pub status: MilestoneStatus,
    /// Release time, unix-ms.
    pub released_at: Option<u64>,
}

impl Milestone {
    /// A fresh pending milestone.
    pub fn new(id: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            amount: amount.into(),
            released: false,
            status: MilestoneStatus::Pending,
            released_at: None,
        }
    }
}

/// A milestone escrow between a payer and a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowAgreement {
    /// Escrow id.
    pub id: String,
    /// The job the escrow funds.
    pub job_id: String,
    /// Paying peer.
    pub payer: PeerId,
    /// Wallet receiving released milestones.
    pub recipient: Address,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token symbol.
    pub token: String,
    /// Total locked amount as an 18-decimal string.
    pub total_amount: String,
    /// The milestones; amounts sum to `total_amount`.
    pub milestones: Vec<Milestone>,
    /// Lifecycle status.
    pub status: EscrowStatus,
    /// Creation time, unix-ms.
    pub created_at: u64,
    /// Whether releases need sign-off from `approver`.
    pub requires_approval: bool,
    /// The peer allowed to approve releases.
    pub approver: Option<PeerId>,
}

impl EscrowAgreement {
    /// Check structural invariants: non-empty milestones, every amount
    /// strictly positive, amounts summing to the total when the total is
    /// non-zero.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.milestones.is_empty() {
            return Err(RecordError::EmptyMilestones);
        }
        for m in &self.milestones {
            wei::to_wei_positive(&m.amount)?;
        }
        if !wei::to_wei(&self.total_amount)?.is_zero() {
            wei::validate_milestones_total(
                self.milestones.iter().map(|m| m.amount.as_str()),
                &self.total_amount,
            )?;
        }
        Ok(())
    }

    /// Look up a milestone by id.
    pub fn milestone(&self, milestone_id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == milestone_id)
    }

    /// Status implied by a milestone set.
    ///
    /// Cancelled milestones are excluded; an escrow whose milestones are all
    /// cancelled collapses to `cancelled`.
    pub fn status_for(milestones: &[Milestone]) -> EscrowStatus {
        let mut live = 0usize;
        let mut released = 0usize;
        for m in milestones {
            if m.status == MilestoneStatus::Cancelled {
                continue;
            }
            live += 1;
            if m.released {
                released += 1;
            }
        }
        if live == 0 {
            EscrowStatus::Cancelled
        } else if released == live {
            EscrowStatus::FullyReleased
        } else if released > 0 {
            EscrowStatus::PartiallyReleased
        } else {
            EscrowStatus::Locked
        }
    }

    /// Pure release computation: the agreement with `milestone_id` released
    /// at `now` and the status advanced per the transition table.
    ///
    /// The caller commits the result with a conditional ledger update
    /// against the pre-release milestone array.
    pub fn apply_release(&self, milestone_id: &str, now: u64) -> Result<Self, RecordError> {
        let milestone = self
            .milestone(milestone_id)
            .ok_or_else(|| RecordError::MilestoneNotFound(milestone_id.to_owned()))?;
        if milestone.released {
            return Err(RecordError::MilestoneAlreadyReleased(milestone_id.to_owned()));
        }
        if milestone.status == MilestoneStatus::Cancelled {
            return Err(RecordError::MilestoneCancelled(milestone_id.to_owned()));
        }

        let mut next = self.clone();
        for m in &mut next.milestones {
            if m.id == milestone_id {
                m.released = true;
                m.status = MilestoneStatus::Released;
                m.released_at = Some(now);
            }
        }

        let status = Self::status_for(&next.milestones);
        if status != self.status && !self.status.can_transition(status) {
            return Err(RecordError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        next.status = status;
        Ok(next)
    }
}

/// Streaming channel lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StreamStatus {
    /// Metering; `accumulated_amount` may only grow.
    Active,
    /// Closed; no further ticks accepted.
    Closed,
}

/// A per-token streaming meter between a payer and a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingAgreement {
    /// Channel id (reused from the originating request id).
    pub id: String,
    /// The job being metered.
    pub job_id: String,
    /// Paying peer.
    pub payer: PeerId,
    /// Wallet accruing the metered amount.
    pub recipient: Address,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token symbol.
    pub token: String,
    /// Price per generated token, 18-decimal string, strictly positive.
    pub rate_per_token: String,
    /// Metered total so far; monotonically non-decreasing while active.
    pub accumulated_amount: String,
    /// Last tick time, unix-ms.
    pub last_tick: u64,
    /// Lifecycle status.
    pub status: StreamStatus,
    /// Creation time, unix-ms.
    pub created_at: u64,
    /// Close time, unix-ms.
    pub closed_at: Option<u64>,
}

impl StreamingAgreement {
    /// The accumulated amount in wei.
    pub fn accumulated_wei(&self) -> Result<U256, WeiError> {
        wei::to_wei(&self.accumulated_amount)
    }

    /// Tokens metered so far: `round(accumulated / rate)` when the rate is
    /// positive, zero otherwise.
    pub fn total_tokens(&self) -> Result<u64, WeiError> {
        let rate = wei::to_wei(&self.rate_per_token)?;
        if rate.is_zero() {
            return Ok(0);
        }
        let accumulated = self.accumulated_wei()?;
        let rounded = (accumulated + rate / U256::from(2u64)) / rate;
        Ok(u64::try_from(rounded).unwrap_or(u64::MAX))
    }
}

/// Swarm split lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SplitStatus {
    /// Computed but not yet distributed.
    Pending,
    /// Invoices issued to all participants.
    Distributed,
    /// Distribution failed.
    Failed,
}

/// One participant's share of a swarm split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmParticipant {
    /// The contributing peer.
    pub peer_id: PeerId,
    /// Wallet to pay the share to.
    pub wallet_address: Address,
    /// Raw contribution weight in `[0, 2^53]`.
    pub contribution: f64,
    /// Pro-rata share as an 18-decimal string.
    pub amount: String,
}

/// Division of one payment across multiple participants pro rata by
/// contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmSplit {
    /// Split id.
    pub id: String,
    /// The job being settled.
    pub job_id: String,
    /// Paying peer.
    pub payer: PeerId,
    /// Total amount divided among participants.
    pub total_amount: String,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token symbol.
    pub token: String,
    /// Participants with computed shares.
    pub participants: Vec<SwarmParticipant>,
    /// Lifecycle status.
    pub status: SplitStatus,
    /// Creation time, unix-ms.
    pub created_at: u64,
}

/// Compute pro-rata shares in wei.
///
/// Each share is `floor(total * contribution / sum(contributions))` over the
/// fixed-point scaled contributions; the floor-division remainder (at most
/// `participants - 1` wei) stays with the payer.
pub fn compute_swarm_shares(
    total_amount: &str,
    contributions: &[(PeerId, Address, f64)],
) -> Result<Vec<SwarmParticipant>, RecordError> {
    if contributions.is_empty() {
        return Err(RecordError::EmptyParticipants);
    }

    let total = wei::to_wei(total_amount)?;
    let mut weights = Vec::with_capacity(contributions.len());
    let mut weight_sum = U256::ZERO;
    for (_, _, contribution) in contributions {
        let w = wei::contribution_to_scaled(*contribution)?;
        weight_sum = weight_sum.checked_add(w).ok_or(WeiError::Overflow)?;
        weights.push(w);
    }
    if weight_sum.is_zero() {
        return Err(RecordError::ZeroContributions);
    }

    contributions
        .iter()
        .zip(weights)
        .map(|((peer_id, wallet, contribution), weight)| {
            let share = total
                .checked_mul(weight)
                .ok_or(WeiError::Overflow)?
                / weight_sum;
            Ok(SwarmParticipant {
                peer_id: *peer_id,
                wallet_address: *wallet,
                contribution: *contribution,
                amount: wei::from_wei(share),
            })
        })
        .collect()
}

/// Ledger entry kind: which pricing discipline produced the row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LedgerKind {
    /// One-shot per-request invoice.
    Standard,
    /// Streaming meter.
    Streaming,
    /// Milestone escrow.
    Escrow,
    /// Swarm split share.
    Swarm,
}

/// Ledger entry lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LedgerStatus {
    /// Awaiting settlement.
    Pending,
    /// Open streaming meter.
    Streaming,
    /// Settled on-chain.
    Settled,
    /// Settlement failed.
    Failed,
    /// Cancelled before settlement.
    Cancelled,
}

impl LedgerStatus {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition(self, next: LedgerStatus) -> bool {
        use LedgerStatus::*;
        matches!(
            (self, next),
            (Pending, Settled) | (Pending, Failed) | (Pending, Cancelled) | (Streaming, Settled)
        )
    }
}

/// One row per authoritative economic event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Entry id.
    pub id: String,
    /// Pricing discipline.
    pub kind: LedgerKind,
    /// Lifecycle status.
    pub status: LedgerStatus,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token symbol.
    pub token: String,
    /// Amount as an 18-decimal string.
    pub amount: String,
    /// Wallet owed the amount.
    pub recipient: Address,
    /// Paying peer.
    pub payer: PeerId,
    /// The job this row belongs to.
    pub job_id: Option<String>,
    /// Creation time, unix-ms.
    pub created_at: u64,
    /// Settlement time, unix-ms.
    pub settled_at: Option<u64>,
    /// Settling transaction, once settled.
    pub tx_hash: Option<B256>,
    /// Free-form annotation (split id, channel id, ...).
    pub metadata: Option<String>,
}

impl LedgerEntry {
    /// A fresh entry in the given initial status.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        kind: LedgerKind,
        status: LedgerStatus,
        chain_id: u64,
        token: impl Into<String>,
        amount: impl Into<String>,
        recipient: Address,
        payer: PeerId,
        job_id: Option<String>,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            status,
            chain_id,
            token: token.into(),
            amount: amount.into(),
            recipient,
            payer,
            job_id,
            created_at,
            settled_at: None,
            tx_hash: None,
            metadata: None,
        }
    }

    /// The entry marked settled by `tx_hash` at `now`.
    pub fn settled(mut self, tx_hash: B256, now: u64) -> Self {
        self.status = LedgerStatus::Settled;
        self.tx_hash = Some(tx_hash);
        self.settled_at = Some(now);
        self
    }
}

/// Replay-protection row: a proof that has been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedProof {
    /// Primary key.
    pub tx_hash: B256,
    /// Chain the transaction landed on.
    pub chain_id: u64,
    /// Invoice the proof settled.
    pub invoice_id: String,
    /// Processing time, unix-ms.
    pub processed_at: u64,
}

/// Index row written when we issue an outbound request: only this peer may
/// invoice this job, and only until the expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedInvoice {
    /// Primary key: the correlated request id.
    pub job_id: String,
    /// The only peer allowed to invoice the job.
    pub expected_recipient: PeerId,
    /// Expiry, unix-ms.
    pub expires_at: u64,
}

impl ExpectedInvoice {
    /// Whether the window has closed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Recovery state of a timed-out payment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TimedOutStatus {
    /// Deadline elapsed; a matching proof can still recover it.
    Pending,
    /// A late proof arrived and was verified.
    Recovered,
}

/// A pending invoice whose deadline elapsed, kept recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimedOutPayment {
    /// The invoice that timed out; its id is the primary key.
    pub invoice: Invoice,
    /// When the deadline fired, unix-ms.
    pub timed_out_at: u64,
    /// Recovery state.
    pub status: TimedOutStatus,
}
