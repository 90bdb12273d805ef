//! redb-backed ledger store.
//!
//! Table layout (all keys are id strings, all values postcard blobs):
//! `escrows.id`, `ledger.id`, `streaming.id`, `swarm.id`,
//! `pending_settlements.id`, `processed_proofs.txHash`,
//! `timed_out_payments.invoiceId`, `expected_invoices.jobId`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use agora_primitives::{
    Invoice,
    records::{
        EscrowAgreement, ExpectedInvoice, LedgerEntry, Milestone, ProcessedProof, SplitStatus,
        SwarmSplit, StreamingAgreement, TimedOutPayment, TimedOutStatus,
    },
};

use crate::{LedgerError, LedgerResult};

const ESCROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("escrows");
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger");
const STREAMING: TableDefinition<&str, &[u8]> = TableDefinition::new("streaming");
const SWARM: TableDefinition<&str, &[u8]> = TableDefinition::new("swarm");
const PENDING_SETTLEMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_settlements");
const PROCESSED_PROOFS: TableDefinition<&str, &[u8]> = TableDefinition::new("processed_proofs");
const TIMED_OUT: TableDefinition<&str, &[u8]> = TableDefinition::new("timed_out_payments");
const EXPECTED_INVOICES: TableDefinition<&str, &[u8]> = TableDefinition::new("expected_invoices");

/// Durable single-writer store for the payment state machine.
///
/// All mutations flow through this handle; in-memory maps elsewhere are
/// caches over these tables.
pub struct LedgerStore {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
}

impl LedgerStore {
    /// Create a handle without touching disk.
    ///
    /// The backing file is opened on first read (if it already exists) and
    /// created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existing database, or `None` when nothing has been written yet.
    fn reader(&self) -> LedgerResult<Option<Arc<Database>>> {
        if let Some(db) = self.db.read().clone() {
            return Ok(Some(db));
        }
        if !self.path.exists() {
            return Ok(None);
        }
        self.writer().map(Some)
    }

    /// Database handle, creating the backing file if needed.
    fn writer(&self) -> LedgerResult<Arc<Database>> {
        let mut guard = self.db.write();
        if let Some(db) = guard.as_ref() {
            return Ok(Arc::clone(db));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Arc::new(Database::create(&self.path)?);
        debug!(path = %self.path.display(), "Opened ledger store");
        *guard = Some(Arc::clone(&db));
        Ok(db)
    }

    fn load_all<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'_, &'static str, &'static [u8]>,
    ) -> LedgerResult<Vec<T>> {
        let Some(db) = self.reader()? else {
            return Ok(Vec::new());
        };
        let txn = db.begin_read()?;
        let table = match txn.open_table(table) {
            Ok(table) => table,
            // A table that was never written to is the same as empty.
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'_, &'static str, &'static [u8]>,
        key: &str,
    ) -> LedgerResult<Option<T>> {
        let Some(db) = self.reader()? else {
            return Ok(None);
        };
        let txn = db.begin_read()?;
        let table = match txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(key)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<'_, &'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> LedgerResult<()> {
        let db = self.writer()?;
        let bytes = encode(value)?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn remove(&self, table: TableDefinition<'_, &'static str, &'static [u8]>, key: &str) -> LedgerResult<()> {
        let Some(db) = self.reader()? else {
            return Ok(());
        };
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    // --- escrows ---

    /// All escrow agreements.
    pub fn load_escrows(&self) -> LedgerResult<Vec<EscrowAgreement>> {
        self.load_all(ESCROWS)
    }

    /// One escrow by id.
    pub fn get_escrow(&self, id: &str) -> LedgerResult<Option<EscrowAgreement>> {
        self.get(ESCROWS, id)
    }

    /// Upsert an escrow.
    pub fn write_escrow(&self, escrow: &EscrowAgreement) -> LedgerResult<()> {
        self.put(ESCROWS, &escrow.id, escrow)
    }

    /// Commit `escrow` only if the stored milestone array still equals
    /// `expected`.
    ///
    /// This is the serialisation point for concurrent milestone releases: of
    /// two racing releases, the loser observes `ConcurrentUpdate`.
    pub fn update_escrow_if_milestones_unchanged(
        &self,
        escrow: &EscrowAgreement,
        expected: &[Milestone],
    ) -> LedgerResult<()> {
        let db = self.writer()?;
        let bytes = encode(escrow)?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(ESCROWS)?;
            let current: EscrowAgreement = match table.get(escrow.id.as_str())? {
                Some(value) => decode(value.value())?,
                None => return Err(LedgerError::NotFound(escrow.id.clone())),
            };
            if current.milestones != expected {
                return Err(LedgerError::ConcurrentUpdate(escrow.id.clone()));
            }
            table.insert(escrow.id.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    // --- ledger entries ---

    /// All ledger entries.
    pub fn load_entries(&self) -> LedgerResult<Vec<LedgerEntry>> {
        self.load_all(ENTRIES)
    }

    /// One entry by id.
    pub fn get_entry(&self, id: &str) -> LedgerResult<Option<LedgerEntry>> {
        self.get(ENTRIES, id)
    }

    /// Upsert an entry.
    pub fn write_entry(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        self.put(ENTRIES, &entry.id, entry)
    }

    /// Update an existing entry; `NotFound` if it was never written.
    pub fn update_entry(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        if self.get_entry(&entry.id)?.is_none() {
            return Err(LedgerError::NotFound(entry.id.clone()));
        }
        self.put(ENTRIES, &entry.id, entry)
    }

    /// Delete an entry (compensation path).
    pub fn delete_entry(&self, id: &str) -> LedgerResult<()> {
        self.remove(ENTRIES, id)
    }

    // --- streaming agreements ---

    /// All streaming agreements.
    pub fn load_streams(&self) -> LedgerResult<Vec<StreamingAgreement>> {
        self.load_all(STREAMING)
    }

    /// One streaming agreement by channel id.
    pub fn get_stream(&self, id: &str) -> LedgerResult<Option<StreamingAgreement>> {
        self.get(STREAMING, id)
    }

    /// Upsert a streaming agreement.
    pub fn write_stream(&self, stream: &StreamingAgreement) -> LedgerResult<()> {
        self.put(STREAMING, &stream.id, stream)
    }

    // --- swarm splits ---

    /// All swarm splits.
    pub fn load_splits(&self) -> LedgerResult<Vec<SwarmSplit>> {
        self.load_all(SWARM)
    }

    /// One split by id.
    pub fn get_split(&self, id: &str) -> LedgerResult<Option<SwarmSplit>> {
        self.get(SWARM, id)
    }

    /// Upsert a split.
    pub fn write_split(&self, split: &SwarmSplit) -> LedgerResult<()> {
        self.put(SWARM, &split.id, split)
    }

    /// Insert a fresh split and advance it to `distributed` in one
    /// transaction, returning the stored row.
    pub fn write_split_distributed(&self, split: &SwarmSplit) -> LedgerResult<SwarmSplit> {
        let mut stored = split.clone();
        let db = self.writer()?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(SWARM)?;
            table.insert(stored.id.as_str(), encode(&stored)?.as_slice())?;
            stored.status = SplitStatus::Distributed;
            table.insert(stored.id.as_str(), encode(&stored)?.as_slice())?;
        }
        txn.commit()?;
        Ok(stored)
    }

    // --- pending settlements ---

    /// All queued-but-unsettled invoices.
    pub fn load_pending_settlements(&self) -> LedgerResult<Vec<Invoice>> {
        self.load_all(PENDING_SETTLEMENTS)
    }

    /// Persist a queued invoice.
    pub fn write_pending_settlement(&self, invoice: &Invoice) -> LedgerResult<()> {
        self.put(PENDING_SETTLEMENTS, &invoice.id, invoice)
    }

    /// Drop a settled (or failed) queued invoice.
    pub fn delete_pending_settlement(&self, invoice_id: &str) -> LedgerResult<()> {
        self.remove(PENDING_SETTLEMENTS, invoice_id)
    }

    // --- processed proofs ---

    /// Whether this transaction hash has already been consumed.
    pub fn has_processed_proof(&self, tx_hash: &str) -> LedgerResult<bool> {
        Ok(self.get::<ProcessedProof>(PROCESSED_PROOFS, tx_hash)?.is_some())
    }

    /// Idempotent insert; returns `false` when the proof was already there.
    pub fn insert_processed_proof(&self, proof: &ProcessedProof) -> LedgerResult<bool> {
        let db = self.writer()?;
        let key = proof.tx_hash.to_string();
        let bytes = encode(proof)?;
        let txn = db.begin_write()?;
        let fresh;
        {
            let mut table = txn.open_table(PROCESSED_PROOFS)?;
            fresh = table.get(key.as_str())?.is_none();
            if fresh {
                table.insert(key.as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(fresh)
    }

    /// Atomically insert a processed proof and flip the matching timed-out
    /// payment (if any) to `recovered`.
    ///
    /// Returns `false` without writing anything when the proof was already
    /// consumed.
    pub fn record_proof_and_recover(&self, proof: &ProcessedProof) -> LedgerResult<bool> {
        let db = self.writer()?;
        let key = proof.tx_hash.to_string();
        let proof_bytes = encode(proof)?;
        let txn = db.begin_write()?;
        {
            let mut proofs = txn.open_table(PROCESSED_PROOFS)?;
            if proofs.get(key.as_str())?.is_some() {
                return Ok(false);
            }
            proofs.insert(key.as_str(), proof_bytes.as_slice())?;

            let mut timed_out = txn.open_table(TIMED_OUT)?;
            let recovered = match timed_out.get(proof.invoice_id.as_str())? {
                Some(value) => {
                    let mut row: TimedOutPayment = decode(value.value())?;
                    row.status = TimedOutStatus::Recovered;
                    Some(encode(&row)?)
                }
                None => None,
            };
            if let Some(bytes) = recovered {
                timed_out.insert(proof.invoice_id.as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(true)
    }

    // --- timed-out payments ---

    /// All timed-out payments.
    pub fn load_timed_out(&self) -> LedgerResult<Vec<TimedOutPayment>> {
        self.load_all(TIMED_OUT)
    }

    /// One timed-out payment by invoice id.
    pub fn get_timed_out(&self, invoice_id: &str) -> LedgerResult<Option<TimedOutPayment>> {
        self.get(TIMED_OUT, invoice_id)
    }

    /// Record an invoice whose payment deadline elapsed.
    pub fn write_timed_out(&self, payment: &TimedOutPayment) -> LedgerResult<()> {
        self.put(TIMED_OUT, &payment.invoice.id, payment)
    }

    // --- expected invoices ---

    /// One expected-invoice row by job id.
    pub fn get_expected_invoice(&self, job_id: &str) -> LedgerResult<Option<ExpectedInvoice>> {
        self.get(EXPECTED_INVOICES, job_id)
    }

    /// Record that `job_id` may be invoiced by one specific peer.
    pub fn write_expected_invoice(&self, expected: &ExpectedInvoice) -> LedgerResult<()> {
        self.put(EXPECTED_INVOICES, &expected.job_id, expected)
    }

    /// Drop a consumed expectation.
    pub fn remove_expected_invoice(&self, job_id: &str) -> LedgerResult<()> {
        self.remove(EXPECTED_INVOICES, job_id)
    }

    /// Drop every expectation whose window closed before `now`.
    pub fn prune_expected_invoices(&self, now: u64) -> LedgerResult<usize> {
        let expired: Vec<String> = self
            .load_all::<ExpectedInvoice>(EXPECTED_INVOICES)?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.job_id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let db = self.writer()?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(EXPECTED_INVOICES)?;
            for job_id in &expired {
                table.remove(job_id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(expired.len())
    }
}

fn encode<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| LedgerError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> LedgerResult<T> {
    postcard::from_bytes(bytes).map_err(|e| LedgerError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_primitives::{
        PeerId,
        records::{EscrowStatus, LedgerKind, LedgerStatus, MilestoneStatus},
        unix_ms,
    };
    use alloy_primitives::{Address, B256};
    use tempfile::tempdir;

    fn test_store(dir: &tempfile::TempDir) -> LedgerStore {
        LedgerStore::open(dir.path().join("ledger.redb"))
    }

    fn test_escrow(id: &str) -> EscrowAgreement {
        EscrowAgreement {
            id: id.into(),
            job_id: "job-1".into(),
            payer: PeerId::random(),
            recipient: Address::repeat_byte(0x02),
            chain_id: 1,
            token: "ETH".into(),
            total_amount: "1".into(),
            milestones: vec![Milestone::new("m1", "0.5"), Milestone::new("m2", "0.5")],
            status: EscrowStatus::Locked,
            created_at: unix_ms(),
            requires_approval: false,
            approver: None,
        }
    }

    fn test_entry(id: &str) -> LedgerEntry {
        LedgerEntry::new(
            id,
            LedgerKind::Standard,
            LedgerStatus::Pending,
            1,
            "ETH",
            "1",
            Address::repeat_byte(0x02),
            PeerId::random(),
            Some("job-1".into()),
            unix_ms(),
        )
    }

    #[test]
    fn test_absent_store_loads_empty() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        assert!(store.load_escrows().unwrap().is_empty());
        assert!(store.load_entries().unwrap().is_empty());
        assert!(store.get_escrow("nope").unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_write_creates_file_lazily() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        store.write_entry(&test_entry("e1")).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_table_is_empty() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        // Only the entries table exists after this write.
        store.write_entry(&test_entry("e1")).unwrap();
        assert!(store.load_escrows().unwrap().is_empty());
        assert!(store.get_timed_out("nope").unwrap().is_none());
    }

    #[test]
    fn test_reopen_sees_written_rows() {
        let dir = tempdir().unwrap();
        let escrow = test_escrow("esc-1");
        {
            let store = test_store(&dir);
            store.write_escrow(&escrow).unwrap();
        }

        let store = test_store(&dir);
        assert_eq!(store.get_escrow("esc-1").unwrap(), Some(escrow));
    }

    #[test]
    fn test_update_entry_requires_existing_row() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let entry = test_entry("e1");
        assert!(matches!(
            store.update_entry(&entry),
            Err(LedgerError::NotFound(_))
        ));

        store.write_entry(&entry).unwrap();
        let settled = entry.settled(B256::repeat_byte(0xaa), unix_ms());
        store.update_entry(&settled).unwrap();
        assert_eq!(
            store.get_entry("e1").unwrap().map(|e| e.status),
            Some(LedgerStatus::Settled)
        );
    }

    #[test]
    fn test_conditional_escrow_update() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let escrow = test_escrow("esc-1");
        store.write_escrow(&escrow).unwrap();

        let expected = escrow.milestones.clone();
        let released = escrow.apply_release("m1", unix_ms()).unwrap();
        store
            .update_escrow_if_milestones_unchanged(&released, &expected)
            .unwrap();

        // Second commit against the stale expectation fails.
        let other = escrow.apply_release("m2", unix_ms()).unwrap();
        assert!(matches!(
            store.update_escrow_if_milestones_unchanged(&other, &expected),
            Err(LedgerError::ConcurrentUpdate(_))
        ));

        let stored = store.get_escrow("esc-1").unwrap().unwrap();
        assert!(stored.milestone("m1").unwrap().released);
        assert!(!stored.milestone("m2").unwrap().released);
    }

    #[test]
    fn test_conditional_update_missing_escrow() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let escrow = test_escrow("esc-1");
        assert!(matches!(
            store.update_escrow_if_milestones_unchanged(&escrow, &escrow.milestones),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_processed_proof_idempotent() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let proof = ProcessedProof {
            tx_hash: B256::repeat_byte(0x01),
            chain_id: 1,
            invoice_id: "inv-1".into(),
            processed_at: unix_ms(),
        };

        assert!(store.insert_processed_proof(&proof).unwrap());
        assert!(!store.insert_processed_proof(&proof).unwrap());
        assert!(store.has_processed_proof(&proof.tx_hash.to_string()).unwrap());
    }

    #[test]
    fn test_record_proof_recovers_timed_out_payment() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let invoice = Invoice::new("job-1", 1, "ETH", None, "1", Address::repeat_byte(2), 60_000);
        store
            .write_timed_out(&TimedOutPayment {
                invoice: invoice.clone(),
                timed_out_at: unix_ms(),
                status: TimedOutStatus::Pending,
            })
            .unwrap();

        let proof = ProcessedProof {
            tx_hash: B256::repeat_byte(0x02),
            chain_id: 1,
            invoice_id: invoice.id.clone(),
            processed_at: unix_ms(),
        };
        assert!(store.record_proof_and_recover(&proof).unwrap());

        let row = store.get_timed_out(&invoice.id).unwrap().unwrap();
        assert_eq!(row.status, TimedOutStatus::Recovered);

        // Replay: nothing happens, nothing changes.
        assert!(!store.record_proof_and_recover(&proof).unwrap());
    }

    #[test]
    fn test_split_insert_is_distributed_atomically() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let split = SwarmSplit {
            id: "split-1".into(),
            job_id: "job-1".into(),
            payer: PeerId::random(),
            total_amount: "100".into(),
            chain_id: 1,
            token: "ETH".into(),
            participants: vec![],
            status: SplitStatus::Pending,
            created_at: unix_ms(),
        };
        let stored = store.write_split_distributed(&split).unwrap();
        assert_eq!(stored.status, SplitStatus::Distributed);
        assert_eq!(
            store.get_split("split-1").unwrap().map(|s| s.status),
            Some(SplitStatus::Distributed)
        );
    }

    #[test]
    fn test_expected_invoice_lifecycle() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let peer = PeerId::random();
        store
            .write_expected_invoice(&ExpectedInvoice {
                job_id: "req-1".into(),
                expected_recipient: peer,
                expires_at: 100,
            })
            .unwrap();
        store
            .write_expected_invoice(&ExpectedInvoice {
                job_id: "req-2".into(),
                expected_recipient: peer,
                expires_at: 10_000,
            })
            .unwrap();

        assert_eq!(store.prune_expected_invoices(5_000).unwrap(), 1);
        assert!(store.get_expected_invoice("req-1").unwrap().is_none());
        assert!(store.get_expected_invoice("req-2").unwrap().is_some());

        store.remove_expected_invoice("req-2").unwrap();
        assert!(store.get_expected_invoice("req-2").unwrap().is_none());
    }

    #[test]
    fn test_pending_settlements_roundtrip() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let invoice = Invoice::new("job-1", 1, "ETH", None, "1", Address::repeat_byte(2), 60_000);
        store.write_pending_settlement(&invoice).unwrap();
        assert_eq!(store.load_pending_settlements().unwrap(), vec![invoice.clone()]);

        store.delete_pending_settlement(&invoice.id).unwrap();
        assert!(store.load_pending_settlements().unwrap().is_empty());
    }
}
