//! Durable local store
//!
//! Single-writer, transactional tables for records, the outbox, the audit
//! log, compliance entities, and alerts. Every mutating call runs inside
//! `LocalStore::transaction`, which stages its writes under the exclusive
//! writer lock. Readers take the same lock, so staged writes are only ever
//! observed by the transaction itself. Each staged write keeps an undo entry.
//!
//! A commit appends the staged batch to the `Journal` and publishes it by
//! releasing the lock. Any failure (closure error, missing audit entry,
//! journal I/O) unwinds the undo entries first. The append and its outcome
//! run on a spawned task that owns the lock, so a caller that stops waiting
//! cannot leave a batch visible without it being journaled.

pub mod journal;

pub use journal::{CommitBatch, FileJournal, Journal, JournalState, MemoryJournal, WriteOp};

use crate::audit::{AuditDraft, AuditLogger};
use crate::clock::Clock;
use crate::compliance::types::{BreachIncident, DataSubjectRequest};
use crate::error::{ComplianceError, Result};
use crate::outbox::Outbox;
use crate::types::{AuditAlert, AuditLogEntry, ConflictRecord, OutboxEntry, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Sync bookkeeping persisted alongside the tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// All tables owned by the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tables {
    pub records: BTreeMap<String, Record>,
    /// Outbox keyed by creation sequence
    pub outbox: BTreeMap<u64, OutboxEntry>,
    /// Append-only, in insertion order
    pub audit: Vec<AuditLogEntry>,
    pub breaches: BTreeMap<String, BreachIncident>,
    pub requests: BTreeMap<String, DataSubjectRequest>,
    pub alerts: BTreeMap<String, AuditAlert>,
    pub conflicts: BTreeMap<String, ConflictRecord>,
    #[serde(default)]
    pub meta: SyncMeta,
    /// Sequence of the last applied commit batch
    #[serde(default)]
    pub commit_seq: u64,
    #[serde(skip)]
    audit_ids: HashSet<String>,
}

/// Reverts one applied write
#[derive(Debug)]
pub(crate) enum Undo {
    Record(String, Option<Record>),
    Outbox(u64, Option<OutboxEntry>),
    Audit,
    Breach(String, Option<BreachIncident>),
    Request(String, Option<DataSubjectRequest>),
    Alert(String, Option<AuditAlert>),
    Conflict(String, Option<ConflictRecord>),
    Meta(SyncMeta),
}

fn restore<V>(map: &mut BTreeMap<String, V>, key: String, prev: Option<V>) {
    match prev {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Tables {
    pub(crate) fn rebuild_indexes(&mut self) {
        self.audit_ids = self.audit.iter().map(|e| e.id.clone()).collect();
    }

    pub fn audit_contains(&self, id: &str) -> bool {
        self.audit_ids.contains(id)
    }

    /// Next free outbox sequence
    pub fn next_outbox_seq(&self) -> u64 {
        self.outbox.keys().next_back().map_or(1, |seq| seq + 1)
    }

    /// Whether an entity is held for manual conflict resolution
    pub fn has_open_conflict(&self, entity_id: &str) -> bool {
        self.conflicts
            .values()
            .any(|c| c.entity_id == entity_id && c.is_open())
    }

    /// Open alert for a resource and alert type, if any
    pub fn open_alert_for(
        &self,
        resource_id: &str,
        alert_type: crate::types::AlertType,
    ) -> Option<&AuditAlert> {
        self.alerts
            .values()
            .find(|a| a.is_open() && a.resource_id == resource_id && a.alert_type == alert_type)
    }

    /// Outbox entries of one entity in creation order
    pub fn outbox_for<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = &'a OutboxEntry> + 'a {
        self.outbox.values().filter(move |e| e.entity_id == entity_id)
    }

    pub(crate) fn apply(&mut self, op: &WriteOp) -> Result<Undo> {
        Ok(match op {
            WriteOp::PutRecord(record) => Undo::Record(
                record.id.clone(),
                self.records.insert(record.id.clone(), record.clone()),
            ),
            WriteOp::PutOutbox(entry) => {
                Undo::Outbox(entry.seq, self.outbox.insert(entry.seq, entry.clone()))
            }
            WriteOp::AppendAudit(entry) => {
                if !self.audit_ids.insert(entry.id.clone()) {
                    return Err(ComplianceError::AuditImmutable(entry.id.clone()));
                }
                self.audit.push(entry.clone());
                Undo::Audit
            }
            WriteOp::PutBreach(incident) => Undo::Breach(
                incident.id.clone(),
                self.breaches.insert(incident.id.clone(), incident.clone()),
            ),
            WriteOp::PutRequest(request) => Undo::Request(
                request.id.clone(),
                self.requests.insert(request.id.clone(), request.clone()),
            ),
            WriteOp::PutAlert(alert) => Undo::Alert(
                alert.id.clone(),
                self.alerts.insert(alert.id.clone(), alert.clone()),
            ),
            WriteOp::PutConflict(conflict) => Undo::Conflict(
                conflict.id.clone(),
                self.conflicts.insert(conflict.id.clone(), conflict.clone()),
            ),
            WriteOp::SetMeta(meta) => Undo::Meta(std::mem::replace(&mut self.meta, meta.clone())),
        })
    }

    pub(crate) fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Record(id, prev) => restore(&mut self.records, id, prev),
            Undo::Outbox(seq, prev) => match prev {
                Some(entry) => {
                    self.outbox.insert(seq, entry);
                }
                None => {
                    self.outbox.remove(&seq);
                }
            },
            Undo::Audit => {
                if let Some(entry) = self.audit.pop() {
                    self.audit_ids.remove(&entry.id);
                }
            }
            Undo::Breach(id, prev) => restore(&mut self.breaches, id, prev),
            Undo::Request(id, prev) => restore(&mut self.requests, id, prev),
            Undo::Alert(id, prev) => restore(&mut self.alerts, id, prev),
            Undo::Conflict(id, prev) => restore(&mut self.conflicts, id, prev),
            Undo::Meta(prev) => self.meta = prev,
        }
    }
}

/// Write access to the tables for the duration of one commit
///
/// Reads observe the transaction's own writes. Record writes must be
/// accompanied by an audit entry appended through `audit()`, or the
/// commit fails with `AuditRequired`.
pub struct Transaction<'a> {
    tables: &'a mut Tables,
    ops: Vec<WriteOp>,
    undo: Vec<Undo>,
    now: DateTime<Utc>,
    actor: String,
    touched_records: bool,
    audited: bool,
}

impl<'a> Transaction<'a> {
    fn new(tables: &'a mut Tables, actor: &str, now: DateTime<Utc>) -> Self {
        Self {
            tables,
            ops: Vec::new(),
            undo: Vec::new(),
            now,
            actor: actor.to_string(),
            touched_records: false,
            audited: false,
        }
    }

    /// Commit timestamp shared by every write in this transaction
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Actor the transaction runs on behalf of
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Read-only view including this transaction's writes
    pub fn tables(&self) -> &Tables {
        self.tables
    }

    pub(crate) fn stage(&mut self, op: WriteOp) -> Result<()> {
        let undo = self.tables.apply(&op)?;
        match op {
            WriteOp::PutRecord(_) => self.touched_records = true,
            WriteOp::AppendAudit(_) => self.audited = true,
            _ => {}
        }
        self.undo.push(undo);
        self.ops.push(op);
        Ok(())
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.undo.pop() {
            self.tables.revert(undo);
        }
        self.ops.clear();
    }

    /// Hand the staged writes and their undo entries over to the commit
    fn detach(&mut self) -> (Vec<WriteOp>, Vec<Undo>) {
        (std::mem::take(&mut self.ops), std::mem::take(&mut self.undo))
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.tables.records.get(id)
    }

    /// Write a record with optimistic concurrency
    ///
    /// `expected_version` (0 for "must not exist") is compared against the
    /// current version. Versions never decrease.
    pub fn put_record(&mut self, record: Record, expected_version: Option<u64>) -> Result<()> {
        let current = self.tables.records.get(&record.id).map_or(0, |r| r.version);
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(ComplianceError::VersionConflict {
                    entity_id: record.id,
                    expected,
                    actual: current,
                });
            }
        }
        if record.version < current {
            return Err(ComplianceError::VersionConflict {
                entity_id: record.id,
                expected: record.version,
                actual: current,
            });
        }
        self.stage(WriteOp::PutRecord(record))
    }

    /// Tombstone a record, bumping its version
    pub fn tombstone_record(&mut self, id: &str, expected_version: Option<u64>) -> Result<Record> {
        let mut record = self
            .record(id)
            .filter(|r| !r.is_deleted())
            .cloned()
            .ok_or_else(|| ComplianceError::NotFound(format!("Record not found: {}", id)))?;
        let previous = record.version;
        record.version += 1;
        record.dirty = true;
        record.deleted_at = Some(self.now);
        record.updated_at = self.now;
        self.put_record(record.clone(), Some(expected_version.unwrap_or(previous)))?;
        Ok(record)
    }

    /// Audit logger bound to this transaction
    pub fn audit(&mut self) -> AuditLogger<'_, 'a> {
        AuditLogger::new(self)
    }

    /// Outbox bound to this transaction
    pub fn outbox(&mut self) -> Outbox<'_, 'a> {
        Outbox::new(self)
    }

    pub fn breach(&self, id: &str) -> Option<&BreachIncident> {
        self.tables.breaches.get(id)
    }

    pub fn put_breach(&mut self, incident: BreachIncident) -> Result<()> {
        self.stage(WriteOp::PutBreach(incident))
    }

    pub fn request(&self, id: &str) -> Option<&DataSubjectRequest> {
        self.tables.requests.get(id)
    }

    pub fn put_request(&mut self, request: DataSubjectRequest) -> Result<()> {
        self.stage(WriteOp::PutRequest(request))
    }

    pub fn alert(&self, id: &str) -> Option<&AuditAlert> {
        self.tables.alerts.get(id)
    }

    pub fn put_alert(&mut self, alert: AuditAlert) -> Result<()> {
        self.stage(WriteOp::PutAlert(alert))
    }

    pub fn conflict(&self, id: &str) -> Option<&ConflictRecord> {
        self.tables.conflicts.get(id)
    }

    pub fn put_conflict(&mut self, conflict: ConflictRecord) -> Result<()> {
        self.stage(WriteOp::PutConflict(conflict))
    }

    pub fn set_meta(&mut self, meta: SyncMeta) -> Result<()> {
        self.stage(WriteOp::SetMeta(meta))
    }
}

// Staged writes that were not handed to a commit are unwound
impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

/// Transactional local store backed by a write-ahead journal
pub struct LocalStore {
    tables: Arc<RwLock<Tables>>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Open the store, replaying the journal
    pub async fn open(journal: Arc<dyn Journal>, clock: Arc<dyn Clock>) -> Result<Self> {
        let state = journal.load().await?;
        let mut tables = state.snapshot.unwrap_or_default();
        tables.rebuild_indexes();

        let mut replayed = 0usize;
        for batch in &state.batches {
            if batch.seq <= tables.commit_seq {
                continue;
            }
            for op in &batch.ops {
                tables.apply(op)?;
            }
            tables.commit_seq = batch.seq;
            replayed += 1;
        }

        tracing::info!(
            journal = journal.name(),
            records = tables.records.len(),
            audit_entries = tables.audit.len(),
            replayed,
            "Local store opened"
        );

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            journal,
            clock,
        })
    }

    /// Run `f` as one atomic commit
    ///
    /// All writes made through the transaction are journaled and become
    /// visible together, or none are. Dropping the returned future after `f`
    /// ran does not abandon the commit: it still completes or reverts.
    pub async fn transaction<T, F>(&self, actor: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T> + Send,
        T: Send,
    {
        let mut tables = self.tables.clone().write_owned().await;
        let now = self.clock.now();

        let (value, ops, undo) = {
            let mut tx = Transaction::new(&mut tables, actor, now);
            let value = f(&mut tx)?;
            if tx.touched_records && !tx.audited {
                return Err(ComplianceError::AuditRequired);
            }
            let (ops, undo) = tx.detach();
            (value, ops, undo)
        };

        if ops.is_empty() {
            return Ok(value);
        }

        let batch = CommitBatch {
            seq: tables.commit_seq + 1,
            committed_at: now,
            actor: actor.to_string(),
            ops,
        };
        let journal = self.journal.clone();

        let commit = tokio::spawn(async move {
            match journal.append(&batch).await {
                Ok(()) => {
                    tables.commit_seq = batch.seq;
                    tracing::debug!(
                        seq = batch.seq,
                        actor = %batch.actor,
                        ops = batch.ops.len(),
                        "Transaction committed"
                    );
                    Ok(())
                }
                Err(e) => {
                    for entry in undo.into_iter().rev() {
                        tables.revert(entry);
                    }
                    tracing::warn!(
                        seq = batch.seq,
                        actor = %batch.actor,
                        error = %e,
                        "Journal append failed, transaction rolled back"
                    );
                    Err(e)
                }
            }
        });

        commit
            .await
            .map_err(|e| ComplianceError::Storage(format!("Commit task failed: {}", e)))??;
        Ok(value)
    }

    /// Run a read-only closure against the tables
    pub async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().await;
        f(&tables)
    }

    /// Get a record by id, tombstoned records included
    pub async fn get(&self, id: &str) -> Option<Record> {
        self.read(|t| t.records.get(id).cloned()).await
    }

    /// Write a record together with its audit entry
    pub async fn put(
        &self,
        record: Record,
        expected_version: Option<u64>,
        audit: AuditDraft,
    ) -> Result<Record> {
        let actor = audit.actor_id.clone();
        self.transaction(&actor, move |tx| {
            tx.put_record(record.clone(), expected_version)?;
            tx.audit().append(audit)?;
            Ok(record)
        })
        .await
    }

    /// Tombstone a record together with its audit entry
    pub async fn delete(
        &self,
        id: &str,
        expected_version: Option<u64>,
        audit: AuditDraft,
    ) -> Result<Record> {
        let actor = audit.actor_id.clone();
        self.transaction(&actor, move |tx| {
            let record = tx.tombstone_record(id, expected_version)?;
            tx.audit().append(audit)?;
            Ok(record)
        })
        .await
    }

    /// Write a snapshot and truncate the journal
    pub async fn compact(&self) -> Result<()> {
        let tables = self.tables.write().await;
        self.journal.compact(&tables).await?;
        tracing::info!(seq = tables.commit_seq, "Local store compacted");
        Ok(())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    async fn memory_store() -> (LocalStore, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::default());
        let store = LocalStore::open(journal.clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();
        (store, journal)
    }

    fn draft(id: &str) -> AuditDraft {
        AuditDraft::new("user-1", "record.write", "patient", id)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _) = memory_store().await;
        let record = Record::new("rec-1", "patient", serde_json::json!({"name": "A"}), t0());
        store.put(record, Some(0), draft("rec-1")).await.unwrap();

        let loaded = store.get("rec-1").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.payload["name"], "A");
        assert_eq!(store.read(|t| t.audit.len()).await, 1);
    }

    #[tokio::test]
    async fn test_put_version_conflict() {
        let (store, _) = memory_store().await;
        let record = Record::new("rec-1", "patient", serde_json::json!({}), t0());
        store.put(record.clone(), Some(0), draft("rec-1")).await.unwrap();

        let err = store.put(record, Some(0), draft("rec-1")).await.unwrap_err();
        assert!(matches!(
            err,
            ComplianceError::VersionConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(store.read(|t| t.audit.len()).await, 1);
    }

    #[tokio::test]
    async fn test_record_write_without_audit_is_rejected() {
        let (store, journal) = memory_store().await;
        let err = store
            .transaction("user-1", |tx| {
                tx.put_record(Record::new("rec-1", "patient", serde_json::json!({}), t0()), None)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ComplianceError::AuditRequired));
        assert!(store.get("rec-1").await.is_none());
        assert_eq!(journal.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_closure_error_rolls_back_all_writes() {
        let (store, _) = memory_store().await;
        let result: Result<()> = store
            .transaction("user-1", |tx| {
                tx.put_record(Record::new("rec-1", "patient", serde_json::json!({}), t0()), None)?;
                tx.audit().append(draft("rec-1"))?;
                Err(ComplianceError::Config("boom".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.get("rec-1").await.is_none());
        assert_eq!(store.read(|t| t.audit.len()).await, 0);
    }

    #[tokio::test]
    async fn test_journal_failure_aborts_mutation_and_audit() {
        let (store, journal) = memory_store().await;
        journal.set_fail_appends(true);

        let record = Record::new("rec-1", "patient", serde_json::json!({}), t0());
        let err = store.put(record, None, draft("rec-1")).await.unwrap_err();
        assert!(matches!(err, ComplianceError::Storage(_)));
        assert!(store.get("rec-1").await.is_none());
        assert_eq!(store.read(|t| t.audit.len()).await, 0);

        journal.set_fail_appends(false);
        let record = Record::new("rec-1", "patient", serde_json::json!({}), t0());
        store.put(record, None, draft("rec-1")).await.unwrap();
        assert_eq!(store.read(|t| t.commit_seq).await, 1);
    }

    /// Journal whose appends take a while, optionally failing afterwards
    struct SlowJournal {
        inner: MemoryJournal,
        delay: std::time::Duration,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Journal for SlowJournal {
        async fn append(&self, batch: &CommitBatch) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ComplianceError::Storage("disk full".to_string()));
            }
            self.inner.append(batch).await
        }

        async fn load(&self) -> Result<JournalState> {
            self.inner.load().await
        }

        async fn compact(&self, tables: &Tables) -> Result<()> {
            self.inner.compact(tables).await
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    async fn slow_store(fail: bool) -> (LocalStore, Arc<SlowJournal>) {
        let journal = Arc::new(SlowJournal {
            inner: MemoryJournal::new(),
            delay: std::time::Duration::from_millis(200),
            fail,
        });
        let store = LocalStore::open(journal.clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();
        (store, journal)
    }

    #[tokio::test]
    async fn test_abandoned_commit_still_journals_before_visible() {
        let (store, journal) = slow_store(false).await;
        let record = Record::new("rec-1", "patient", serde_json::json!({}), t0());

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            store.put(record, Some(0), draft("rec-1")),
        )
        .await;
        assert!(waited.is_err());

        // Readers wait for the commit to settle, then see it journaled
        assert!(store.get("rec-1").await.is_some());
        assert_eq!(store.read(|t| (t.audit.len(), t.commit_seq)).await, (1, 1));
        assert_eq!(journal.inner.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_commit_reverts_when_journal_fails() {
        let (store, journal) = slow_store(true).await;
        let record = Record::new("rec-1", "patient", serde_json::json!({}), t0());

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            store.put(record, Some(0), draft("rec-1")),
        )
        .await;
        assert!(waited.is_err());

        assert!(store.get("rec-1").await.is_none());
        assert_eq!(store.read(|t| (t.audit.len(), t.commit_seq)).await, (0, 0));
        assert_eq!(journal.inner.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let (store, _) = memory_store().await;
        let record = Record::new("rec-1", "patient", serde_json::json!({"name": "A"}), t0());
        store.put(record, None, draft("rec-1")).await.unwrap();

        let deleted = store.delete("rec-1", Some(1), draft("rec-1")).await.unwrap();
        assert_eq!(deleted.version, 2);
        assert!(deleted.is_deleted());

        let loaded = store.get("rec-1").await.unwrap();
        assert_eq!(loaded.payload["name"], "A");
        assert!(store.delete("rec-1", None, draft("rec-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_versions_never_decrease() {
        let (store, _) = memory_store().await;
        let mut record = Record::new("rec-1", "patient", serde_json::json!({}), t0());
        record.version = 5;
        store.put(record.clone(), None, draft("rec-1")).await.unwrap();

        record.version = 4;
        let err = store.put(record, None, draft("rec-1")).await.unwrap_err();
        assert!(matches!(err, ComplianceError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_reopen_replays_journal() {
        let (store, journal) = memory_store().await;
        let record = Record::new("rec-1", "patient", serde_json::json!({"n": 1}), t0());
        store.put(record, None, draft("rec-1")).await.unwrap();
        drop(store);

        let reopened = LocalStore::open(journal, Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();
        assert_eq!(reopened.get("rec-1").await.unwrap().payload["n"], 1);
        assert_eq!(reopened.read(|t| t.audit.len()).await, 1);
        assert_eq!(reopened.read(|t| t.commit_seq).await, 1);
    }

    #[tokio::test]
    async fn test_compact_then_reopen() {
        let (store, journal) = memory_store().await;
        for i in 0..3 {
            let id = format!("rec-{}", i);
            let record = Record::new(id.clone(), "patient", serde_json::json!({}), t0());
            store.put(record, None, draft(&id)).await.unwrap();
        }
        store.compact().await.unwrap();
        assert_eq!(journal.batch_count(), 0);

        let record = Record::new("rec-9", "patient", serde_json::json!({}), t0());
        store.put(record, None, draft("rec-9")).await.unwrap();
        drop(store);

        let reopened = LocalStore::open(journal, Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();
        assert_eq!(reopened.read(|t| t.records.len()).await, 4);
        assert_eq!(reopened.read(|t| t.commit_seq).await, 4);
    }

    #[tokio::test]
    async fn test_duplicate_audit_id_is_immutable() {
        let (store, _) = memory_store().await;
        let entry = store
            .transaction("user-1", |tx| tx.audit().append(draft("rec-1")))
            .await
            .unwrap();

        let err = store
            .transaction("user-1", |tx| tx.audit().append_entry(entry.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::AuditImmutable(id) if id == entry.id));
        assert_eq!(store.read(|t| t.audit.len()).await, 1);
    }
}
