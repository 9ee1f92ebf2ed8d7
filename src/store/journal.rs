//! Write-ahead journal for the local store
//!
//! Every committed transaction becomes one `CommitBatch` line. On open the
//! store loads the latest snapshot and replays batches newer than it.

use super::{SyncMeta, Tables};
use crate::compliance::types::{BreachIncident, DataSubjectRequest};
use crate::crypto::{Encryptor, SealedEnvelope};
use crate::error::{ComplianceError, Result};
use crate::types::{AuditAlert, AuditLogEntry, ConflictRecord, OutboxEntry, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

/// One table write inside a commit batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum WriteOp {
    PutRecord(Record),
    PutOutbox(OutboxEntry),
    AppendAudit(AuditLogEntry),
    PutBreach(BreachIncident),
    PutRequest(DataSubjectRequest),
    PutAlert(AuditAlert),
    PutConflict(ConflictRecord),
    SetMeta(SyncMeta),
}

/// All writes of one committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBatch {
    pub seq: u64,
    pub committed_at: DateTime<Utc>,
    pub actor: String,
    pub ops: Vec<WriteOp>,
}

/// What a journal holds on open
#[derive(Debug, Default)]
pub struct JournalState {
    pub snapshot: Option<Tables>,
    pub batches: Vec<CommitBatch>,
}

/// Durable log of commit batches
#[async_trait]
pub trait Journal: Send + Sync {
    /// Durably append a batch; the commit fails if this fails
    async fn append(&self, batch: &CommitBatch) -> Result<()>;

    /// Load the latest snapshot and every batch written after it
    async fn load(&self) -> Result<JournalState>;

    /// Persist a full snapshot and drop the batches it covers
    async fn compact(&self, tables: &Tables) -> Result<()>;

    /// Journal name for logging
    fn name(&self) -> &str;
}

/// JSON-lines journal with an atomic snapshot file
///
/// Layout inside `dir`:
/// - `journal.jsonl`: one commit batch per line, fsynced on append
/// - `snapshot.json`: full tables, written via temp file + rename
///
/// With an encryptor configured, each line and the snapshot are sealed.
pub struct FileJournal {
    dir: PathBuf,
    encryptor: Option<Arc<dyn Encryptor>>,
    /// Bytes the next append writes before failing
    #[cfg(test)]
    torn_write: Mutex<Option<usize>>,
}

impl FileJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            encryptor: None,
            #[cfg(test)]
            torn_write: Mutex::new(None),
        }
    }

    /// Seal journal lines and snapshots at rest
    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join("journal.jsonl")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    async fn write_line(&self, file: &mut tokio::fs::File, line: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.torn_write.lock().ok().and_then(|mut t| t.take()) {
            file.write_all(&line[..limit.min(line.len())]).await?;
            file.flush().await?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected torn write"));
        }
        file.write_all(line).await?;
        file.sync_data().await
    }

    /// Make the next append write `bytes` bytes and then fail
    #[cfg(test)]
    fn tear_next_append(&self, bytes: usize) {
        if let Ok(mut torn) = self.torn_write.lock() {
            *torn = Some(bytes);
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<String> {
        let value = serde_json::to_value(value)?;
        let value = match &self.encryptor {
            Some(enc) => enc.seal(&value)?,
            None => value,
        };
        serde_json::to_string(&value).map_err(Into::into)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, text: &str) -> Result<T> {
        self.decode_value(serde_json::from_str(text)?)
    }

    fn decode_value<T: serde::de::DeserializeOwned>(&self, value: serde_json::Value) -> Result<T> {
        let value = if SealedEnvelope::is_sealed(&value) {
            let enc = self.encryptor.as_ref().ok_or_else(|| {
                ComplianceError::Crypto(
                    "Journal is encrypted but no encryptor is configured".to_string(),
                )
            })?;
            enc.open(&value)?
        } else {
            value
        };
        serde_json::from_value(value).map_err(Into::into)
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            ComplianceError::Storage(format!(
                "Failed to create journal directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    async fn read_snapshot(&self) -> Result<Option<Tables>> {
        let path = self.snapshot_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let tables = self.decode(&text).map_err(|e| {
                    ComplianceError::Storage(format!(
                        "Failed to parse snapshot {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(tables))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ComplianceError::Storage(format!(
                "Failed to read snapshot {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn read_batches(&self) -> Result<Vec<CommitBatch>> {
        let path = self.journal_path();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ComplianceError::Storage(format!(
                    "Failed to read journal {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut batches = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => {
                    let batch = self.decode_value::<CommitBatch>(value).map_err(|e| {
                        ComplianceError::Storage(format!(
                            "Failed to decode journal line {} in {}: {}",
                            idx + 1,
                            path.display(),
                            e
                        ))
                    })?;
                    batches.push(batch);
                }
                // A crash mid-append can leave a torn final line; that batch never committed
                Err(e) if idx + 1 == lines.len() => {
                    tracing::warn!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %e,
                        "Dropping torn journal tail"
                    );
                    let mut kept = lines[..idx].join("\n");
                    if !kept.is_empty() {
                        kept.push('\n');
                    }
                    tokio::fs::write(&path, kept).await.map_err(|e| {
                        ComplianceError::Storage(format!(
                            "Failed to truncate torn journal {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                }
                Err(e) => {
                    return Err(ComplianceError::Storage(format!(
                        "Corrupt journal line {} in {}: {}",
                        idx + 1,
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(batches)
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, batch: &CommitBatch) -> Result<()> {
        self.ensure_dir().await?;
        let mut line = self.encode(batch)?;
        line.push('\n');

        let path = self.journal_path();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                ComplianceError::Storage(format!("Failed to open journal {}: {}", path.display(), e))
            })?;
        let committed_len = file
            .metadata()
            .await
            .map_err(|e| {
                ComplianceError::Storage(format!("Failed to stat journal {}: {}", path.display(), e))
            })?
            .len();

        if let Err(e) = self.write_line(&mut file, line.as_bytes()).await {
            // Nothing of a failed batch may survive on disk
            if let Err(rewind_err) = rewind(&mut file, committed_len).await {
                tracing::warn!(
                    path = %path.display(),
                    len = committed_len,
                    error = %rewind_err,
                    "Failed to rewind journal after append error"
                );
            }
            return Err(ComplianceError::Storage(format!(
                "Failed to append to journal {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn load(&self) -> Result<JournalState> {
        let snapshot = self.read_snapshot().await?;
        let batches = self.read_batches().await?;
        tracing::debug!(
            dir = %self.dir.display(),
            snapshot = snapshot.is_some(),
            batches = batches.len(),
            "Journal loaded"
        );
        Ok(JournalState { snapshot, batches })
    }

    async fn compact(&self, tables: &Tables) -> Result<()> {
        self.ensure_dir().await?;
        let body = self.encode(tables)?;

        let path = self.snapshot_path();
        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| {
            ComplianceError::Storage(format!(
                "Failed to create snapshot {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        file.write_all(body.as_bytes()).await.map_err(|e| {
            ComplianceError::Storage(format!(
                "Failed to write snapshot {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        file.sync_all().await.map_err(|e| {
            ComplianceError::Storage(format!("Failed to sync snapshot {}: {}", tmp_path.display(), e))
        })?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            ComplianceError::Storage(format!(
                "Failed to rename snapshot {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        // Batches at or below the snapshot's commit_seq are skipped on replay,
        // so a crash before truncation is harmless
        let journal = self.journal_path();
        tokio::fs::write(&journal, b"").await.map_err(|e| {
            ComplianceError::Storage(format!(
                "Failed to truncate journal {}: {}",
                journal.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), seq = tables.commit_seq, "Snapshot written");
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Cut the journal back to its last committed length
async fn rewind(file: &mut tokio::fs::File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.sync_data().await
}

/// In-memory journal for tests
///
/// Share one instance across two `LocalStore::open` calls to simulate a
/// restart. Appends can be made to fail to exercise rollback.
#[derive(Default)]
pub struct MemoryJournal {
    batches: Mutex<Vec<CommitBatch>>,
    snapshot: Mutex<Option<Tables>>,
    fail_appends: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail with a storage error
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of batches written since the last compaction
    pub fn batch_count(&self) -> usize {
        self.batches.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, batch: &CommitBatch) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(ComplianceError::Storage(
                "Injected journal append failure".to_string(),
            ));
        }
        let mut batches = self.batches.lock().map_err(|e| {
            ComplianceError::Storage(format!("Failed to acquire journal lock: {}", e))
        })?;
        batches.push(batch.clone());
        Ok(())
    }

    async fn load(&self) -> Result<JournalState> {
        let snapshot = self
            .snapshot
            .lock()
            .map_err(|e| ComplianceError::Storage(format!("Failed to acquire journal lock: {}", e)))?
            .clone();
        let batches = self
            .batches
            .lock()
            .map_err(|e| ComplianceError::Storage(format!("Failed to acquire journal lock: {}", e)))?
            .clone();
        Ok(JournalState { snapshot, batches })
    }

    async fn compact(&self, tables: &Tables) -> Result<()> {
        *self
            .snapshot
            .lock()
            .map_err(|e| ComplianceError::Storage(format!("Failed to acquire journal lock: {}", e)))? =
            Some(tables.clone());
        self.batches
            .lock()
            .map_err(|e| ComplianceError::Storage(format!("Failed to acquire journal lock: {}", e)))?
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmEncryptor;
    use chrono::TimeZone;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("a3s-compliance-test-{}", uuid::Uuid::new_v4()))
    }

    fn batch(seq: u64) -> CommitBatch {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        CommitBatch {
            seq,
            committed_at: at,
            actor: "user-1".to_string(),
            ops: vec![WriteOp::PutRecord(Record::new(
                format!("rec-{}", seq),
                "patient",
                serde_json::json!({"diagnosis": "confidential"}),
                at,
            ))],
        }
    }

    #[tokio::test]
    async fn test_file_journal_append_load() {
        let dir = temp_dir();
        let journal = FileJournal::new(&dir);
        journal.append(&batch(1)).await.unwrap();
        journal.append(&batch(2)).await.unwrap();

        let state = journal.load().await.unwrap();
        assert!(state.snapshot.is_none());
        assert_eq!(state.batches.len(), 2);
        assert_eq!(state.batches[1], batch(2));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_file_journal_load_missing_dir() {
        let journal = FileJournal::new(temp_dir());
        let state = journal.load().await.unwrap();
        assert!(state.snapshot.is_none());
        assert!(state.batches.is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = temp_dir();
        let journal = FileJournal::new(&dir);
        journal.append(&batch(1)).await.unwrap();

        let mut content = std::fs::read_to_string(journal.journal_path()).unwrap();
        content.push_str("{\"seq\":2,\"commi");
        std::fs::write(journal.journal_path(), content).unwrap();

        let state = journal.load().await.unwrap();
        assert_eq!(state.batches.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_partial_line() {
        let dir = temp_dir();
        let journal = FileJournal::new(&dir);
        journal.append(&batch(1)).await.unwrap();
        let committed = std::fs::read_to_string(journal.journal_path()).unwrap();

        journal.tear_next_append(20);
        let err = journal.append(&batch(2)).await.unwrap_err();
        assert!(matches!(err, ComplianceError::Storage(_)));
        assert_eq!(std::fs::read_to_string(journal.journal_path()).unwrap(), committed);

        journal.append(&batch(3)).await.unwrap();
        let state = journal.load().await.unwrap();
        let seqs: Vec<u64> = state.batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 3]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_fails() {
        let dir = temp_dir();
        let journal = FileJournal::new(&dir);
        journal.append(&batch(1)).await.unwrap();

        let mut content = std::fs::read_to_string(journal.journal_path()).unwrap();
        content.push_str("garbage\n");
        std::fs::write(journal.journal_path(), content).unwrap();
        journal.append(&batch(3)).await.unwrap();

        let err = journal.load().await.unwrap_err();
        assert!(matches!(err, ComplianceError::Storage(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_compact_writes_snapshot_and_truncates() {
        let dir = temp_dir();
        let journal = FileJournal::new(&dir);
        journal.append(&batch(1)).await.unwrap();

        let mut tables = Tables::default();
        tables.commit_seq = 1;
        journal.compact(&tables).await.unwrap();
        assert!(!journal.snapshot_path().with_extension("tmp").exists());

        let state = journal.load().await.unwrap();
        assert_eq!(state.snapshot.unwrap().commit_seq, 1);
        assert!(state.batches.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_encrypted_journal_hides_payloads() {
        let dir = temp_dir();
        let enc: Arc<dyn Encryptor> = Arc::new(Aes256GcmEncryptor::new("k1", &[9u8; 32]));
        let journal = FileJournal::new(&dir).with_encryptor(enc.clone());
        journal.append(&batch(1)).await.unwrap();

        let raw = std::fs::read_to_string(journal.journal_path()).unwrap();
        assert!(!raw.contains("confidential"));

        let state = journal.load().await.unwrap();
        assert_eq!(state.batches[0], batch(1));

        let plain = FileJournal::new(&dir);
        assert!(plain.load().await.is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_memory_journal_failure_injection() {
        let journal = MemoryJournal::new();
        journal.set_fail_appends(true);
        assert!(journal.append(&batch(1)).await.is_err());
        assert_eq!(journal.batch_count(), 0);

        journal.set_fail_appends(false);
        journal.append(&batch(1)).await.unwrap();
        assert_eq!(journal.batch_count(), 1);
    }
}
