//! Outbox drain and remote reconciliation
//!
//! `SyncEngine::drain` replays pending outbox entries against the remote
//! store, oldest first within each entity. Entities drain concurrently, but
//! an entity is never worked on by two drains at once. Before pushing, the
//! remote copy is fetched and reconciled when it moved past what was last
//! synced.

use crate::audit::AuditDraft;
use crate::config::{DrainConfig, RetryPolicy};
use crate::conflict::{self, ConflictChoice, Resolution};
use crate::error::{ComplianceError, Result};
use crate::remote::{ApplyOutcome, RemoteOp, RemoteRecord, RemoteStore};
use crate::schema::SchemaRegistry;
use crate::shutdown::{self, Shutdown};
use crate::store::{LocalStore, SyncMeta, Tables};
use crate::types::{OutboxEntry, OutboxStatus, Record, SyncStatus};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Actor recorded on audit entries written by the sync engine
pub const SYNC_ACTOR: &str = "system:sync";

/// Counters from one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Entries acknowledged by the remote store
    pub sent: usize,
    /// Entries the remote store had already applied
    pub duplicates: usize,
    /// Failed attempts that will be retried after backoff
    pub retried: usize,
    /// Entries that reached the attempt ceiling in this pass
    pub failed: usize,
    /// Entities newly held for manual resolution
    pub conflicts: usize,
    /// Entities merged or fast-forwarded from the remote copy
    pub reconciled: usize,
    /// Entities skipped: in flight elsewhere, backing off, blocked, or held
    pub skipped: usize,
    /// Whether shutdown interrupted the pass
    pub cancelled: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.sent += other.sent;
        self.duplicates += other.duplicates;
        self.retried += other.retried;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.reconciled += other.reconciled;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
    }
}

/// Marks an entity as being drained until dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    entity_id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, entity_id: &str) -> Option<Self> {
        let mut held = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(entity_id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            entity_id: entity_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.entity_id);
    }
}

/// Next undelivered entry of an entity, in creation order
fn head_entry(tables: &Tables, entity_id: &str) -> Option<OutboxEntry> {
    tables
        .outbox_for(entity_id)
        .find(|e| matches!(e.status, OutboxStatus::Pending | OutboxStatus::Failed))
        .cloned()
}

/// Sync status derived from the tables
pub fn sync_status(tables: &Tables) -> SyncStatus {
    let pending_count = tables
        .outbox
        .values()
        .filter(|e| e.status == OutboxStatus::Pending)
        .count();
    let failed_count = tables
        .outbox
        .values()
        .filter(|e| e.status == OutboxStatus::Failed)
        .count();
    let conflict_count = tables.conflicts.values().filter(|c| c.is_open()).count();

    SyncStatus {
        pending_count,
        failed_count,
        conflict_count,
        last_drain_at: tables.meta.last_drain_at,
        degraded: failed_count > 0 || conflict_count > 0,
    }
}

/// Pushes the outbox and reconciles with the remote store
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    schemas: Arc<dyn SchemaRegistry>,
    config: DrainConfig,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        schemas: Arc<dyn SchemaRegistry>,
        config: DrainConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            remote,
            schemas,
            config,
            retry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Current sync health
    pub async fn status(&self) -> SyncStatus {
        self.store.read(sync_status).await
    }

    /// Run one drain pass to completion
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_with_shutdown(&shutdown::never()).await
    }

    /// Run one drain pass, stopping early on shutdown
    ///
    /// An attempt interrupted by shutdown leaves its entry `pending` with
    /// its attempt count unchanged.
    pub async fn drain_with_shutdown(&self, shutdown: &Shutdown) -> Result<DrainReport> {
        let entities: Vec<String> = self
            .store
            .read(|t| {
                let mut seen = HashSet::new();
                t.outbox
                    .values()
                    .filter(|e| e.status == OutboxStatus::Pending)
                    .filter(|e| seen.insert(e.entity_id.clone()))
                    .map(|e| e.entity_id.clone())
                    .collect()
            })
            .await;

        let mut report = DrainReport::default();
        if shutdown::is_cancelled(shutdown) {
            report.cancelled = true;
            return Ok(report);
        }

        let results: Vec<Result<DrainReport>> = futures::stream::iter(entities)
            .map(|entity_id| {
                let shutdown = shutdown.clone();
                async move { self.drain_entity(&entity_id, shutdown).await }
            })
            .buffer_unordered(self.config.max_concurrent_entities.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(entity_report) => report.absorb(entity_report),
                Err(e) => {
                    tracing::warn!(error = %e, "Drain pass hit a local error");
                    first_error.get_or_insert(e);
                }
            }
        }

        let now = self.store.now();
        self.store
            .transaction(SYNC_ACTOR, |tx| {
                tx.set_meta(SyncMeta {
                    last_drain_at: Some(now),
                })
            })
            .await?;

        tracing::debug!(
            sent = report.sent,
            duplicates = report.duplicates,
            retried = report.retried,
            failed = report.failed,
            conflicts = report.conflicts,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Drain pass finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn drain_entity(&self, entity_id: &str, mut shutdown: Shutdown) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, entity_id) else {
            tracing::debug!(entity_id = entity_id, "Entity already in flight, skipping");
            report.skipped += 1;
            return Ok(report);
        };

        if self.store.read(|t| t.has_open_conflict(entity_id)).await {
            report.skipped += 1;
            return Ok(report);
        }

        let Some(head) = self.ready_head(entity_id).await else {
            report.skipped += 1;
            return Ok(report);
        };

        let remote = match self
            .guarded(self.remote.fetch(entity_id), &mut shutdown)
            .await
        {
            None => {
                report.cancelled = true;
                return Ok(report);
            }
            Some(Ok(remote)) => remote,
            Some(Err(e)) => {
                self.record_failure(&head, &e, &mut report).await?;
                return Ok(report);
            }
        };

        if let Some(remote) = remote {
            match self.reconcile_if_moved(&remote).await? {
                Some(Resolution::ManualRequired { .. }) => {
                    report.conflicts += 1;
                    return Ok(report);
                }
                Some(Resolution::Merged { .. }) | Some(Resolution::FastForward) => {
                    report.reconciled += 1;
                }
                _ => {}
            }
        }

        loop {
            if shutdown::is_cancelled(&shutdown) {
                report.cancelled = true;
                break;
            }

            let Some(entry) = self.ready_head(entity_id).await else {
                break;
            };

            let op = RemoteOp::from_entry(&entry);
            match self.guarded(self.remote.apply(&op), &mut shutdown).await {
                None => {
                    report.cancelled = true;
                    break;
                }
                Some(Ok(outcome)) => {
                    self.record_success(&entry, outcome).await?;
                    if outcome.is_duplicate() {
                        report.duplicates += 1;
                    } else {
                        report.sent += 1;
                    }
                }
                Some(Err(e)) => {
                    self.record_failure(&entry, &e, &mut report).await?;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Head entry if it may be attempted now
    async fn ready_head(&self, entity_id: &str) -> Option<OutboxEntry> {
        let now = self.store.now();
        let head = self.store.read(|t| head_entry(t, entity_id)).await?;
        if head.status != OutboxStatus::Pending || !head.ready_at(&self.retry, now) {
            return None;
        }
        Some(head)
    }

    /// Run a remote call under the request timeout, unless shutdown wins
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T>>,
        shutdown: &mut Shutdown,
    ) -> Option<Result<T>> {
        let timeout = self.config.request_timeout();
        tokio::select! {
            biased;
            _ = shutdown::cancelled(shutdown) => None,
            result = tokio::time::timeout(timeout, call) => Some(match result {
                Ok(result) => result,
                Err(_) => Err(ComplianceError::Timeout(format!(
                    "{} remote call exceeded {}s",
                    self.remote.name(),
                    timeout.as_secs()
                ))),
            }),
        }
    }

    async fn reconcile_if_moved(&self, remote: &RemoteRecord) -> Result<Option<Resolution>> {
        let synced = self
            .store
            .read(|t| t.records.get(&remote.entity_id).map(|r| r.synced_version))
            .await;
        if synced == Some(remote.version) {
            return Ok(None);
        }

        let sensitive = self.schemas.sensitive_fields(&remote.entity_type)?;
        let resolution = self
            .store
            .transaction(SYNC_ACTOR, |tx| conflict::reconcile(tx, remote, &sensitive))
            .await?;
        Ok(Some(resolution))
    }

    async fn record_success(&self, entry: &OutboxEntry, outcome: ApplyOutcome) -> Result<()> {
        let phi = self
            .schemas
            .touches_sensitive(&entry.entity_type, &entry.payload_snapshot)?;

        self.store
            .transaction(SYNC_ACTOR, |tx| {
                let current = tx.tables().outbox.get(&entry.seq).map(|e| e.status);
                // A concurrent pull may have superseded the entry mid-flight
                if current == Some(OutboxStatus::Pending) {
                    tx.outbox().mark_sent(entry.seq)?;
                }

                if let Some(mut record) = tx.record(&entry.entity_id).cloned() {
                    record.synced_version = record.synced_version.max(outcome.version());
                    record.base_payload = Some(entry.payload_snapshot.clone());
                    let newer_local = tx
                        .tables()
                        .outbox_for(&entry.entity_id)
                        .any(|e| e.seq != entry.seq && e.status == OutboxStatus::Pending);
                    record.dirty = newer_local;
                    tx.put_record(record, None)?;
                }

                tx.audit().append(
                    AuditDraft::new(SYNC_ACTOR, "sync.push", &entry.entity_type, &entry.entity_id)
                        .phi(phi)
                        .with_details(serde_json::json!({
                            "idempotencyKey": entry.idempotency_key.to_string(),
                            "remoteVersion": outcome.version(),
                            "duplicate": outcome.is_duplicate(),
                        })),
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(
            entity_id = %entry.entity_id,
            key = %entry.idempotency_key,
            remote_version = outcome.version(),
            duplicate = outcome.is_duplicate(),
            "Outbox entry delivered"
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        entry: &OutboxEntry,
        error: &ComplianceError,
        report: &mut DrainReport,
    ) -> Result<()> {
        let message = error.to_string();
        let retry = self.retry.clone();
        let updated = self
            .store
            .transaction(SYNC_ACTOR, |tx| {
                tx.outbox().record_failure(entry.seq, &message, &retry)
            })
            .await?;

        if updated.status == OutboxStatus::Failed {
            report.failed += 1;
            tracing::warn!(
                entity_id = %updated.entity_id,
                key = %updated.idempotency_key,
                attempts = updated.attempts,
                error = %message,
                "Outbox entry reached attempt ceiling, marked failed"
            );
        } else {
            report.retried += 1;
            tracing::warn!(
                entity_id = %updated.entity_id,
                key = %updated.idempotency_key,
                attempts = updated.attempts,
                retry_in_ms = self.retry.delay_after(updated.attempts).as_millis() as u64,
                error = %message,
                "Outbox delivery failed, will retry"
            );
        }
        Ok(())
    }

    /// Fetch and reconcile one entity on demand
    pub async fn pull(&self, entity_id: &str) -> Result<Resolution> {
        if self.store.read(|t| t.has_open_conflict(entity_id)).await {
            return Err(ComplianceError::ConflictPending(entity_id.to_string()));
        }

        let timeout = self.config.request_timeout();
        let remote = tokio::time::timeout(timeout, self.remote.fetch(entity_id))
            .await
            .map_err(|_| {
                ComplianceError::Timeout(format!(
                    "{} fetch of '{}' exceeded {}s",
                    self.remote.name(),
                    entity_id,
                    timeout.as_secs()
                ))
            })??;

        match remote {
            Some(remote) => Ok(self
                .reconcile_if_moved(&remote)
                .await?
                .unwrap_or(Resolution::UpToDate)),
            None => Ok(Resolution::UpToDate),
        }
    }

    /// Put a failed outbox entry back in the queue
    pub async fn retry_failed(&self, entry_id: &str, actor_id: &str) -> Result<OutboxEntry> {
        let entry = self
            .store
            .transaction(actor_id, |tx| {
                let entry = tx.outbox().requeue(entry_id)?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "sync.retry", &entry.entity_type, &entry.entity_id)
                        .with_details(serde_json::json!({ "entryId": entry.id })),
                )?;
                Ok(entry)
            })
            .await?;

        tracing::info!(
            entry_id = %entry.id,
            entity_id = %entry.entity_id,
            actor = actor_id,
            "Failed outbox entry re-queued"
        );
        Ok(entry)
    }

    /// Settle a manual conflict
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ConflictChoice,
        resolved_by: &str,
    ) -> Result<Record> {
        self.store
            .transaction(resolved_by, |tx| {
                conflict::resolve(tx, conflict_id, choice, resolved_by)
            })
            .await
    }

    /// Run drain passes every `interval_secs` until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: Shutdown) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = period.as_secs(), "Sync drain loop started");

            loop {
                tokio::select! {
                    _ = shutdown::cancelled(&mut shutdown) => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.drain_with_shutdown(&shutdown).await {
                    tracing::warn!(error = %e, "Drain pass failed");
                }
            }

            tracing::info!("Sync drain loop stopped");
        })
    }
}
