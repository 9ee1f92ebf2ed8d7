//! Command surface for collaborators
//!
//! `ComplianceService` wires the local store, sync engine, deadline engine
//! and alert manager together and is the only entry point UI code and
//! services are expected to use.

use crate::alerts::{AlertManager, SweepReport};
use crate::audit::{self, AuditDraft, AuditFilter, AuditPage, Page, TimeRange};
use crate::clock::{Clock, SystemClock};
use crate::compliance::{
    BreachIncident, BreachSeverity, BreachStatus, DataSubjectRequest, DeadlineEngine,
    RequestStatus, RequestType,
};
use crate::config::CoreConfig;
use crate::conflict::{ConflictChoice, Resolution};
use crate::crypto::Encryptor;
use crate::error::{ComplianceError, Result};
use crate::remote::RemoteStore;
use crate::schema::{EntitySchema, MemorySchemaRegistry, SchemaRegistry};
use crate::shutdown::Shutdown;
use crate::snapshot::ComplianceSnapshot;
use crate::store::{FileJournal, Journal, LocalStore, MemoryJournal};
use crate::sync::{DrainReport, SyncEngine};
use crate::types::{AuditAlert, AuditLogEntry, OpType, OutboxEntry, Record, SyncStatus};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A collaborator's request to create, update or delete a record
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub actor_id: String,
    pub entity_type: String,
    pub op_type: OpType,
    pub entity_id: String,
    /// Full replacement payload; ignored for deletes
    pub payload: serde_json::Value,
    /// Optimistic concurrency check against the current version
    pub expected_version: Option<u64>,
}

impl MutationRequest {
    /// Create a record under a fresh id
    pub fn create(
        actor_id: impl Into<String>,
        entity_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            entity_type: entity_type.into(),
            op_type: OpType::Create,
            entity_id: uuid::Uuid::new_v4().to_string(),
            payload,
            expected_version: None,
        }
    }

    pub fn update(
        actor_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            entity_type: entity_type.into(),
            op_type: OpType::Update,
            entity_id: entity_id.into(),
            payload,
            expected_version: None,
        }
    }

    pub fn delete(
        actor_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            entity_type: entity_type.into(),
            op_type: OpType::Delete,
            entity_id: entity_id.into(),
            payload: serde_json::Value::Null,
            expected_version: None,
        }
    }

    /// Use a caller-chosen id
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = entity_id.into();
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

fn touches(payload: &serde_json::Value, sensitive: &BTreeSet<String>) -> bool {
    payload
        .as_object()
        .is_some_and(|map| map.keys().any(|k| sensitive.contains(k)))
}

/// Offline-first sync and compliance engine
pub struct ComplianceService {
    config: CoreConfig,
    store: Arc<LocalStore>,
    schemas: Arc<dyn SchemaRegistry>,
    sync: Arc<SyncEngine>,
    deadlines: DeadlineEngine,
    alerts: Arc<AlertManager>,
}

impl ComplianceService {
    /// Assemble a service from an opened store
    pub fn new(
        config: CoreConfig,
        store: Arc<LocalStore>,
        schemas: Arc<dyn SchemaRegistry>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            remote,
            schemas.clone(),
            config.drain.clone(),
            config.retry.clone(),
        ));
        let deadlines = DeadlineEngine::new(store.clone(), config.deadlines.clone());
        let alerts = Arc::new(AlertManager::new(store.clone(), config.sweep.clone()));

        Self {
            config,
            store,
            schemas,
            sync,
            deadlines,
            alerts,
        }
    }

    /// Open a file-backed service under `dir`
    pub async fn open(
        dir: impl Into<PathBuf>,
        config: CoreConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let journal: Arc<dyn Journal> = Arc::new(FileJournal::new(dir));
        Self::with_journal(journal, config, remote, Arc::new(SystemClock)).await
    }

    /// Open a file-backed service whose journal and snapshot are encrypted
    pub async fn open_encrypted(
        dir: impl Into<PathBuf>,
        config: CoreConfig,
        remote: Arc<dyn RemoteStore>,
        encryptor: Arc<dyn Encryptor>,
    ) -> Result<Self> {
        let journal: Arc<dyn Journal> = Arc::new(FileJournal::new(dir).with_encryptor(encryptor));
        Self::with_journal(journal, config, remote, Arc::new(SystemClock)).await
    }

    /// In-memory service driven by `clock`
    pub async fn in_memory(
        config: CoreConfig,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_journal(Arc::new(MemoryJournal::new()), config, remote, clock).await
    }

    /// Open over any journal
    pub async fn with_journal(
        journal: Arc<dyn Journal>,
        config: CoreConfig,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::open(journal, clock).await?);
        Ok(Self::new(
            config,
            store,
            Arc::new(MemorySchemaRegistry::new()),
            remote,
        ))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn deadlines(&self) -> &DeadlineEngine {
        &self.deadlines
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Register or replace an entity schema
    pub fn register_schema(&self, schema: EntitySchema) -> Result<()> {
        self.schemas.register(schema)
    }

    // ── Records ──────────────────────────────────────────────────────

    /// Apply a create, update or delete together with its outbox entry and
    /// audit entry
    ///
    /// Entities held for manual conflict resolution reject mutations with
    /// `ConflictPending` until the conflict is resolved.
    pub async fn record_mutation(&self, request: MutationRequest) -> Result<Record> {
        self.schemas
            .validate(&request.entity_type, request.op_type, &request.payload)?;
        let sensitive = self.schemas.sensitive_fields(&request.entity_type)?;
        let MutationRequest {
            actor_id,
            entity_type,
            op_type,
            entity_id,
            payload,
            expected_version,
        } = request;

        let record = self
            .store
            .transaction(&actor_id, |tx| {
                if let Some(existing) = tx.record(&entity_id) {
                    if existing.entity_type != entity_type {
                        return Err(ComplianceError::SchemaValidation {
                            entity_type: entity_type.clone(),
                            reason: format!(
                                "Record '{}' is a '{}', not a '{}'",
                                entity_id, existing.entity_type, entity_type
                            ),
                        });
                    }
                }
                if tx.tables().has_open_conflict(&entity_id) {
                    return Err(ComplianceError::ConflictPending(entity_id.clone()));
                }

                let (record, phi) = match op_type {
                    OpType::Create => {
                        let record = Record::new(&entity_id, &entity_type, payload, tx.now());
                        tx.put_record(record.clone(), Some(expected_version.unwrap_or(0)))?;
                        let phi = touches(&record.payload, &sensitive);
                        (record, phi)
                    }
                    OpType::Update => {
                        let mut record = tx
                            .record(&entity_id)
                            .filter(|r| !r.is_deleted())
                            .cloned()
                            .ok_or_else(|| {
                                ComplianceError::NotFound(format!("Record not found: {}", entity_id))
                            })?;
                        let previous = record.version;
                        let phi = touches(&record.payload, &sensitive) || touches(&payload, &sensitive);
                        record.payload = payload;
                        record.version += 1;
                        record.dirty = true;
                        record.updated_at = tx.now();
                        tx.put_record(record.clone(), Some(expected_version.unwrap_or(previous)))?;
                        (record, phi)
                    }
                    OpType::Delete => {
                        let record = tx.tombstone_record(&entity_id, expected_version)?;
                        let phi = touches(&record.payload, &sensitive);
                        (record, phi)
                    }
                };

                tx.outbox().enqueue(
                    &record.id,
                    &record.entity_type,
                    op_type,
                    record.payload.clone(),
                    record.version,
                )?;
                tx.audit().append(
                    AuditDraft::new(
                        &actor_id,
                        format!("record.{}", op_type.as_str()),
                        &record.entity_type,
                        &record.id,
                    )
                    .phi(phi)
                    .with_details(serde_json::json!({ "version": record.version })),
                )?;
                Ok(record)
            })
            .await?;

        tracing::debug!(
            entity_id = %record.id,
            entity_type = %record.entity_type,
            op = %op_type,
            version = record.version,
            "Record mutation applied"
        );
        Ok(record)
    }

    /// Read a record; reads of records holding sensitive fields are audited
    pub async fn read_record(&self, actor_id: &str, entity_id: &str) -> Result<Record> {
        let schemas = self.schemas.clone();
        self.store
            .transaction(actor_id, |tx| {
                let record = tx
                    .record(entity_id)
                    .cloned()
                    .ok_or_else(|| ComplianceError::NotFound(format!("Record not found: {}", entity_id)))?;

                let sensitive = schemas.sensitive_fields(&record.entity_type)?;
                if touches(&record.payload, &sensitive) {
                    tx.audit().append(
                        AuditDraft::new(actor_id, "record.read", &record.entity_type, &record.id)
                            .phi(true)
                            .with_details(serde_json::json!({ "version": record.version })),
                    )?;
                }
                Ok(record)
            })
            .await
    }

    // ── Sync ─────────────────────────────────────────────────────────

    pub async fn get_sync_status(&self) -> SyncStatus {
        self.sync.status().await
    }

    /// Run one drain pass now
    pub async fn drain(&self) -> Result<DrainReport> {
        self.sync.drain().await
    }

    /// Fetch and reconcile one entity now
    pub async fn pull(&self, entity_id: &str) -> Result<Resolution> {
        self.sync.pull(entity_id).await
    }

    pub async fn retry_failed(&self, entry_id: &str, actor_id: &str) -> Result<OutboxEntry> {
        self.sync.retry_failed(entry_id, actor_id).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ConflictChoice,
        resolved_by: &str,
    ) -> Result<Record> {
        self.sync
            .resolve_conflict(conflict_id, choice, resolved_by)
            .await
    }

    // ── Audit ────────────────────────────────────────────────────────

    /// Query the audit log, oldest first
    ///
    /// The page size is capped at `audit_page_limit`.
    pub async fn query_audit_log(
        &self,
        filter: &AuditFilter,
        range: &TimeRange,
        page: Page,
    ) -> AuditPage {
        let max = self.config.audit_page_limit;
        self.store
            .read(|t| audit::query(t, filter, range, page, max))
            .await
    }

    /// Audit entries cannot be changed; the attempt itself is audited
    pub async fn amend_audit_entry(
        &self,
        actor_id: &str,
        entry_id: &str,
        _changes: serde_json::Value,
    ) -> Result<AuditLogEntry> {
        self.reject_tamper(actor_id, entry_id, "amend").await
    }

    /// Audit entries cannot be removed; the attempt itself is audited
    pub async fn delete_audit_entry(&self, actor_id: &str, entry_id: &str) -> Result<()> {
        self.reject_tamper(actor_id, entry_id, "delete").await.map(|_| ())
    }

    async fn reject_tamper(
        &self,
        actor_id: &str,
        entry_id: &str,
        attempted: &str,
    ) -> Result<AuditLogEntry> {
        self.store
            .transaction(actor_id, |tx| {
                if !tx.tables().audit_contains(entry_id) {
                    return Err(ComplianceError::NotFound(format!(
                        "Audit entry not found: {}",
                        entry_id
                    )));
                }
                tx.audit().append(
                    AuditDraft::new(actor_id, "audit.tamper_attempt", "audit_log_entry", entry_id)
                        .non_compliant()
                        .with_details(serde_json::json!({ "attempted": attempted })),
                )?;
                Ok(())
            })
            .await?;

        tracing::warn!(
            actor = actor_id,
            entry_id = entry_id,
            attempted = attempted,
            "Rejected attempt to modify audit log"
        );
        Err(ComplianceError::AuditImmutable(entry_id.to_string()))
    }

    // ── Breaches and data-subject requests ───────────────────────────

    pub async fn report_breach(
        &self,
        actor_id: &str,
        breach_type: &str,
        severity: BreachSeverity,
        description: &str,
        affected_user_ids: Vec<String>,
    ) -> Result<BreachIncident> {
        self.deadlines
            .report_breach(actor_id, breach_type, severity, description, affected_user_ids)
            .await
    }

    pub async fn advance_breach(
        &self,
        actor_id: &str,
        id: &str,
        next: BreachStatus,
    ) -> Result<BreachIncident> {
        self.deadlines.advance_breach(actor_id, id, next).await
    }

    pub async fn mark_regulator_notified(&self, actor_id: &str, id: &str) -> Result<BreachIncident> {
        self.deadlines.mark_regulator_notified(actor_id, id).await
    }

    pub async fn mark_users_notified(&self, actor_id: &str, id: &str) -> Result<BreachIncident> {
        self.deadlines.mark_users_notified(actor_id, id).await
    }

    pub async fn file_data_subject_request(
        &self,
        actor_id: &str,
        user_id: &str,
        request_type: RequestType,
        details: serde_json::Value,
    ) -> Result<DataSubjectRequest> {
        self.deadlines
            .file_data_subject_request(actor_id, user_id, request_type, details)
            .await
    }

    pub async fn advance_request(
        &self,
        actor_id: &str,
        id: &str,
        next: RequestStatus,
    ) -> Result<DataSubjectRequest> {
        self.deadlines.advance_request(actor_id, id, next).await
    }

    // ── Alerts ───────────────────────────────────────────────────────

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.alerts.sweep().await
    }

    pub async fn resolve_alert(&self, id: &str, resolved_by: &str) -> Result<AuditAlert> {
        self.alerts.resolve_alert(id, resolved_by).await
    }

    pub async fn open_alerts(&self) -> Vec<AuditAlert> {
        self.alerts.open_alerts().await
    }

    /// Current rollup, recomputed on every call
    pub async fn get_compliance_snapshot(&self) -> ComplianceSnapshot {
        let now = self.store.now();
        self.store
            .read(|t| ComplianceSnapshot::compute(t, now))
            .await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the drain and sweep loops
    pub fn spawn_background(&self, shutdown: Shutdown) -> Vec<JoinHandle<()>> {
        vec![
            self.sync.clone().spawn(shutdown.clone()),
            self.alerts.clone().spawn(shutdown),
        ]
    }

    /// Snapshot the store and truncate its journal
    pub async fn compact(&self) -> Result<()> {
        self.store.compact().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::MemoryRemote;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    async fn service() -> ComplianceService {
        let service = ComplianceService::in_memory(
            CoreConfig::default(),
            Arc::new(MemoryRemote::new()),
            Arc::new(ManualClock::new(t0())),
        )
        .await
        .unwrap();
        service
            .register_schema(
                EntitySchema::new("patient")
                    .required(&["name"])
                    .sensitive(&["diagnosis"]),
            )
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_mutation_writes_record_outbox_and_audit() {
        let service = service().await;
        let record = service
            .record_mutation(MutationRequest::create(
                "dr-a",
                "patient",
                serde_json::json!({"name": "A", "diagnosis": "flu"}),
            ))
            .await
            .unwrap();
        assert_eq!(record.version, 1);
        assert!(record.dirty);

        let (outbox, audit) = service
            .store()
            .read(|t| (t.outbox.len(), t.audit.clone()))
            .await;
        assert_eq!(outbox, 1);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "record.create");
        assert!(audit[0].phi_accessed);
        assert_eq!(service.get_sync_status().await.pending_count, 1);
    }

    #[tokio::test]
    async fn test_update_checks_expected_version() {
        let service = service().await;
        let record = service
            .record_mutation(MutationRequest::create("dr-a", "patient", serde_json::json!({"name": "A"})))
            .await
            .unwrap();

        let updated = service
            .record_mutation(
                MutationRequest::update("dr-a", "patient", &record.id, serde_json::json!({"name": "B"}))
                    .with_expected_version(1),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.payload["name"], "B");

        let err = service
            .record_mutation(
                MutationRequest::update("dr-a", "patient", &record.id, serde_json::json!({"name": "C"}))
                    .with_expected_version(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComplianceError::VersionConflict { expected: 1, actual: 2, .. }
        ));
        assert_eq!(service.store().read(|t| t.outbox.len()).await, 2);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id_and_missing_fields() {
        let service = service().await;
        let record = service
            .record_mutation(
                MutationRequest::create("dr-a", "patient", serde_json::json!({"name": "A"}))
                    .with_entity_id("p-1"),
            )
            .await
            .unwrap();
        assert_eq!(record.id, "p-1");

        let err = service
            .record_mutation(
                MutationRequest::create("dr-a", "patient", serde_json::json!({"name": "A"}))
                    .with_entity_id("p-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::VersionConflict { .. }));

        let err = service
            .record_mutation(MutationRequest::create("dr-a", "patient", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::SchemaValidation { .. }));
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_blocks_updates() {
        let service = service().await;
        let record = service
            .record_mutation(MutationRequest::create("dr-a", "patient", serde_json::json!({"name": "A"})))
            .await
            .unwrap();
        let deleted = service
            .record_mutation(MutationRequest::delete("dr-a", "patient", &record.id))
            .await
            .unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.version, 2);

        let err = service
            .record_mutation(MutationRequest::update(
                "dr-a",
                "patient",
                &record.id,
                serde_json::json!({"name": "B"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::NotFound(_)));
        assert!(service.read_record("dr-a", &record.id).await.unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_sensitive_read_is_audited() {
        let service = service().await;
        let plain = service
            .record_mutation(MutationRequest::create("dr-a", "patient", serde_json::json!({"name": "A"})))
            .await
            .unwrap();
        let phi = service
            .record_mutation(MutationRequest::create(
                "dr-a",
                "patient",
                serde_json::json!({"name": "B", "diagnosis": "x"}),
            ))
            .await
            .unwrap();

        service.read_record("nurse", &plain.id).await.unwrap();
        service.read_record("nurse", &phi.id).await.unwrap();

        let page = service
            .query_audit_log(&AuditFilter::actor("nurse"), &TimeRange::all(), Page::default())
            .await;
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].resource_id, phi.id);
        assert!(page.entries[0].phi_accessed);
    }

    #[tokio::test]
    async fn test_audit_tampering_always_fails() {
        let service = service().await;
        let record = service
            .record_mutation(MutationRequest::create("dr-a", "patient", serde_json::json!({"name": "A"})))
            .await
            .unwrap();
        let entry_id = service.store().read(|t| t.audit[0].id.clone()).await;

        for _ in 0..3 {
            assert!(matches!(
                service
                    .amend_audit_entry("mallory", &entry_id, serde_json::json!({"actorId": "x"}))
                    .await,
                Err(ComplianceError::AuditImmutable(_))
            ));
            assert!(matches!(
                service.delete_audit_entry("mallory", &entry_id).await,
                Err(ComplianceError::AuditImmutable(_))
            ));
        }

        let audit = service.store().read(|t| t.audit.clone()).await;
        assert_eq!(audit[0].resource_id, record.id);
        assert_eq!(audit[0].actor_id, "dr-a");
        assert_eq!(audit.iter().filter(|e| !e.compliant).count(), 6);
    }

    #[tokio::test]
    async fn test_failed_audit_append_aborts_mutation() {
        let journal = Arc::new(MemoryJournal::new());
        let service = ComplianceService::with_journal(
            journal.clone(),
            CoreConfig::default(),
            Arc::new(MemoryRemote::new()),
            Arc::new(ManualClock::new(t0())),
        )
        .await
        .unwrap();

        journal.set_fail_appends(true);
        let err = service
            .record_mutation(MutationRequest::create("dr-a", "note", serde_json::json!({"t": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::Storage(_)));

        let (records, outbox, audit) = service
            .store()
            .read(|t| (t.records.len(), t.outbox.len(), t.audit.len()))
            .await;
        assert_eq!((records, outbox, audit), (0, 0, 0));
    }
}
