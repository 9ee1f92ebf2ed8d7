//! Conflict resolver
//!
//! Reconciles a local record with its remote copy when the remote version
//! moved past what was last synced. Each record keeps the payload as of the
//! last sync (`base_payload`), which tells which side changed which field.
//!
//! Rules, in order:
//! - remote at or below `synced_version`: nothing to do
//! - local clean: fast-forward to the remote copy
//! - a sensitive field changed on both sides to different values: stop and
//!   hand the pair to a human (`ConflictRecord`), never pick a side
//! - remote at or below the local version: keep local and push over remote,
//!   unless that would overwrite a sensitive field only the remote changed,
//!   which also goes to a human
//! - otherwise merge field by field, last writer wins by timestamp

use crate::alerts::raise_deduped;
use crate::audit::AuditDraft;
use crate::error::{ComplianceError, Result};
use crate::remote::RemoteRecord;
use crate::store::Transaction;
use crate::types::{
    AlertSeverity, AlertType, AuditAlert, ConflictRecord, ConflictStatus, OpType, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// What reconciliation decided for one entity
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    UpToDate,
    FastForward,
    KeepLocal,
    Merge {
        payload: Value,
        deleted: bool,
        changed_fields: Vec<String>,
    },
    Manual {
        fields: Vec<String>,
    },
}

/// Outcome reported to callers after a plan was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    UpToDate,
    FastForward,
    KeepLocal,
    Merged { changed_fields: Vec<String> },
    ManualRequired { conflict_id: String, fields: Vec<String> },
}

impl Resolution {
    pub fn is_manual(&self) -> bool {
        matches!(self, Resolution::ManualRequired { .. })
    }
}

/// How a human settled a manual conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "payload", rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
    Merged(Value),
}

impl ConflictChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictChoice::KeepLocal => "keep_local",
            ConflictChoice::KeepRemote => "keep_remote",
            ConflictChoice::Merged(_) => "merged",
        }
    }
}

fn as_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Top-level fields whose value differs between `base` and `other`
fn changed_fields(base: &Map<String, Value>, other: &Map<String, Value>) -> BTreeSet<String> {
    base.keys()
        .chain(other.keys())
        .filter(|k| base.get(*k) != other.get(*k))
        .cloned()
        .collect()
}

/// Decide how to reconcile `local` with `remote`
pub fn plan(local: Option<&Record>, remote: &RemoteRecord, sensitive: &BTreeSet<String>) -> Plan {
    let local = match local {
        Some(local) => local,
        None => return Plan::FastForward,
    };

    if remote.version <= local.synced_version {
        return Plan::UpToDate;
    }
    if !local.dirty {
        return Plan::FastForward;
    }

    let base = local.base_payload.as_ref().map(as_object).unwrap_or_default();
    let ours = as_object(&local.payload);
    let theirs = as_object(&remote.payload);
    let local_changed = changed_fields(&base, &ours);
    let remote_changed = changed_fields(&base, &theirs);

    let contested: Vec<String> = local_changed
        .intersection(&remote_changed)
        .filter(|f| sensitive.contains(*f) && ours.get(*f) != theirs.get(*f))
        .cloned()
        .collect();
    if !contested.is_empty() {
        return Plan::Manual { fields: contested };
    }

    if remote.version <= local.version {
        // Pushing local would overwrite a sensitive value only the remote changed
        let overwritten: Vec<String> = remote_changed
            .iter()
            .filter(|f| sensitive.contains(*f) && ours.get(*f) != theirs.get(*f))
            .cloned()
            .collect();
        if !overwritten.is_empty() {
            return Plan::Manual {
                fields: overwritten,
            };
        }
        return Plan::KeepLocal;
    }

    // Ties go to the remote copy
    let local_wins = local.updated_at > remote.updated_at;

    if local.is_deleted() || remote.deleted {
        if !local_wins {
            return Plan::FastForward;
        }
        return Plan::Merge {
            payload: local.payload.clone(),
            deleted: local.is_deleted(),
            changed_fields: changed_fields(&theirs, &ours).into_iter().collect(),
        };
    }

    let mut merged = theirs.clone();
    for field in &local_changed {
        if remote_changed.contains(field) && !local_wins {
            continue;
        }
        match ours.get(field) {
            Some(value) => {
                merged.insert(field.clone(), value.clone());
            }
            None => {
                merged.remove(field);
            }
        }
    }

    let changed: Vec<String> = changed_fields(&theirs, &merged).into_iter().collect();
    Plan::Merge {
        payload: Value::Object(merged),
        deleted: false,
        changed_fields: changed,
    }
}

/// Reconcile the local copy of `remote.entity_id` inside a transaction
pub(crate) fn reconcile(
    tx: &mut Transaction<'_>,
    remote: &RemoteRecord,
    sensitive: &BTreeSet<String>,
) -> Result<Resolution> {
    let local = tx.record(&remote.entity_id).cloned();
    let decided = plan(local.as_ref(), remote, sensitive);
    let actor = tx.actor().to_string();
    let phi = remote
        .payload
        .as_object()
        .is_some_and(|m| m.keys().any(|k| sensitive.contains(k)));

    match decided {
        Plan::UpToDate => Ok(Resolution::UpToDate),

        Plan::FastForward => {
            let now = tx.now();
            let mut record = local.clone().unwrap_or_else(|| {
                Record::new(
                    remote.entity_id.clone(),
                    remote.entity_type.clone(),
                    Value::Null,
                    remote.updated_at,
                )
            });
            record.payload = remote.payload.clone();
            record.version = record.version.max(remote.version);
            record.dirty = false;
            record.synced_version = remote.version;
            record.base_payload = Some(remote.payload.clone());
            record.updated_at = remote.updated_at;
            record.deleted_at = remote.deleted.then_some(remote.updated_at);

            let superseded = tx.outbox().supersede(&remote.entity_id)?;
            tx.put_record(record, None)?;
            tx.audit().append(
                AuditDraft::new(&actor, "sync.pull", &remote.entity_type, &remote.entity_id)
                    .phi(phi)
                    .with_details(serde_json::json!({
                        "remoteVersion": remote.version,
                        "superseded": superseded,
                        "at": now,
                    })),
            )?;
            tracing::debug!(
                entity_id = %remote.entity_id,
                remote_version = remote.version,
                "Local record fast-forwarded"
            );
            Ok(Resolution::FastForward)
        }

        Plan::KeepLocal => {
            let Some(mut record) = local else {
                return Ok(Resolution::UpToDate);
            };
            record.synced_version = remote.version;
            record.base_payload = Some(remote.payload.clone());
            tx.put_record(record.clone(), None)?;
            tx.audit().append(
                AuditDraft::new(&actor, "sync.keep_local", &record.entity_type, &record.id)
                    .with_details(serde_json::json!({
                        "localVersion": record.version,
                        "remoteVersion": remote.version,
                    })),
            )?;
            tracing::debug!(
                entity_id = %record.id,
                local_version = record.version,
                remote_version = remote.version,
                "Local changes kept over older remote copy"
            );
            Ok(Resolution::KeepLocal)
        }

        Plan::Merge {
            payload,
            deleted,
            changed_fields,
        } => {
            let Some(mut record) = local else {
                return Ok(Resolution::UpToDate);
            };
            let now = tx.now();
            tx.outbox().supersede(&record.id)?;

            record.version = record.version.max(remote.version) + 1;
            record.payload = payload;
            record.dirty = true;
            record.synced_version = remote.version;
            record.base_payload = Some(remote.payload.clone());
            record.updated_at = now;
            record.deleted_at = if deleted {
                record.deleted_at.or(Some(now))
            } else {
                None
            };

            let op = if deleted { OpType::Delete } else { OpType::Update };
            tx.outbox().enqueue(
                &record.id,
                &record.entity_type,
                op,
                record.payload.clone(),
                record.version,
            )?;
            tx.put_record(record.clone(), None)?;
            tx.audit().append(
                AuditDraft::new(&actor, "sync.merge", &record.entity_type, &record.id)
                    .phi(phi)
                    .with_details(serde_json::json!({
                        "localFields": changed_fields,
                        "remoteVersion": remote.version,
                        "version": record.version,
                    })),
            )?;
            tracing::info!(
                entity_id = %record.id,
                version = record.version,
                fields = ?changed_fields,
                "Local and remote changes merged"
            );
            Ok(Resolution::Merged { changed_fields })
        }

        Plan::Manual { fields } => {
            let Some(record) = local else {
                return Ok(Resolution::UpToDate);
            };
            let now = tx.now();

            let existing = tx
                .tables()
                .conflicts
                .values()
                .find(|c| c.entity_id == record.id && c.is_open())
                .cloned();
            let conflict = match existing {
                Some(open) => open,
                None => {
                    let conflict = ConflictRecord {
                        id: format!("cfl-{}", uuid::Uuid::new_v4()),
                        entity_id: record.id.clone(),
                        entity_type: record.entity_type.clone(),
                        local_payload: record.payload.clone(),
                        local_version: record.version,
                        remote_payload: remote.payload.clone(),
                        remote_version: remote.version,
                        fields: fields.clone(),
                        status: ConflictStatus::Conflict,
                        detected_at: now,
                        resolved_at: None,
                        resolved_by: None,
                    };
                    tx.put_conflict(conflict.clone())?;
                    conflict
                }
            };

            raise_deduped(
                tx,
                AuditAlert::new(
                    AlertType::SyncConflict,
                    AlertSeverity::Warning,
                    format!(
                        "Sensitive fields {:?} of {} '{}' diverged from the remote copy",
                        fields, record.entity_type, record.id
                    ),
                    record.entity_type.clone(),
                    record.id.clone(),
                    now,
                ),
            )?;
            tx.audit().append(
                AuditDraft::new(&actor, "sync.conflict", &record.entity_type, &record.id)
                    .phi(true)
                    .with_details(serde_json::json!({
                        "conflictId": conflict.id,
                        "fields": fields,
                        "localVersion": record.version,
                        "remoteVersion": remote.version,
                    })),
            )?;
            tracing::warn!(
                entity_id = %record.id,
                conflict_id = %conflict.id,
                fields = ?fields,
                "Sensitive field conflict held for manual resolution"
            );
            Ok(Resolution::ManualRequired {
                conflict_id: conflict.id,
                fields,
            })
        }
    }
}

/// Settle a manual conflict with a human decision
///
/// The chosen payload becomes a new local version above both sides and is
/// queued for delivery.
pub(crate) fn resolve(
    tx: &mut Transaction<'_>,
    conflict_id: &str,
    choice: ConflictChoice,
    resolved_by: &str,
) -> Result<Record> {
    let mut conflict = tx
        .conflict(conflict_id)
        .cloned()
        .ok_or_else(|| ComplianceError::NotFound(format!("Conflict not found: {}", conflict_id)))?;
    if !conflict.is_open() {
        return Err(ComplianceError::InvalidTransition {
            kind: "conflict",
            id: conflict.id,
            from: "resolved".to_string(),
            to: "resolved".to_string(),
        });
    }

    let mut record = tx.record(&conflict.entity_id).cloned().ok_or_else(|| {
        ComplianceError::NotFound(format!("Record not found: {}", conflict.entity_id))
    })?;
    let now = tx.now();

    let payload = match &choice {
        ConflictChoice::KeepLocal => record.payload.clone(),
        ConflictChoice::KeepRemote => conflict.remote_payload.clone(),
        ConflictChoice::Merged(payload) => {
            if !payload.is_object() {
                return Err(ComplianceError::SchemaValidation {
                    entity_type: conflict.entity_type.clone(),
                    reason: "Merged payload must be a JSON object".to_string(),
                });
            }
            payload.clone()
        }
    };

    tx.outbox().supersede(&record.id)?;
    record.version = record.version.max(conflict.remote_version) + 1;
    record.payload = payload;
    record.dirty = true;
    record.synced_version = record.synced_version.max(conflict.remote_version);
    record.base_payload = Some(conflict.remote_payload.clone());
    record.updated_at = now;
    if !matches!(choice, ConflictChoice::KeepLocal) {
        record.deleted_at = None;
    }

    let op = if record.is_deleted() {
        OpType::Delete
    } else {
        OpType::Update
    };
    tx.outbox().enqueue(
        &record.id,
        &record.entity_type,
        op,
        record.payload.clone(),
        record.version,
    )?;
    tx.put_record(record.clone(), None)?;

    conflict.status = ConflictStatus::Resolved;
    conflict.resolved_at = Some(now);
    conflict.resolved_by = Some(resolved_by.to_string());
    tx.put_conflict(conflict.clone())?;

    if let Some(mut alert) = tx
        .tables()
        .open_alert_for(&record.id, AlertType::SyncConflict)
        .cloned()
    {
        alert.resolved_at = Some(now);
        alert.resolved_by = Some(resolved_by.to_string());
        tx.put_alert(alert)?;
    }

    tx.audit().append(
        AuditDraft::new(resolved_by, "sync.conflict_resolved", &record.entity_type, &record.id)
            .phi(true)
            .with_details(serde_json::json!({
                "conflictId": conflict.id,
                "choice": choice.as_str(),
                "version": record.version,
            })),
    )?;
    tracing::info!(
        conflict_id = %conflict.id,
        entity_id = %record.id,
        choice = choice.as_str(),
        resolved_by = resolved_by,
        "Sync conflict resolved"
    );
    Ok(record)
}
