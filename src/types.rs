//! Core record, outbox, audit, and alert types
//!
//! All types use camelCase JSON serialization so journal files and
//! remote documents stay readable by the dashboard collaborators.

use crate::config::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation applied to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned entity owned by the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Entity identifier (rec-<uuid> unless supplied by the caller)
    pub id: String,

    /// Entity type (e.g., "patient", "consent")
    pub entity_type: String,

    /// Entity payload, a JSON object
    pub payload: serde_json::Value,

    /// Local version, incremented on every local write
    pub version: u64,

    /// Whether local writes are waiting to reach the remote store
    pub dirty: bool,

    /// Tombstone timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Last version known to be held by the remote store
    #[serde(default)]
    pub synced_version: u64,

    /// Payload as of the last sync, used to tell which side changed a field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_payload: Option<serde_json::Value>,
}

impl Record {
    /// Create a fresh, never-synced record at version 1
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            payload,
            version: 1,
            dirty: true,
            deleted_at: None,
            created_at: at,
            updated_at: at,
            synced_version: 0,
            base_payload: None,
        }
    }

    /// Whether the record is tombstoned
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Deterministic key that makes a replayed remote operation a no-op
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyKey {
    pub entity_id: String,
    pub op_type: OpType,
    pub version: u64,
}

impl IdempotencyKey {
    pub fn new(entity_id: impl Into<String>, op_type: OpType, version: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            op_type,
            version,
        }
    }

    /// Dot-separated token safe for use in subjects and key-value keys
    pub fn token(&self) -> String {
        format!(
            "{}.{}.{}",
            self.entity_id.replace(['.', ' ', '*', '>'], "_"),
            self.op_type,
            self.version
        )
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.entity_id, self.op_type, self.version)
    }
}

/// Delivery state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for delivery
    Pending,
    /// Acknowledged by the remote store
    Sent,
    /// Attempt ceiling reached; needs a collaborator to retry
    Failed,
    /// Folded into a merged update by the conflict resolver
    Superseded,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Superseded => "superseded",
        }
    }
}

/// A pending remote mutation, written in the same transaction as its record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Entry identifier (obx-<uuid>)
    pub id: String,

    /// Monotonic creation sequence, orders entries of one entity
    pub seq: u64,

    pub entity_id: String,

    pub entity_type: String,

    pub op_type: OpType,

    /// Record payload at the time of the write
    pub payload_snapshot: serde_json::Value,

    /// Record version this entry carries
    pub version: u64,

    pub idempotency_key: IdempotencyKey,

    pub attempts: u32,

    pub status: OutboxStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Earliest time the next delivery attempt may run
    pub fn next_attempt_at(&self, policy: &RetryPolicy) -> Option<DateTime<Utc>> {
        let last = self.last_attempt_at?;
        let delay = chrono::Duration::from_std(policy.delay_after(self.attempts))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(policy.max_delay_ms as i64));
        Some(last + delay)
    }

    /// Whether backoff allows an attempt at `now`
    pub fn ready_at(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        self.next_attempt_at(policy).map_or(true, |at| now >= at)
    }
}

/// An immutable record of a sensitive access or mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Entry identifier (aud-<uuid>)
    pub id: String,
    pub actor_id: String,
    /// Dotted action name (e.g., "record.update", "breach.report")
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Whether sensitive (PHI-equivalent) fields were read or written
    pub phi_accessed: bool,
    /// Whether the access complied with policy
    pub compliant: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// A statutory deadline lapsed
    ComplianceViolation,
    /// Affected individuals were not notified of a breach in time
    DataBreach,
    /// Sensitive fields diverged and need manual resolution
    SyncConflict,
    /// Outbox entries exhausted their retries
    SyncDegraded,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ComplianceViolation => "compliance_violation",
            AlertType::DataBreach => "data_breach",
            AlertType::SyncConflict => "sync_conflict",
            AlertType::SyncDegraded => "sync_degraded",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// An alert raised by the alert manager or the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAlert {
    /// Alert identifier (alr-<uuid>)
    pub id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    /// Kind of resource the alert is about (e.g., "breach_incident")
    pub resource_type: String,
    pub resource_id: String,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub auto_resolved: bool,
}

impl AuditAlert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("alr-{}", uuid::Uuid::new_v4()),
            alert_type,
            severity,
            message: message.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            triggered_at: at,
            escalated_at: None,
            resolved_at: None,
            resolved_by: None,
            auto_resolved: false,
        }
    }

    /// Open alerts are those without `resolved_at`
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// State of a manual-resolution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Conflict,
    Resolved,
}

/// Divergent local and remote payloads awaiting a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Conflict identifier (cfl-<uuid>)
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub local_payload: serde_json::Value,
    pub local_version: u64,
    pub remote_payload: serde_json::Value,
    pub remote_version: u64,
    /// Sensitive fields changed on both sides
    pub fields: Vec<String>,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl ConflictRecord {
    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Conflict
    }
}

/// Sync health as reported to collaborators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drain_at: Option<DateTime<Utc>>,
    /// True when entries failed or conflicts wait for resolution
    pub degraded: bool,
}
