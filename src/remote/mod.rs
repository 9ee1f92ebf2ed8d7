//! Remote store abstraction
//!
//! The authoritative copy of every record lives in a remote store. The sync
//! engine pushes outbox entries through `RemoteStore::apply` and pulls the
//! remote state through `RemoteStore::fetch`. Implementations must treat a
//! repeated idempotency key as a no-op.

use crate::error::Result;
use crate::types::{IdempotencyKey, OpType, OutboxEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod nats;

pub use memory::MemoryRemote;
pub use nats::{NatsRemote, NatsRemoteConfig, StorageType};

/// One mutation sent to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOp {
    pub idempotency_key: IdempotencyKey,
    pub entity_id: String,
    pub entity_type: String,
    pub op_type: OpType,
    pub payload: serde_json::Value,
    pub version: u64,
    /// When the local write happened; drives last-writer-wins
    pub updated_at: DateTime<Utc>,
}

impl RemoteOp {
    pub fn from_entry(entry: &OutboxEntry) -> Self {
        Self {
            idempotency_key: entry.idempotency_key.clone(),
            entity_id: entry.entity_id.clone(),
            entity_type: entry.entity_type.clone(),
            op_type: entry.op_type,
            payload: entry.payload_snapshot.clone(),
            version: entry.version,
            updated_at: entry.created_at,
        }
    }
}

/// Remote copy of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub payload: serde_json::Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Remote state after applying `op` on top of `current`
    ///
    /// The remote version never decreases.
    pub fn after(current: Option<&RemoteRecord>, op: &RemoteOp) -> Self {
        let version = current.map_or(op.version, |c| c.version.max(op.version));
        Self {
            entity_id: op.entity_id.clone(),
            entity_type: op.entity_type.clone(),
            payload: op.payload.clone(),
            version,
            updated_at: op.updated_at,
            deleted: op.op_type == OpType::Delete,
        }
    }
}

/// Result of applying a remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation changed the remote state
    Applied { version: u64 },
    /// The idempotency key was seen before; nothing changed
    Duplicate { version: u64 },
}

impl ApplyOutcome {
    pub fn version(&self) -> u64 {
        match self {
            ApplyOutcome::Applied { version } | ApplyOutcome::Duplicate { version } => *version,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ApplyOutcome::Duplicate { .. })
    }
}

/// Authoritative remote backend
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Apply an operation exactly once per idempotency key
    async fn apply(&self, op: &RemoteOp) -> Result<ApplyOutcome>;

    /// Fetch the remote copy of an entity
    async fn fetch(&self, entity_id: &str) -> Result<Option<RemoteRecord>>;

    /// Health check, true when the backend is reachable
    ///
    /// Default implementation probes with a fetch.
    async fn health(&self) -> Result<bool> {
        self.fetch("__health__").await.map(|_| true)
    }

    /// Backend name (e.g., "memory", "nats")
    fn name(&self) -> &str;
}
