//! In-memory remote store
//!
//! Lives in the same process as the client. Useful for tests, demos, and
//! offline development. Supports toggling connectivity and injecting
//! failures so backoff and reconnect paths can be exercised.

use super::{ApplyOutcome, RemoteOp, RemoteRecord, RemoteStore};
use crate::error::{ComplianceError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Default)]
struct RemoteState {
    documents: HashMap<String, RemoteRecord>,
    /// Idempotency key -> remote version it produced
    applied: HashMap<String, u64>,
}

/// In-memory remote store
pub struct MemoryRemote {
    state: RwLock<RemoteState>,
    online: AtomicBool,
    fail_next: AtomicU32,
    apply_count: AtomicU64,
    latency: Option<Duration>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self {
            state: RwLock::new(RemoteState::default()),
            online: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            apply_count: AtomicU64::new(0),
            latency: None,
        }
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Simulate losing or regaining connectivity
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::debug!(online, "Memory remote connectivity changed");
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Fail the next `n` apply calls with a remote error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of applies that changed remote state
    pub fn apply_count(&self) -> u64 {
        self.apply_count.load(Ordering::SeqCst)
    }

    /// Write a document directly, as another client would
    pub fn put_remote(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: serde_json::Value,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write_state()?;
        state.documents.insert(
            entity_id.to_string(),
            RemoteRecord {
                entity_id: entity_id.to_string(),
                entity_type: entity_type.to_string(),
                payload,
                version,
                updated_at,
                deleted: false,
            },
        );
        Ok(())
    }

    /// Read a document without going through connectivity checks
    pub fn get_remote(&self, entity_id: &str) -> Option<RemoteRecord> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.documents.get(entity_id).cloned())
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, RemoteState>> {
        self.state
            .write()
            .map_err(|e| ComplianceError::Remote(format!("Failed to acquire remote lock: {}", e)))
    }

    async fn round_trip(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_online() {
            return Err(ComplianceError::Connection("memory remote is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn apply(&self, op: &RemoteOp) -> Result<ApplyOutcome> {
        self.round_trip().await?;

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ComplianceError::Remote("injected remote failure".to_string()));
        }

        let key = op.idempotency_key.to_string();
        let mut state = self.write_state()?;
        if let Some(version) = state.applied.get(&key) {
            tracing::debug!(key = %key, "Duplicate remote apply ignored");
            return Ok(ApplyOutcome::Duplicate { version: *version });
        }

        let next = RemoteRecord::after(state.documents.get(&op.entity_id), op);
        let version = next.version;
        state.documents.insert(op.entity_id.clone(), next);
        state.applied.insert(key, version);
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        Ok(ApplyOutcome::Applied { version })
    }

    async fn fetch(&self, entity_id: &str) -> Result<Option<RemoteRecord>> {
        self.round_trip().await?;
        let state = self
            .state
            .read()
            .map_err(|e| ComplianceError::Remote(format!("Failed to acquire remote lock: {}", e)))?;
        Ok(state.documents.get(entity_id).cloned())
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.is_online())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
