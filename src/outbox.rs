//! Outbox of pending remote mutations
//!
//! Entries are enqueued in the same transaction as the record write they
//! carry. Only `status`, `attempts` and the attempt bookkeeping fields
//! change after insert.

use crate::config::RetryPolicy;
use crate::error::{ComplianceError, Result};
use crate::store::{Transaction, WriteOp};
use crate::types::{IdempotencyKey, OpType, OutboxEntry, OutboxStatus};

/// Outbox handle bound to one transaction
pub struct Outbox<'t, 'a> {
    tx: &'t mut Transaction<'a>,
}

impl<'t, 'a> Outbox<'t, 'a> {
    pub(crate) fn new(tx: &'t mut Transaction<'a>) -> Self {
        Self { tx }
    }

    /// Enqueue a mutation for delivery
    pub fn enqueue(
        &mut self,
        entity_id: &str,
        entity_type: &str,
        op_type: OpType,
        payload: serde_json::Value,
        version: u64,
    ) -> Result<OutboxEntry> {
        let entry = OutboxEntry {
            id: format!("obx-{}", uuid::Uuid::new_v4()),
            seq: self.tx.tables().next_outbox_seq(),
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            op_type,
            payload_snapshot: payload,
            version,
            idempotency_key: IdempotencyKey::new(entity_id, op_type, version),
            attempts: 0,
            status: OutboxStatus::Pending,
            created_at: self.tx.now(),
            last_attempt_at: None,
            last_error: None,
        };
        tracing::debug!(
            entry_id = %entry.id,
            seq = entry.seq,
            key = %entry.idempotency_key,
            "Outbox entry enqueued"
        );
        self.tx.stage(WriteOp::PutOutbox(entry.clone()))?;
        Ok(entry)
    }

    fn entry(&self, seq: u64) -> Result<OutboxEntry> {
        self.tx
            .tables()
            .outbox
            .get(&seq)
            .cloned()
            .ok_or_else(|| ComplianceError::NotFound(format!("Outbox entry not found: #{}", seq)))
    }

    /// Mark a pending entry as acknowledged by the remote store
    pub fn mark_sent(&mut self, seq: u64) -> Result<OutboxEntry> {
        let mut entry = self.entry(seq)?;
        if entry.status != OutboxStatus::Pending {
            return Err(ComplianceError::InvalidTransition {
                kind: "outbox_entry",
                id: entry.id,
                from: entry.status.as_str().to_string(),
                to: "sent".to_string(),
            });
        }
        entry.status = OutboxStatus::Sent;
        entry.attempts += 1;
        entry.last_attempt_at = Some(self.tx.now());
        entry.last_error = None;
        self.tx.stage(WriteOp::PutOutbox(entry.clone()))?;
        Ok(entry)
    }

    /// Count a failed attempt; the entry turns `failed` at the ceiling
    pub fn record_failure(
        &mut self,
        seq: u64,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<OutboxEntry> {
        let mut entry = self.entry(seq)?;
        entry.attempts += 1;
        entry.last_attempt_at = Some(self.tx.now());
        entry.last_error = Some(error.to_string());
        if policy.exhausted(entry.attempts) {
            entry.status = OutboxStatus::Failed;
        }
        self.tx.stage(WriteOp::PutOutbox(entry.clone()))?;
        Ok(entry)
    }

    /// Fold every undelivered entry of an entity into a newer write
    pub fn supersede(&mut self, entity_id: &str) -> Result<usize> {
        let pending: Vec<OutboxEntry> = self
            .tx
            .tables()
            .outbox_for(entity_id)
            .filter(|e| matches!(e.status, OutboxStatus::Pending | OutboxStatus::Failed))
            .cloned()
            .collect();

        let count = pending.len();
        for mut entry in pending {
            entry.status = OutboxStatus::Superseded;
            self.tx.stage(WriteOp::PutOutbox(entry))?;
        }
        Ok(count)
    }

    /// Put a failed entry back in the queue with a fresh attempt budget
    pub fn requeue(&mut self, entry_id: &str) -> Result<OutboxEntry> {
        let mut entry = self
            .tx
            .tables()
            .outbox
            .values()
            .find(|e| e.id == entry_id)
            .cloned()
            .ok_or_else(|| ComplianceError::NotFound(format!("Outbox entry not found: {}", entry_id)))?;

        if entry.status != OutboxStatus::Failed {
            return Err(ComplianceError::InvalidTransition {
                kind: "outbox_entry",
                id: entry.id,
                from: entry.status.as_str().to_string(),
                to: "pending".to_string(),
            });
        }

        entry.status = OutboxStatus::Pending;
        entry.attempts = 0;
        entry.last_attempt_at = None;
        self.tx.stage(WriteOp::PutOutbox(entry.clone()))?;
        Ok(entry)
    }
}
