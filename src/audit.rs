//! Append-only audit log
//!
//! Entries are written through an `AuditLogger` borrowed from a store
//! transaction, so an entry commits or rolls back together with the change
//! it describes. There is no update or delete path.

use crate::error::{ComplianceError, Result};
use crate::store::{Tables, Transaction, WriteOp};
use crate::types::AuditLogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit entry before it receives an id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub phi_accessed: bool,
    pub compliant: bool,
    pub details: Option<serde_json::Value>,
}

impl AuditDraft {
    pub fn new(
        actor_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            phi_accessed: false,
            compliant: true,
            details: None,
        }
    }

    pub fn phi(mut self, accessed: bool) -> Self {
        self.phi_accessed = accessed;
        self
    }

    pub fn non_compliant(mut self) -> Self {
        self.compliant = false;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Audit handle bound to one transaction
pub struct AuditLogger<'t, 'a> {
    tx: &'t mut Transaction<'a>,
}

impl<'t, 'a> AuditLogger<'t, 'a> {
    pub(crate) fn new(tx: &'t mut Transaction<'a>) -> Self {
        Self { tx }
    }

    /// Append a new entry stamped with the transaction time
    pub fn append(self, draft: AuditDraft) -> Result<AuditLogEntry> {
        let entry = AuditLogEntry {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            actor_id: draft.actor_id,
            action: draft.action,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            phi_accessed: draft.phi_accessed,
            compliant: draft.compliant,
            timestamp: self.tx.now(),
            details: draft.details,
        };
        self.append_entry(entry.clone())?;
        Ok(entry)
    }

    /// Append a fully formed entry; an existing id is never overwritten
    pub fn append_entry(self, entry: AuditLogEntry) -> Result<()> {
        if self.tx.tables().audit_contains(&entry.id) {
            return Err(ComplianceError::AuditImmutable(entry.id));
        }
        tracing::debug!(
            audit_id = %entry.id,
            actor = %entry.actor_id,
            action = %entry.action,
            resource_id = %entry.resource_id,
            phi = entry.phi_accessed,
            "Audit entry appended"
        );
        self.tx.stage(WriteOp::AppendAudit(entry))
    }
}

/// Audit query filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub phi_only: bool,
    pub non_compliant_only: bool,
}

impl AuditFilter {
    pub fn actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Default::default()
        }
    }

    pub fn resource(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor_id.as_ref().map_or(true, |a| *a == entry.actor_id)
            && self.action.as_ref().map_or(true, |a| *a == entry.action)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |r| *r == entry.resource_type)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |r| *r == entry.resource_id)
            && (!self.phi_only || entry.phi_accessed)
            && (!self.non_compliant_only || !entry.compliant)
    }
}

/// Half-open time range `[from, to)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

/// Page request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// One page of audit results, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    /// Matching entries across all pages
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
}

/// Run an audit query; `max_limit` caps the page size
pub fn query(
    tables: &Tables,
    filter: &AuditFilter,
    range: &TimeRange,
    page: Page,
    max_limit: usize,
) -> AuditPage {
    let limit = page.limit.clamp(1, max_limit.max(1));
    let mut total = 0usize;
    let mut entries = Vec::new();

    for entry in tables
        .audit
        .iter()
        .filter(|e| range.contains(e.timestamp) && filter.matches(e))
    {
        if total >= page.offset && entries.len() < limit {
            entries.push(entry.clone());
        }
        total += 1;
    }

    let end = page.offset + entries.len();
    AuditPage {
        entries,
        total,
        next_offset: (end < total).then_some(end),
    }
}
