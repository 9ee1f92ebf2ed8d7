//! # a3s-compliance
//!
//! Offline-first data sync, audit trail, and regulatory-deadline engine for
//! the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-compliance` keeps a client usable while it is disconnected from its
//! remote store. Local writes are durable and transactional, reach the
//! remote store eventually and idempotently through an outbox, and never
//! silently overwrite sensitive fields on conflict. Breach incidents and
//! data-subject requests get statutory due dates on insert, and a periodic
//! sweep raises escalating alerts when those dates lapse.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_compliance::{ComplianceService, CoreConfig, MemoryRemote, MutationRequest, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_compliance::Result<()> {
//! let service = ComplianceService::in_memory(
//!     CoreConfig::default(),
//!     Arc::new(MemoryRemote::new()),
//!     Arc::new(SystemClock),
//! )
//! .await?;
//!
//! let record = service
//!     .record_mutation(MutationRequest::create(
//!         "dr-smith",
//!         "patient",
//!         serde_json::json!({"name": "Jane"}),
//!     ))
//!     .await?;
//!
//! let report = service.drain().await?;
//! println!("v{} synced: {}", record.version, report.sent);
//! # Ok(())
//! # }
//! ```
//!
//! ## Remote stores
//!
//! - **memory**: In-process remote for tests, with offline and failure toggles
//! - **nats**: NATS JetStream key-value bucket
//!
//! ## Architecture
//!
//! - **LocalStore**: single-writer tables over a write-ahead `Journal`
//! - **AuditLogger** / **Outbox**: handles bound to a store transaction
//! - **SyncEngine**: drains the outbox, reconciles with the remote store
//! - **DeadlineEngine**: breach and data-subject-request lifecycles
//! - **AlertManager**: deadline sweep, deduplication, escalation
//! - **ComplianceService**: the command surface collaborators use

pub mod alerts;
pub mod audit;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod conflict;
pub mod crypto;
pub mod error;
pub mod outbox;
pub mod remote;
pub mod schema;
pub mod service;
pub mod shutdown;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod types;

// Re-export core types
pub use alerts::{AlertManager, SweepReport};
pub use audit::{AuditDraft, AuditFilter, AuditPage, Page, TimeRange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compliance::{
    BreachIncident, BreachSeverity, BreachStatus, DataSubjectRequest, DeadlineEngine,
    DeadlineObserver, InsertObserver, RequestStatus, RequestType,
};
pub use config::{CoreConfig, DeadlinePolicy, DrainConfig, RetryPolicy, SweepConfig};
pub use conflict::{ConflictChoice, Resolution};
pub use crypto::{Aes256GcmEncryptor, Encryptor};
pub use error::{ComplianceError, Result};
pub use schema::{EntitySchema, MemorySchemaRegistry, SchemaRegistry};
pub use service::{ComplianceService, MutationRequest};
pub use snapshot::ComplianceSnapshot;
pub use store::{FileJournal, Journal, LocalStore, MemoryJournal};
pub use sync::{DrainReport, SyncEngine};
pub use types::{
    AlertSeverity, AlertType, AuditAlert, AuditLogEntry, ConflictRecord, ConflictStatus,
    IdempotencyKey, OpType, OutboxEntry, OutboxStatus, Record, SyncStatus,
};

// Re-export remote stores for convenience
pub use remote::{
    ApplyOutcome, MemoryRemote, NatsRemote, NatsRemoteConfig, RemoteOp, RemoteRecord,
    RemoteStore, StorageType,
};
