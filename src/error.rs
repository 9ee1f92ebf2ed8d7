//! Error types for a3s-compliance

use thiserror::Error;

/// Errors that can occur in the sync and compliance engine
#[derive(Debug, Error)]
pub enum ComplianceError {
    /// Optimistic concurrency check failed on a record write
    #[error("Version conflict on '{entity_id}': expected v{expected}, found v{actual}")]
    VersionConflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    /// Illegal state machine transition
    #[error("Invalid transition for {kind} '{id}': {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Audit log entries are write-once
    #[error("Audit log entry '{0}' is immutable")]
    AuditImmutable(String),

    /// A transaction touched a record without writing an audit entry
    #[error("Transaction touched records without an audit entry")]
    AuditRequired,

    /// Alert was already closed
    #[error("Alert already resolved: {0}")]
    AlertAlreadyResolved(String),

    /// Entity is held for manual conflict resolution
    #[error("Entity '{0}' has an unresolved sync conflict")]
    ConflictPending(String),

    /// Payload failed entity schema validation
    #[error("Schema validation failed for entity type '{entity_type}': {reason}")]
    SchemaValidation {
        entity_type: String,
        reason: String,
    },

    /// Local storage I/O failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Remote store rejected or failed an operation
    #[error("Remote error: {0}")]
    Remote(String),

    /// Remote store connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ComplianceError {
    /// Whether a failed remote operation may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ComplianceError::Remote(_) | ComplianceError::Connection(_) | ComplianceError::Timeout(_)
        )
    }
}

/// Result type alias for compliance operations
pub type Result<T> = std::result::Result<T, ComplianceError>;
