//! NATS remote store configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend for the key-value bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Persisted to disk on the server
    #[default]
    File,
    /// Held in server memory
    Memory,
}

/// Connection and bucket settings for `NatsRemote`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsRemoteConfig {
    /// NATS server URL
    pub url: String,

    /// Key-value bucket holding documents and idempotency markers
    pub bucket: String,

    /// Optional auth token
    pub token: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Revisions kept per key
    pub history: i64,

    pub storage: StorageType,
}

impl Default for NatsRemoteConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            bucket: "a3s_compliance".to_string(),
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            history: 1,
            storage: StorageType::File,
        }
    }
}

impl NatsRemoteConfig {
    /// Key under which an entity's document is stored
    pub fn document_key(&self, entity_id: &str) -> String {
        format!("doc.{}", kv_safe(entity_id))
    }

    /// Key of the marker recording an applied idempotency token
    pub fn marker_key(&self, token: &str) -> String {
        let parts: Vec<String> = token.split('.').map(kv_safe).collect();
        format!("applied.{}", parts.join("."))
    }
}

/// Replace characters NATS rejects in key-value keys
fn kv_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
