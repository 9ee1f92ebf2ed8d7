//! NATS JetStream remote store
//!
//! Documents live in a JetStream key-value bucket under `doc.<entity>`.
//! Every applied idempotency token leaves a marker under
//! `applied.<token>`; an operation whose marker exists is a no-op.

mod config;

pub use config::{NatsRemoteConfig, StorageType};

use super::{ApplyOutcome, RemoteOp, RemoteRecord, RemoteStore};
use crate::error::{ComplianceError, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct AppliedMarker {
    version: u64,
}

/// JetStream key-value remote store
pub struct NatsRemote {
    client: async_nats::Client,
    store: kv::Store,
    config: NatsRemoteConfig,
}

impl NatsRemote {
    /// Connect to NATS and open (or create) the bucket
    pub async fn connect(config: NatsRemoteConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| ComplianceError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let js = jetstream::new(client.clone());
        let store = ensure_bucket(&js, &config).await?;

        Ok(Self {
            client,
            store,
            config,
        })
    }

    pub fn config(&self) -> &NatsRemoteConfig {
        &self.config
    }

    async fn read_document(&self, entity_id: &str) -> Result<Option<RemoteRecord>> {
        let key = self.config.document_key(entity_id);
        let value = self
            .store
            .get(key.clone())
            .await
            .map_err(|e| ComplianceError::Remote(format!("Failed to read '{}': {}", key, e)))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_marker(&self, token: &str) -> Result<Option<AppliedMarker>> {
        let key = self.config.marker_key(token);
        let value = self
            .store
            .get(key.clone())
            .await
            .map_err(|e| ComplianceError::Remote(format!("Failed to read '{}': {}", key, e)))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RemoteStore for NatsRemote {
    async fn apply(&self, op: &RemoteOp) -> Result<ApplyOutcome> {
        let token = op.idempotency_key.token();
        if let Some(marker) = self.read_marker(&token).await? {
            tracing::debug!(key = %op.idempotency_key, "Duplicate remote apply ignored");
            return Ok(ApplyOutcome::Duplicate {
                version: marker.version,
            });
        }

        // Document first, marker second. A crash between the two leaves no
        // marker, so a replay writes the document again; that rewrite is only
        // identical if no other writer updated the document in between
        let current = self.read_document(&op.entity_id).await?;
        let next = RemoteRecord::after(current.as_ref(), op);
        let doc_key = self.config.document_key(&op.entity_id);
        self.store
            .put(doc_key.as_str(), Bytes::from(serde_json::to_vec(&next)?))
            .await
            .map_err(|e| ComplianceError::Remote(format!("Failed to write '{}': {}", doc_key, e)))?;

        let marker_key = self.config.marker_key(&token);
        let marker = serde_json::to_vec(&AppliedMarker {
            version: next.version,
        })?;
        self.store
            .put(marker_key.as_str(), Bytes::from(marker))
            .await
            .map_err(|e| {
                ComplianceError::Remote(format!("Failed to write '{}': {}", marker_key, e))
            })?;

        tracing::debug!(
            key = %op.idempotency_key,
            version = next.version,
            "Remote apply committed"
        );
        Ok(ApplyOutcome::Applied {
            version: next.version,
        })
    }

    async fn fetch(&self, entity_id: &str) -> Result<Option<RemoteRecord>> {
        self.read_document(entity_id).await
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.client.connection_state() == async_nats::connection::State::Connected)
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsRemoteConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Open the key-value bucket, creating it on first use
async fn ensure_bucket(js: &jetstream::Context, config: &NatsRemoteConfig) -> Result<kv::Store> {
    if let Ok(store) = js.get_key_value(config.bucket.clone()).await {
        tracing::info!(bucket = %config.bucket, "Key-value bucket opened");
        return Ok(store);
    }

    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let store = js
        .create_key_value(kv::Config {
            bucket: config.bucket.clone(),
            history: config.history.max(1),
            storage,
            ..Default::default()
        })
        .await
        .map_err(|e| {
            ComplianceError::Remote(format!(
                "Failed to create bucket '{}': {}",
                config.bucket, e
            ))
        })?;

    tracing::info!(bucket = %config.bucket, storage = ?config.storage, "Key-value bucket created");
    Ok(store)
}
