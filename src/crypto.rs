//! At-rest encryption for journal lines and snapshots
//!
//! The local store holds PHI-equivalent payloads, so the file journal can
//! seal every line before it touches disk. Envelopes carry a key id so old
//! lines stay readable after a key rotation.

use crate::error::{ComplianceError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Sealed JSON value as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedEnvelope {
    /// Key used to seal the value
    pub key_id: String,

    /// Base64-encoded 96-bit nonce
    pub nonce: String,

    /// Base64-encoded ciphertext
    pub ciphertext: String,

    #[serde(default = "default_sealed")]
    pub sealed: bool,
}

fn default_sealed() -> bool {
    true
}

impl SealedEnvelope {
    /// Check whether a JSON value is a sealed envelope
    pub fn is_sealed(value: &serde_json::Value) -> bool {
        value
            .get("sealed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Seals and opens JSON values for storage
pub trait Encryptor: Send + Sync {
    /// Seal a value into an envelope
    fn seal(&self, value: &serde_json::Value) -> Result<serde_json::Value>;

    /// Open an envelope produced by `seal`
    fn open(&self, sealed: &serde_json::Value) -> Result<serde_json::Value>;

    /// Key id used for new envelopes
    fn active_key_id(&self) -> String;
}

/// AES-256-GCM encryptor with key rotation
///
/// The key id is bound to each ciphertext as associated data, so an
/// envelope relabelled with another key id fails to open.
pub struct Aes256GcmEncryptor {
    active_key_id: RwLock<String>,
    keys: RwLock<HashMap<String, Aes256Gcm>>,
}

impl Aes256GcmEncryptor {
    /// Create an encryptor with one 256-bit key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));

        Self {
            active_key_id: RwLock::new(key_id),
            keys: RwLock::new(keys),
        }
    }

    /// Create an encryptor from a base64-encoded 32-byte key
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| ComplianceError::Crypto(format!("Invalid key encoding: {}", e)))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ComplianceError::Crypto(format!("Key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(key_id, &key))
    }

    /// Register an additional key for opening older envelopes
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let mut keys = self.keys.write().map_err(|e| {
            ComplianceError::Crypto(format!("Failed to acquire key lock: {}", e))
        })?;
        keys.insert(key_id.into(), Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));
        Ok(())
    }

    /// Seal new values with a previously registered key
    pub fn rotate_to(&self, key_id: &str) -> Result<()> {
        let keys = self.keys.read().map_err(|e| {
            ComplianceError::Crypto(format!("Failed to acquire key lock: {}", e))
        })?;
        if !keys.contains_key(key_id) {
            return Err(ComplianceError::Crypto(format!(
                "Key '{}' not registered, add it first",
                key_id
            )));
        }
        let mut active = self.active_key_id.write().map_err(|e| {
            ComplianceError::Crypto(format!("Failed to acquire key lock: {}", e))
        })?;
        *active = key_id.to_string();
        tracing::info!(key_id = key_id, "Journal encryption key rotated");
        Ok(())
    }
}

impl Encryptor for Aes256GcmEncryptor {
    fn seal(&self, value: &serde_json::Value) -> Result<serde_json::Value> {
        let plaintext = serde_json::to_vec(value)?;
        let key_id = self.active_key_id();

        let keys = self.keys.read().map_err(|e| {
            ComplianceError::Crypto(format!("Failed to acquire key lock: {}", e))
        })?;
        let cipher = keys.get(&key_id).ok_or_else(|| {
            ComplianceError::Crypto(format!("Active key '{}' not found", key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|e| ComplianceError::Crypto(format!("Encryption failed: {}", e)))?;

        let envelope = SealedEnvelope {
            key_id,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            sealed: true,
        };
        serde_json::to_value(envelope).map_err(Into::into)
    }

    fn open(&self, sealed: &serde_json::Value) -> Result<serde_json::Value> {
        let envelope: SealedEnvelope = serde_json::from_value(sealed.clone())?;

        let keys = self.keys.read().map_err(|e| {
            ComplianceError::Crypto(format!("Failed to acquire key lock: {}", e))
        })?;
        let cipher = keys.get(&envelope.key_id).ok_or_else(|| {
            ComplianceError::Crypto(format!("Key '{}' not registered", envelope.key_id))
        })?;

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| ComplianceError::Crypto(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(ComplianceError::Crypto(format!(
                "Invalid nonce length {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| ComplianceError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: envelope.key_id.as_bytes(),
                },
            )
            .map_err(|e| ComplianceError::Crypto(format!("Decryption failed: {}", e)))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    fn active_key_id(&self) -> String {
        self.active_key_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_a() -> [u8; 32] {
        [0x42; 32]
    }

    fn key_b() -> [u8; 32] {
        [0x7A; 32]
    }

    #[test]
    fn test_seal_hides_payload() {
        let enc = Aes256GcmEncryptor::new("k1", &key_a());
        let value = serde_json::json!({"diagnosis": "confidential"});

        let sealed = enc.seal(&value).unwrap();
        assert!(SealedEnvelope::is_sealed(&sealed));
        assert!(!sealed.to_string().contains("confidential"));
        assert_eq!(enc.open(&sealed).unwrap(), value);
    }

    #[test]
    fn test_plain_value_not_sealed() {
        assert!(!SealedEnvelope::is_sealed(&serde_json::json!({"seq": 1})));
    }

    #[test]
    fn test_rotation_keeps_old_envelopes_readable() {
        let enc = Aes256GcmEncryptor::new("k1", &key_a());
        let value = serde_json::json!({"n": 1});
        let old = enc.seal(&value).unwrap();

        enc.add_key("k2", &key_b()).unwrap();
        enc.rotate_to("k2").unwrap();
        let new = enc.seal(&value).unwrap();

        assert_eq!(old["keyId"], "k1");
        assert_eq!(new["keyId"], "k2");
        assert_eq!(enc.open(&old).unwrap(), value);
        assert_eq!(enc.open(&new).unwrap(), value);
    }

    #[test]
    fn test_rotate_to_unknown_key_fails() {
        let enc = Aes256GcmEncryptor::new("k1", &key_a());
        assert!(matches!(enc.rotate_to("missing"), Err(ComplianceError::Crypto(_))));
    }

    #[test]
    fn test_relabelled_envelope_fails() {
        let enc = Aes256GcmEncryptor::new("k1", &key_a());
        enc.add_key("k2", &key_a()).unwrap();

        let mut sealed = enc.seal(&serde_json::json!({"n": 1})).unwrap();
        sealed["keyId"] = serde_json::json!("k2");
        assert!(enc.open(&sealed).is_err());
    }

    #[test]
    fn test_from_base64_key_length() {
        let good = BASE64.encode([7u8; 32]);
        assert!(Aes256GcmEncryptor::from_base64("k", &good).is_ok());

        let short = BASE64.encode([7u8; 16]);
        assert!(matches!(
            Aes256GcmEncryptor::from_base64("k", &short),
            Err(ComplianceError::Crypto(_))
        ));
    }
}
