//! Software-encrypted fallback used when no OS facility is available.
//!
//! Entries are AES-256-GCM encrypted under a key derived from fixed material,
//! which only protects the files against casual inspection. Because of that
//! weaker footing, refresh tokens are refused outright and every entry
//! expires 24 hours after it was written.

use std::io::ErrorKind;
use std::path::PathBuf;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::AuthError;

use super::{atomic_write, storage_path};

const KEY_DERIVE_ITERATIONS: u32 = 100_000;
const KEY_PASSPHRASE: &[u8] = b"sidecar-fallback-storage-v1";
const KEY_SALT: &[u8] = b"sidecar-fallback-salt-v1";

/// Fallback entries expire after this long regardless of content.
pub const ENTRY_TTL_HOURS: i64 = 24;

const IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// On-disk shape of a fallback entry. Timestamps are epoch milliseconds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FallbackEnvelope {
    encrypted: String,
    iv: String,
    auth_tag: String,
    timestamp: i64,
    expires_at: i64,
}

/// Key-value store that keeps each value software-encrypted in `<key>.json`.
#[derive(Clone)]
pub struct FallbackStore {
    base_dir: PathBuf,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStore")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl FallbackStore {
    pub fn new(base_dir: PathBuf) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(KEY_PASSPHRASE, KEY_SALT, KEY_DERIVE_ITERATIONS, &mut key);
        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&key));
        Self { base_dir, cipher }
    }

    /// Read and decrypt `key`. Expired, tampered, or unparseable entries are
    /// deleted and reported as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let path = storage_path(&self.base_dir, key, "json");
        let raw = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key, error = %e, "failed to read fallback entry");
                return None;
            }
        };
        let envelope: FallbackEnvelope = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key, error = %e, "fallback entry has an unrecognized shape, deleting");
                self.remove(key);
                return None;
            }
        };
        if Utc::now().timestamp_millis() >= envelope.expires_at {
            debug!(key, "fallback entry expired, deleting");
            self.remove(key);
            return None;
        }
        match self.open(&envelope) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "failed to decrypt fallback entry, deleting");
                self.remove(key);
                None
            }
        }
    }

    /// Encrypt `value` and write it to `<key>.json` atomically.
    ///
    /// Values that appear to carry a refresh token are refused; those stay
    /// memory-only while this store is active.
    pub fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        if contains_refresh_token(key, value) {
            return Err(AuthError::RefreshTokenNotPersistable);
        }
        let envelope = self.seal(value)?;
        let raw = serde_json::to_vec(&envelope)?;
        let path = storage_path(&self.base_dir, key, "json");
        atomic_write(&path, &raw)?;
        Ok(())
    }

    /// Delete `key` if present.
    pub fn remove(&self, key: &str) {
        let path = storage_path(&self.base_dir, key, "json");
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(key, error = %e, "failed to remove fallback entry");
            }
        }
    }

    fn seal(&self, value: &str) -> Result<FallbackEnvelope, AuthError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let mut sealed = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|_| AuthError::Storage("encryption failed".to_string()))?;
        let tag = sealed.split_off(sealed.len() - GCM_TAG_LEN);
        let now = Utc::now();
        Ok(FallbackEnvelope {
            encrypted: BASE64.encode(&sealed),
            iv: BASE64.encode(iv),
            auth_tag: BASE64.encode(&tag),
            timestamp: now.timestamp_millis(),
            expires_at: (now + Duration::hours(ENTRY_TTL_HOURS)).timestamp_millis(),
        })
    }

    fn open(&self, envelope: &FallbackEnvelope) -> Result<String, AuthError> {
        let iv = BASE64
            .decode(&envelope.iv)
            .map_err(|e| AuthError::Storage(format!("invalid iv: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(AuthError::Storage("invalid iv length".to_string()));
        }
        let mut ciphertext = BASE64
            .decode(&envelope.encrypted)
            .map_err(|e| AuthError::Storage(format!("invalid ciphertext: {e}")))?;
        let tag = BASE64
            .decode(&envelope.auth_tag)
            .map_err(|e| AuthError::Storage(format!("invalid auth tag: {e}")))?;
        ciphertext.extend_from_slice(&tag);
        let nonce = Nonce::from_slice(&iv);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| AuthError::Storage("authentication failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| AuthError::Storage(format!("entry is not valid UTF-8: {e}")))
    }
}

/// Detect refresh-token material in a key name or value so the fallback
/// store can refuse to persist it.
fn contains_refresh_token(key: &str, value: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    if key_lower.contains("refresh_token") || key_lower.contains("refreshtoken") {
        return true;
    }
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(parsed) => json_has_refresh_token(&parsed),
        Err(_) => {
            let value_lower = value.to_ascii_lowercase();
            value_lower.contains("\"refresh_token\"") || value_lower.contains("\"refreshtoken\"")
        }
    }
}

fn json_has_refresh_token(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.iter().any(|(name, child)| {
            let name_lower = name.to_ascii_lowercase();
            let named_refresh = name_lower == "refresh_token" || name_lower == "refreshtoken";
            (named_refresh && !child.is_null()) || json_has_refresh_token(child)
        }),
        serde_json::Value::Array(items) => items.iter().any(json_has_refresh_token),
        _ => false,
    }
}
