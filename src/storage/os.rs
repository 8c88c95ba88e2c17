//! Storage backed by OS-level encryption (DPAPI, Keychain, libsecret).
//!
//! The crate does not talk to those facilities directly; the embedding
//! application supplies an [`OsEncryption`] implementation and the store
//! handles file layout and failure handling around it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::error::AuthError;

use super::{atomic_write, storage_path};

/// Hook into the platform's encryption facility.
///
/// `encrypt` and `decrypt` must round-trip: whatever `encrypt` produces,
/// `decrypt` restores. `is_available` is probed once at startup; an
/// implementation that returns `true` is expected to stay usable for the
/// process lifetime.
pub trait OsEncryption: Send + Sync {
    fn is_available(&self) -> bool;
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError>;
}

/// Placeholder for builds and tests without a platform facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOsEncryption;

impl OsEncryption for NoOsEncryption {
    fn is_available(&self) -> bool {
        false
    }

    fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::Storage(
            "OS encryption is not available".to_string(),
        ))
    }

    fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::Storage(
            "OS encryption is not available".to_string(),
        ))
    }
}

/// Key-value store that keeps each value OS-encrypted in `<key>.dat`.
#[derive(Clone)]
pub struct OsEncryptedStore {
    base_dir: PathBuf,
    encryption: Arc<dyn OsEncryption>,
}

impl std::fmt::Debug for OsEncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsEncryptedStore")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl OsEncryptedStore {
    pub fn new(base_dir: PathBuf, encryption: Arc<dyn OsEncryption>) -> Self {
        Self {
            base_dir,
            encryption,
        }
    }

    /// Read and decrypt `key`. Absent entries and unreadable entries both
    /// come back as `None`; the caller cannot act on the difference.
    pub fn get(&self, key: &str) -> Option<String> {
        let path = storage_path(&self.base_dir, key, "dat");
        let ciphertext = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key, error = %e, "failed to read encrypted entry");
                return None;
            }
        };
        let plaintext = match self.encryption.decrypt(&ciphertext) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "failed to decrypt entry");
                return None;
            }
        };
        match String::from_utf8(plaintext) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "decrypted entry is not valid UTF-8");
                None
            }
        }
    }

    /// Encrypt `value` and write it to `<key>.dat` atomically.
    pub fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let ciphertext = self.encryption.encrypt(value.as_bytes())?;
        let path = storage_path(&self.base_dir, key, "dat");
        atomic_write(&path, &ciphertext)?;
        Ok(())
    }

    /// Delete `key` if present.
    pub fn remove(&self, key: &str) {
        let path = storage_path(&self.base_dir, key, "dat");
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(key, error = %e, "failed to remove encrypted entry");
            }
        }
    }
}
