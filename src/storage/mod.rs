//! Encrypted persistence for the session blob.
//!
//! Two backends share one interface: OS-level encryption when the host
//! platform provides it, otherwise a software-encrypted fallback with
//! deliberately weaker guarantees. The backend is chosen once at startup
//! and keeps its choice for the process lifetime.

pub mod fallback;
pub mod os;

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::AuthError;

pub use fallback::FallbackStore;
pub use os::{NoOsEncryption, OsEncryptedStore, OsEncryption};

/// Storage key the session blob lives under.
pub const SESSION_KEY: &str = "auth0_session";

#[derive(Debug, Clone)]
enum Backend {
    Os(OsEncryptedStore),
    Fallback(FallbackStore),
}

/// Facade over whichever backend the startup probe selected.
///
/// Reads never fail from the caller's point of view: a missing, corrupt, or
/// undecryptable entry is simply absent and the user signs in again.
#[derive(Debug, Clone)]
pub struct SecureStorage {
    backend: Backend,
}

impl SecureStorage {
    /// Probe the OS facility once and pick a backend.
    pub fn probe(base_dir: PathBuf, encryption: Arc<dyn OsEncryption>) -> Self {
        if encryption.is_available() {
            info!(dir = %base_dir.display(), "using OS-encrypted session storage");
            Self {
                backend: Backend::Os(OsEncryptedStore::new(base_dir, encryption)),
            }
        } else {
            warn!(
                dir = %base_dir.display(),
                "OS encryption unavailable, using software-encrypted fallback storage"
            );
            Self {
                backend: Backend::Fallback(FallbackStore::new(base_dir)),
            }
        }
    }

    /// Whether the OS-encrypted backend is active.
    pub fn is_os_encryption(&self) -> bool {
        matches!(self.backend, Backend::Os(_))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match &self.backend {
            Backend::Os(store) => store.get(key),
            Backend::Fallback(store) => store.get(key),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        match &self.backend {
            Backend::Os(store) => store.set(key, value),
            Backend::Fallback(store) => store.set(key, value),
        }
    }

    pub fn remove(&self, key: &str) {
        match &self.backend {
            Backend::Os(store) => store.remove(key),
            Backend::Fallback(store) => store.remove(key),
        }
    }
}

/// Default directory for session files.
pub fn default_storage_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".sidecar").join("secure"))
        .unwrap_or_else(|| PathBuf::from(".sidecar").join("secure"))
}

/// File a key maps to, with the key flattened to a safe file stem.
pub(crate) fn storage_path(base_dir: &Path, key: &str, extension: &str) -> PathBuf {
    base_dir.join(format!("{}.{extension}", normalize_key(key)))
}

fn normalize_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || lower == '-' || lower == '_' {
            out.push(lower);
        } else {
            out.push('-');
        }
    }
    if out.trim_matches('-').is_empty() {
        "default".to_string()
    } else {
        out
    }
}

/// Write `data` to `path` through a same-directory temp file so readers
/// never observe a partial entry. Files end up mode 0o600, the directory
/// 0o700.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }

    let file_name = path.file_name().ok_or_else(|| {
        AuthError::Storage(format!("storage path {} has no file name", path.display()))
    })?;

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_name = format!(
        ".{}.tmp-{}-{nonce}",
        file_name.to_string_lossy(),
        std::process::id()
    );
    let temp_path = path.with_file_name(temp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let write_result = (|| -> std::io::Result<()> {
        let mut temp_file = options.open(&temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}
