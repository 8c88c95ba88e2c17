//! Error types for sidecar-auth.

use thiserror::Error;

use crate::provider::ProviderCode;

/// Primary error type for all authentication, session, and storage operations.
///
/// Variants carry owned strings rather than source errors so the whole enum
/// stays `Clone`; the refresh path resolves one shared future for every
/// concurrent caller and hands each of them the same outcome.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider error ({code}): {message}")]
    Provider { code: ProviderCode, message: String },

    #[error("Invalid response: {0}")]
    Validation(String),

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Refresh tokens cannot be persisted by fallback storage")]
    RefreshTokenNotPersistable,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Token refresh not needed")]
    RefreshNotNeeded,

    #[error("Re-authentication required")]
    ReauthenticationRequired,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AuthError {
    /// Whether the operation may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }

    /// Whether a failed refresh leaves the current session beyond saving.
    ///
    /// Callers holding a session tear it down on these errors; anything else
    /// is transient and the existing session stays in place.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Self::ReauthenticationRequired | Self::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, AuthError>;
