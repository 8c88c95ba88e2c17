//! Session, token, and user-profile types shared across the crate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tokens are refreshed once they are inside this window before expiry.
pub const REFRESH_GRACE_PERIOD_MINUTES: i64 = 5;
/// How long past expiry a token may still be exchanged for a fresh one;
/// beyond this the user signs in again.
pub const STALE_GRACE_PERIOD_SECONDS: i64 = 60;
/// Longest token lifetime accepted from the provider.
pub const MAX_TOKEN_LIFETIME_HOURS: i64 = 24;

/// OAuth token material for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Tokens {
    /// Whether the access token is close enough to expiry to refresh now.
    pub fn needs_refresh(&self) -> bool {
        let grace = Duration::minutes(REFRESH_GRACE_PERIOD_MINUTES);
        Utc::now() >= self.expires_at - grace
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the token expired so long ago that refreshing it is no longer
    /// allowed.
    pub fn is_beyond_refresh_window(&self) -> bool {
        Utc::now() - self.expires_at > Duration::seconds(STALE_GRACE_PERIOD_SECONDS)
    }
}

/// Identity-provider profile for the signed-in user.
///
/// Only `sub` is guaranteed; anything else the provider includes beyond the
/// named fields lands in `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl User {
    /// Log-safe projection. Everything outside this allow-list stays out of
    /// log output and diagnostics.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            sub: self.sub.clone(),
            email: self.email.clone(),
            created_at: self.created_at.clone(),
        }
    }
}

/// The subset of [`User`] fields that may appear in logs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserSummary {
    pub sub: String,
    pub email: Option<String>,
    pub created_at: Option<String>,
}

/// The authoritative unit of authentication state: one user, one set of
/// tokens. Persisted as a whole and replaced atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    pub tokens: Tokens,
}

impl Session {
    /// Copy of this session with the refresh token removed, for storage
    /// backends that refuse to persist one.
    pub fn without_refresh_token(&self) -> Session {
        let mut session = self.clone();
        session.tokens.refresh_token = None;
        session
    }
}
