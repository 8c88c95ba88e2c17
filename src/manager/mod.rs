//! Session lifecycle: the in-memory session, proactive refresh, sign-out.
//!
//! Exactly one session is authoritative at a time and every mutation of it
//! goes through the manager. Refresh is single-flight: concurrent callers
//! share one in-flight future instead of racing the token endpoint.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Duration;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::events::{AuthEvent, AuthEventBus};
use crate::limit::RateLimiter;
use crate::provider::{ProviderClient, ProviderCode};
use crate::session::Session;
use crate::storage::{SecureStorage, SESSION_KEY};

/// Refresh attempts allowed per refresh token within the rolling window.
pub const REFRESH_MAX_ATTEMPTS: u32 = 5;

/// Length of the rolling refresh-attempt window.
pub const REFRESH_WINDOW_SECONDS: i64 = 60;

type SharedRefresh = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// Owns the current [`Session`] and coordinates refresh and sign-out.
///
/// Cheap to clone; clones share the same session, refresh gate, and
/// rate-limit state.
#[derive(Clone)]
pub struct SessionManager {
    provider: ProviderClient,
    storage: SecureStorage,
    events: AuthEventBus,
    session: Arc<RwLock<Option<Session>>>,
    refresh_gate: Arc<Mutex<Option<SharedRefresh>>>,
    limiter: RateLimiter,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("authenticated", &self.current_session().is_some())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(provider: ProviderClient, storage: SecureStorage, events: AuthEventBus) -> Self {
        Self {
            provider,
            storage,
            events,
            session: Arc::new(RwLock::new(None)),
            refresh_gate: Arc::new(Mutex::new(None)),
            limiter: RateLimiter::new(),
        }
    }

    /// Snapshot of the current session, if any.
    pub fn current_session(&self) -> Option<Session> {
        self.session.read().unwrap().clone()
    }

    /// Persist `session`, make it current, and announce the sign-in.
    ///
    /// When the fallback storage backend refuses the refresh token, the
    /// persisted copy is stripped of it; the in-memory session keeps the
    /// full token set.
    pub fn install_session(&self, session: Session) {
        self.persist_session(&session);
        self.replace_session(session.clone());
        info!(user = ?session.user.summary(), "session installed");
        self.events.notify(&AuthEvent::SignedIn(session));
    }

    /// Load the persisted session at startup. Unreadable material and
    /// sessions expired beyond the refresh window are discarded.
    pub fn restore(&self) -> Option<Session> {
        let raw = self.storage.get(SESSION_KEY)?;
        let session: Session = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "persisted session is unreadable, discarding");
                self.storage.remove(SESSION_KEY);
                return None;
            }
        };
        if session.tokens.is_beyond_refresh_window() {
            info!("persisted session expired too long ago, discarding");
            self.storage.remove(SESSION_KEY);
            return None;
        }
        debug!(user = ?session.user.summary(), "restored persisted session");
        self.replace_session(session.clone());
        Some(session)
    }

    /// Current session for callers that need a usable access token.
    ///
    /// Refreshes first when the token is inside the five-minute expiry
    /// buffer. A refresh failure that ends the session (stale beyond the
    /// grace window, attempt budget exhausted, or a provider rejection that
    /// already signed us out) yields `Ok(None)`; any other failure serves
    /// the possibly stale session rather than blocking the caller.
    pub async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.current_session() else {
            return Ok(None);
        };
        if !session.tokens.needs_refresh() {
            return Ok(Some(session));
        }
        match self.refresh().await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(AuthError::RefreshNotNeeded) => Ok(self.current_session()),
            Err(err) if err.ends_session() => {
                warn!(error = %err, "refresh failed, ending session");
                if self.current_session().is_some() {
                    self.sign_out().await;
                }
                Ok(None)
            }
            Err(err) => {
                warn!(error = %err, "refresh failed, serving possibly stale session");
                Ok(Some(session))
            }
        }
    }

    /// Exchange the refresh token for fresh access credentials.
    ///
    /// Concurrent callers share a single in-flight exchange and all see its
    /// result.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let inflight = {
            let mut gate = self.refresh_gate.lock().unwrap();
            match gate.as_ref() {
                Some(inflight) => inflight.clone(),
                None => {
                    let manager = self.clone();
                    let fresh = async move { manager.refresh_inner().await }.boxed().shared();
                    *gate = Some(fresh.clone());
                    fresh
                }
            }
        };
        let result = inflight.await;
        let mut gate = self.refresh_gate.lock().unwrap();
        if gate.as_ref().and_then(|pending| pending.peek()).is_some() {
            *gate = None;
        }
        result
    }

    async fn refresh_inner(&self) -> Result<Session, AuthError> {
        let session = self.current_session().ok_or(AuthError::NoRefreshToken)?;
        let Some(refresh_token) = session.tokens.refresh_token.clone() else {
            return Err(AuthError::NoRefreshToken);
        };
        if !session.tokens.needs_refresh() {
            return Err(AuthError::RefreshNotNeeded);
        }
        if session.tokens.is_beyond_refresh_window() {
            return Err(AuthError::ReauthenticationRequired);
        }
        self.limiter.check(
            &refresh_token,
            REFRESH_MAX_ATTEMPTS,
            Duration::seconds(REFRESH_WINDOW_SECONDS),
        )?;

        let response = match self.provider.refresh_token(&refresh_token).await {
            Ok(response) => response,
            Err(AuthError::Provider {
                code: ProviderCode::InvalidGrant,
                message,
            }) => {
                warn!(message, "refresh token rejected by provider, signing out");
                self.sign_out().await;
                return Err(AuthError::ReauthenticationRequired);
            }
            Err(AuthError::Provider {
                code: ProviderCode::InvalidClient,
                message,
            }) => {
                return Err(AuthError::Configuration(message));
            }
            Err(err) => return Err(err),
        };

        let tokens = response.into_tokens(Some(refresh_token.clone()))?;
        let refreshed = Session {
            user: session.user,
            tokens,
        };
        self.persist_session(&refreshed);
        self.replace_session(refreshed.clone());
        self.limiter.clear(&refresh_token);
        info!(expires_at = %refreshed.tokens.expires_at, "access token refreshed");
        self.events.notify(&AuthEvent::TokenRefreshed(refreshed.clone()));
        Ok(refreshed)
    }

    /// Tear the session down. Revocation at the provider is best-effort;
    /// local state is always cleared and `SignedOut` always fires.
    /// Idempotent.
    pub async fn sign_out(&self) {
        let session = self.session.write().unwrap().take();
        if let Some(session) = session {
            if let Some(refresh_token) = session.tokens.refresh_token.as_deref() {
                if let Err(e) = self.provider.revoke_token(refresh_token).await {
                    warn!(error = %e, "token revocation failed during sign-out");
                }
            }
        }
        self.storage.remove(SESSION_KEY);
        info!("signed out");
        self.events.notify(&AuthEvent::SignedOut);
    }

    fn replace_session(&self, session: Session) {
        *self.session.write().unwrap() = Some(session);
    }

    fn persist_session(&self, session: &Session) {
        let serialized = match serde_json::to_string(session) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(error = %e, "failed to serialize session");
                return;
            }
        };
        match self.storage.set(SESSION_KEY, &serialized) {
            Ok(()) => {}
            Err(AuthError::RefreshTokenNotPersistable) => {
                debug!("fallback storage refused the refresh token, persisting without it");
                match serde_json::to_string(&session.without_refresh_token()) {
                    Ok(serialized) => {
                        if let Err(e) = self.storage.set(SESSION_KEY, &serialized) {
                            warn!(error = %e, "failed to persist session");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize session"),
                }
            }
            Err(e) => warn!(error = %e, "failed to persist session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::session::{Tokens, User};
    use crate::storage::NoOsEncryption;
    use chrono::Utc;
    use tempfile::TempDir;

    fn manager_with_fallback_storage() -> (TempDir, SecureStorage, SessionManager) {
        let dir = TempDir::new().unwrap();
        let storage = SecureStorage::probe(dir.path().to_path_buf(), Arc::new(NoOsEncryption));
        let config = AuthConfig::new("https://sidecar-test.auth0.com", "test-client-id");
        let manager = SessionManager::new(
            ProviderClient::new(config),
            storage.clone(),
            AuthEventBus::default(),
        );
        (dir, storage, manager)
    }

    fn session(expires_in_secs: i64, refresh_token: Option<&str>) -> Session {
        Session {
            user: User {
                sub: "auth0|123".to_string(),
                email: Some("dev@example.com".to_string()),
                name: None,
                created_at: None,
                extra: Default::default(),
            },
            tokens: Tokens {
                access_token: "access".to_string(),
                refresh_token: refresh_token.map(str::to_string),
                id_token: None,
                expires_at: Utc::now() + Duration::seconds(expires_in_secs),
                token_type: "Bearer".to_string(),
                scope: None,
            },
        }
    }

    #[test]
    fn install_strips_refresh_token_for_fallback_storage_only() {
        let (dir, _storage, manager) = manager_with_fallback_storage();
        manager.install_session(session(3600, Some("refresh-R")));

        let current = manager.current_session().unwrap();
        assert_eq!(current.tokens.refresh_token.as_deref(), Some("refresh-R"));

        let raw = std::fs::read(dir.path().join("auth0_session.json")).unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(envelope.get("encrypted").is_some());

        let restored = manager.restore().unwrap();
        assert!(restored.tokens.refresh_token.is_none());
        assert_eq!(restored.tokens.access_token, "access");
    }

    #[test]
    fn restore_discards_sessions_expired_beyond_the_grace_window() {
        let (dir, _storage, manager) = manager_with_fallback_storage();
        manager.install_session(session(-120, None));

        assert!(manager.restore().is_none());
        assert!(!dir.path().join("auth0_session.json").exists());
    }

    #[test]
    fn restore_discards_unreadable_material() {
        let (dir, storage, manager) = manager_with_fallback_storage();
        storage.set(SESSION_KEY, "not a session").unwrap();

        assert!(manager.restore().is_none());
        assert!(!dir.path().join("auth0_session.json").exists());
    }
}
