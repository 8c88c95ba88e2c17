#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use wiremock::MockServer;

use sidecar_auth::config::AuthConfig;
use sidecar_auth::error::AuthError;
use sidecar_auth::events::AuthEvent;
use sidecar_auth::provider::ProviderClient;
use sidecar_auth::session::{Session, Tokens, User};
use sidecar_auth::storage::{NoOsEncryption, OsEncryption, SecureStorage};

/// XOR stand-in for the platform encryption facility.
pub struct FakeOsEncryption;

impl OsEncryption for FakeOsEncryption {
    fn is_available(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(plaintext.iter().map(|b| b ^ 0x5a).collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(ciphertext.iter().map(|b| b ^ 0x5a).collect())
    }
}

pub fn os_storage(dir: &TempDir) -> SecureStorage {
    SecureStorage::probe(dir.path().to_path_buf(), Arc::new(FakeOsEncryption))
}

pub fn fallback_storage(dir: &TempDir) -> SecureStorage {
    SecureStorage::probe(dir.path().to_path_buf(), Arc::new(NoOsEncryption))
}

/// Collects every event the bus delivers, for ordering assertions.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<AuthEvent>>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener closure to hand to `subscribe`/`on_auth_state_change`.
    pub fn recorder(&self) -> impl Fn(&AuthEvent) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event: &AuthEvent| {
            events.lock().expect("collector lock poisoned").push(event.clone());
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("collector lock poisoned")
            .iter()
            .map(|event| event.kind())
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }

    pub fn take(&self) -> Vec<AuthEvent> {
        std::mem::take(&mut *self.events.lock().expect("collector lock poisoned"))
    }
}

/// Poll `condition` until it holds, panicking after `deadline`.
pub async fn wait_until<F>(deadline: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while !condition() {
        if started.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn test_config() -> AuthConfig {
    AuthConfig::new("https://sidecar-test.auth0.com", "test-client-id")
}

/// Provider client with every endpoint pointed at the mock server.
pub fn provider_for(server: &MockServer) -> ProviderClient {
    ProviderClient::new(test_config())
        .with_device_code_url(format!("{}/oauth/device/code", server.uri()))
        .with_token_url(format!("{}/oauth/token", server.uri()))
        .with_userinfo_url(format!("{}/userinfo", server.uri()))
        .with_revoke_url(format!("{}/oauth/revoke", server.uri()))
}

pub fn user() -> User {
    User {
        sub: "auth0|steward".to_string(),
        email: Some("steward@example.com".to_string()),
        name: Some("Steward".to_string()),
        created_at: None,
        extra: Default::default(),
    }
}

pub fn tokens_expiring_in(secs: i64, refresh_token: Option<&str>) -> Tokens {
    Tokens {
        access_token: "access-A".to_string(),
        refresh_token: refresh_token.map(str::to_string),
        id_token: None,
        expires_at: Utc::now() + chrono::Duration::seconds(secs),
        token_type: "Bearer".to_string(),
        scope: Some("openid profile email offline_access".to_string()),
    }
}

pub fn session_expiring_in(secs: i64, refresh_token: Option<&str>) -> Session {
    Session {
        user: user(),
        tokens: tokens_expiring_in(secs, refresh_token),
    }
}
