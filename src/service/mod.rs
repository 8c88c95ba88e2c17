//! The facade the desktop shell's IPC boundary calls into.
//!
//! Wires config, storage, event bus, manager, and controller together.
//! The UI layer is untrusted, so every inbound operation passes through an
//! operation-level rate limiter before it reaches the core.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use crate::config::AuthConfig;
use crate::device::{DeviceAuthorization, DeviceAuthorizationController};
use crate::error::AuthError;
use crate::events::{AuthEvent, AuthEventBus, AuthSubscription};
use crate::limit::RateLimiter;
use crate::manager::SessionManager;
use crate::provider::ProviderClient;
use crate::session::Session;
use crate::storage::{OsEncryption, SecureStorage};

/// Window shared by all per-operation budgets.
pub const OP_WINDOW_SECONDS: i64 = 60;

pub const START_FLOW_BUDGET: u32 = 10;
pub const CANCEL_FLOW_BUDGET: u32 = 10;
pub const GET_SESSION_BUDGET: u32 = 120;
pub const SIGN_OUT_BUDGET: u32 = 10;
pub const STORAGE_PROBE_BUDGET: u32 = 60;
pub const SUBSCRIBE_BUDGET: u32 = 30;

/// Authentication entry point for the embedding application.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AuthService {
    controller: DeviceAuthorizationController,
    manager: SessionManager,
    events: AuthEventBus,
    storage: SecureStorage,
    ops: RateLimiter,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("os_encryption", &self.storage.is_os_encryption())
            .field("polling", &self.controller.is_polling())
            .finish_non_exhaustive()
    }
}

impl AuthService {
    /// Build the full stack: probe storage, construct the provider client,
    /// manager, and controller.
    pub fn new(config: AuthConfig, storage_dir: PathBuf, encryption: Arc<dyn OsEncryption>) -> Self {
        let storage = SecureStorage::probe(storage_dir, encryption);
        Self::from_components(ProviderClient::new(config), storage)
    }

    /// Assemble from pre-built components, for tests that point the provider
    /// at a mock server.
    pub fn from_components(provider: ProviderClient, storage: SecureStorage) -> Self {
        let events = AuthEventBus::default();
        let manager = SessionManager::new(provider.clone(), storage.clone(), events.clone());
        let controller =
            DeviceAuthorizationController::new(provider, manager.clone(), events.clone());
        Self {
            controller,
            manager,
            events,
            storage,
            ops: RateLimiter::new(),
        }
    }

    /// Restore the persisted session at startup and announce it.
    ///
    /// Not an IPC-facing operation, so it is not rate limited.
    pub fn initialize(&self) -> Option<Session> {
        let session = self.manager.restore()?;
        self.events.notify(&AuthEvent::SignedIn(session.clone()));
        Some(session)
    }

    /// Begin the device authorization flow and return the pairing payload.
    pub async fn start_device_flow(&self) -> Result<DeviceAuthorization, AuthError> {
        self.check_op("start_device_flow", START_FLOW_BUDGET)?;
        self.controller.start().await
    }

    /// Stop any running device authorization flow.
    pub fn cancel_device_flow(&self) -> Result<(), AuthError> {
        self.check_op("cancel_device_flow", CANCEL_FLOW_BUDGET)?;
        self.controller.cancel();
        Ok(())
    }

    /// Current session, refreshed first if it is about to expire.
    pub async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        self.check_op("get_session", GET_SESSION_BUDGET)?;
        self.manager.get_session().await
    }

    /// Sign out. The underlying teardown never fails; only the operation
    /// gate can.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.check_op("sign_out", SIGN_OUT_BUDGET)?;
        self.manager.sign_out().await;
        Ok(())
    }

    /// Whether session material is protected by OS-level encryption rather
    /// than the software fallback.
    pub fn is_secure_storage_available(&self) -> Result<bool, AuthError> {
        self.check_op("is_secure_storage_available", STORAGE_PROBE_BUDGET)?;
        Ok(self.storage.is_os_encryption())
    }

    /// Subscribe to auth state transitions. Dropping the returned guard
    /// unsubscribes.
    pub fn on_auth_state_change<F>(&self, listener: F) -> Result<AuthSubscription, AuthError>
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.check_op("on_auth_state_change", SUBSCRIBE_BUDGET)?;
        Ok(self.events.subscribe(listener))
    }

    /// Whether a device authorization poll is live.
    pub fn is_polling(&self) -> bool {
        self.controller.is_polling()
    }

    fn check_op(&self, operation: &str, budget: u32) -> Result<(), AuthError> {
        self.ops
            .check(operation, budget, Duration::seconds(OP_WINDOW_SECONDS))
    }
}
