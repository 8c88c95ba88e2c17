//! Auth state-change fan-out to in-process listeners.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::session::Session;

/// State changes announced by the auth core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut,
    TokenRefreshed(Session),
    Error(String),
}

impl AuthEvent {
    /// Snake-case event name for log fields and IPC topics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignedIn(_) => "signed_in",
            Self::SignedOut => "signed_out",
            Self::TokenRefreshed(_) => "token_refreshed",
            Self::Error(_) => "error",
        }
    }
}

type Listener = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

/// Synchronous event bus for auth state changes.
///
/// Listeners run on the notifier's thread, each isolated behind
/// `catch_unwind`: one listener panicking is logged and the rest still run.
/// Cloning the bus is cheap and clones share the listener set.
#[derive(Clone, Default)]
pub struct AuthEventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Keep the returned guard alive for as long as the
    /// listener should receive events; dropping it unsubscribes.
    pub fn subscribe<F>(&self, listener: F) -> AuthSubscription
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(listener));
        AuthSubscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every listener. Never fails and never panics back
    /// into the caller.
    pub fn notify(&self, event: &AuthEvent) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(event))).is_err() {
                tracing::warn!(event = event.kind(), "auth event listener panicked");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }
}

/// Guard for a registered listener; dropping it removes the listener.
pub struct AuthSubscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl AuthSubscription {
    /// Remove the listener now instead of waiting for drop.
    pub fn unsubscribe(self) {}
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.listeners.lock().unwrap().remove(&self.id);
        }
    }
}
