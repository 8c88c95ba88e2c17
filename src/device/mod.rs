//! Device authorization: code request, polling loop, backstop, cancellation.
//!
//! The controller owns the polling task. At most one flow is active at a
//! time; starting a new one cancels the previous task before any network
//! call. The task itself never returns errors to a caller, every terminal
//! condition surfaces through the event bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::events::{AuthEvent, AuthEventBus};
use crate::manager::SessionManager;
use crate::provider::{DeviceCodeResponse, ProviderClient, ProviderCode, TokenResponse};
use crate::session::Session;

/// Backstop for the whole flow, independent of the provider's `expires_in`.
pub const FLOW_TIMEOUT_SECS: u64 = 600;

/// Added to the poll interval every time the provider answers `slow_down`.
pub const SLOW_DOWN_BACKOFF_SECS: u64 = 5;

/// Display payload for the pairing UI. The device code itself stays inside
/// the polling task and is never exposed here.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAuthorization {
    pub user_code: String,
    pub verification_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Seconds until the code expires, capped at the flow backstop.
    pub expires_in: u64,
    /// Seconds between poll attempts.
    pub interval: u64,
}

impl DeviceAuthorization {
    fn from_response(response: &DeviceCodeResponse, backstop: Duration) -> Self {
        Self {
            user_code: response.user_code.clone(),
            verification_uri: response.verification_uri.clone(),
            verification_uri_complete: response.verification_uri_complete.clone(),
            expires_in: response.expires_in.min(backstop.as_secs()),
            interval: response.interval,
        }
    }
}

/// Next move for the polling loop after a failed token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollAction {
    /// The user has not approved yet; try again at the current cadence.
    KeepPolling,
    /// The provider asked for a slower cadence.
    StretchInterval,
    /// Terminal provider verdict with a fixed user-facing message.
    Stop(&'static str),
    /// Unexpected failure; surface the error itself.
    StopWithError,
}

fn poll_action(error: &AuthError) -> PollAction {
    match error {
        AuthError::Provider {
            code: ProviderCode::AuthorizationPending,
            ..
        } => PollAction::KeepPolling,
        AuthError::Provider {
            code: ProviderCode::SlowDown,
            ..
        } => PollAction::StretchInterval,
        AuthError::Provider {
            code: ProviderCode::ExpiredToken,
            ..
        } => PollAction::Stop("Device code expired. Please try again."),
        AuthError::Provider {
            code: ProviderCode::AccessDenied,
            ..
        } => PollAction::Stop("Access denied by user."),
        _ => PollAction::StopWithError,
    }
}

/// Runs the device authorization grant against the provider.
#[derive(Clone)]
pub struct DeviceAuthorizationController {
    provider: ProviderClient,
    manager: SessionManager,
    events: AuthEventBus,
    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    flow_timeout: Duration,
}

impl std::fmt::Debug for DeviceAuthorizationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorizationController")
            .field("polling", &self.is_polling())
            .finish_non_exhaustive()
    }
}

impl DeviceAuthorizationController {
    pub fn new(provider: ProviderClient, manager: SessionManager, events: AuthEventBus) -> Self {
        Self {
            provider,
            manager,
            events,
            poll_task: Arc::new(Mutex::new(None)),
            flow_timeout: Duration::from_secs(FLOW_TIMEOUT_SECS),
        }
    }

    /// Shorten the flow backstop, for tests.
    pub fn with_flow_timeout(mut self, timeout: Duration) -> Self {
        self.flow_timeout = timeout;
        self
    }

    /// Request a device code and start polling for the user's approval.
    ///
    /// Malformed client configuration fails here, before any network call.
    /// Any previously running flow is cancelled first.
    pub async fn start(&self) -> Result<DeviceAuthorization, AuthError> {
        self.provider.config().validate()?;
        self.cancel();

        let response = self.provider.request_device_code().await?;
        let authorization = DeviceAuthorization::from_response(&response, self.flow_timeout);
        info!(
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            "device authorization started"
        );

        let task = tokio::spawn(poll_for_authorization(
            self.provider.clone(),
            self.manager.clone(),
            self.events.clone(),
            response,
            self.flow_timeout,
        ));
        if let Some(previous) = self.poll_task.lock().unwrap().replace(task) {
            previous.abort();
        }
        Ok(authorization)
    }

    /// Stop polling. Idempotent; safe to call with nothing running.
    pub fn cancel(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
            debug!("device authorization polling cancelled");
        }
    }

    /// Whether a polling task is currently live.
    pub fn is_polling(&self) -> bool {
        self.poll_task
            .lock()
            .unwrap()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

async fn poll_for_authorization(
    provider: ProviderClient,
    manager: SessionManager,
    events: AuthEventBus,
    response: DeviceCodeResponse,
    flow_timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + flow_timeout;
    let mut interval = Duration::from_secs(response.interval);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!("device authorization timed out");
                events.notify(&AuthEvent::Error(
                    "Authorization timeout. Please try again.".to_string(),
                ));
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match provider.exchange_device_code(&response.device_code).await {
            Ok(grant) => {
                complete_sign_in(&provider, &manager, &events, grant).await;
                return;
            }
            Err(err) => match poll_action(&err) {
                PollAction::KeepPolling => {}
                PollAction::StretchInterval => {
                    interval += Duration::from_secs(SLOW_DOWN_BACKOFF_SECS);
                    debug!(
                        interval_secs = interval.as_secs(),
                        "provider asked to slow down"
                    );
                }
                PollAction::Stop(message) => {
                    events.notify(&AuthEvent::Error(message.to_string()));
                    return;
                }
                PollAction::StopWithError => {
                    warn!(error = %err, "device authorization failed");
                    events.notify(&AuthEvent::Error(err.to_string()));
                    return;
                }
            },
        }
    }
}

/// Final step of the flow: validate the grant, fetch the profile, install
/// the session. `install_session` announces the sign-in.
async fn complete_sign_in(
    provider: &ProviderClient,
    manager: &SessionManager,
    events: &AuthEventBus,
    grant: TokenResponse,
) {
    let tokens = match grant.into_tokens(None) {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!(error = %err, "device grant was malformed");
            events.notify(&AuthEvent::Error(err.to_string()));
            return;
        }
    };
    let user = match provider.fetch_userinfo(&tokens.access_token).await {
        Ok(user) => user,
        Err(err) => {
            warn!(error = %err, "failed to fetch user profile");
            events.notify(&AuthEvent::Error(err.to_string()));
            return;
        }
    };
    manager.install_session(Session { user, tokens });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_error(code: ProviderCode) -> AuthError {
        AuthError::Provider {
            code,
            message: "test".to_string(),
        }
    }

    #[test]
    fn pending_keeps_the_current_cadence() {
        assert_eq!(
            poll_action(&provider_error(ProviderCode::AuthorizationPending)),
            PollAction::KeepPolling
        );
    }

    #[test]
    fn slow_down_stretches_the_cadence() {
        assert_eq!(
            poll_action(&provider_error(ProviderCode::SlowDown)),
            PollAction::StretchInterval
        );
    }

    #[test]
    fn expired_and_denied_codes_are_terminal() {
        assert_eq!(
            poll_action(&provider_error(ProviderCode::ExpiredToken)),
            PollAction::Stop("Device code expired. Please try again.")
        );
        assert_eq!(
            poll_action(&provider_error(ProviderCode::AccessDenied)),
            PollAction::Stop("Access denied by user.")
        );
    }

    #[test]
    fn unexpected_failures_stop_with_the_error_itself() {
        assert_eq!(
            poll_action(&provider_error(ProviderCode::InvalidGrant)),
            PollAction::StopWithError
        );
        assert_eq!(
            poll_action(&AuthError::Network("connection reset".to_string())),
            PollAction::StopWithError
        );
    }

    #[test]
    fn display_payload_caps_expiry_at_the_backstop() {
        let response = DeviceCodeResponse {
            device_code: "dc".to_string(),
            user_code: "ABCD-EFGH".to_string(),
            verification_uri: "https://sidecar-test.auth0.com/activate".to_string(),
            verification_uri_complete: None,
            expires_in: 900,
            interval: 5,
        };

        let capped =
            DeviceAuthorization::from_response(&response, Duration::from_secs(FLOW_TIMEOUT_SECS));
        assert_eq!(capped.expires_in, FLOW_TIMEOUT_SECS);
        assert_eq!(capped.interval, 5);

        let uncapped = DeviceAuthorization::from_response(&response, Duration::from_secs(3600));
        assert_eq!(uncapped.expires_in, 900);
    }
}
