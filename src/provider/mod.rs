//! HTTP client for the identity provider's OAuth endpoints.

use chrono::{Duration, Utc};
use serde::Deserialize;
use strum::{Display, EnumString};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::session::{Tokens, User, MAX_TOKEN_LIFETIME_HOURS};

/// Hard bound on token-endpoint requests.
pub const TOKEN_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Error codes the provider reports in OAuth error bodies.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ProviderCode {
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
    AccessDenied,
    InvalidGrant,
    InvalidClient,
    #[strum(default)]
    Other(String),
}

impl ProviderCode {
    /// Parse an OAuth error code; unmatched strings become
    /// [`ProviderCode::Other`]. Inherent rather than a `From` impl because
    /// the `EnumString` derive already emits `TryFrom<&str>`, which a
    /// `From` impl would conflict with via core's blanket `TryFrom`.
    pub fn from(value: &str) -> Self {
        value
            .parse()
            .unwrap_or_else(|_| Self::Other(value.to_string()))
    }
}

/// Payload of `POST /oauth/device/code`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// Payload of `POST /oauth/token` for both grant types. Some providers put
/// error codes in a 200 body, so the error fields live here too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_in: Option<i64>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Convert into [`Tokens`], enforcing that the grant is complete and its
    /// expiry plausible. A response that omits the refresh token keeps
    /// `previous_refresh_token`.
    pub fn into_tokens(self, previous_refresh_token: Option<String>) -> Result<Tokens, AuthError> {
        let access_token = self
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                AuthError::Validation("token response missing access_token".to_string())
            })?;
        let expires_in = self.expires_in.ok_or_else(|| {
            AuthError::Validation("token response missing expires_in".to_string())
        })?;
        if expires_in <= 0 || expires_in > MAX_TOKEN_LIFETIME_HOURS * 3600 {
            return Err(AuthError::Validation("invalid token expiry".to_string()));
        }
        Ok(Tokens {
            access_token,
            refresh_token: self.refresh_token.or(previous_refresh_token),
            id_token: self.id_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: self.scope,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProviderErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Typed access to the provider's OAuth endpoints.
///
/// Endpoints derive from [`AuthConfig::domain`]; the `with_*_url` overrides
/// let tests point individual endpoints at a mock server.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    config: AuthConfig,
    device_code_url: String,
    token_url: String,
    userinfo_url: String,
    revoke_url: String,
    token_timeout: std::time::Duration,
}

impl ProviderClient {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            device_code_url: config.device_code_url(),
            token_url: config.token_url(),
            userinfo_url: config.userinfo_url(),
            revoke_url: config.revoke_url(),
            token_timeout: std::time::Duration::from_secs(TOKEN_REQUEST_TIMEOUT_SECS),
            config,
        }
    }

    pub fn with_device_code_url(mut self, url: impl Into<String>) -> Self {
        self.device_code_url = url.into();
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn with_userinfo_url(mut self, url: impl Into<String>) -> Self {
        self.userinfo_url = url.into();
        self
    }

    pub fn with_revoke_url(mut self, url: impl Into<String>) -> Self {
        self.revoke_url = url.into();
        self
    }

    pub fn with_token_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Ask the provider for a device code and user code.
    pub async fn request_device_code(&self) -> Result<DeviceCodeResponse, AuthError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("scope", self.config.scopes.as_str()),
        ];
        if let Some(audience) = self.config.audience.as_deref() {
            form.push(("audience", audience));
        }
        let resp = self
            .client
            .post(&self.device_code_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp, "Device code request").await);
        }
        Ok(resp.json().await?)
    }

    /// Try to exchange the device code for tokens. While the user has not
    /// approved yet this fails with `authorization_pending`.
    pub async fn exchange_device_code(
        &self,
        device_code: &str,
    ) -> Result<TokenResponse, AuthError> {
        self.token_request(
            &[
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", device_code),
                ("client_id", self.config.client_id.as_str()),
            ],
            "Device token request",
        )
        .await
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(audience) = self.config.audience.as_deref() {
            form.push(("audience", audience));
        }
        self.token_request(&form, "Token refresh").await
    }

    /// Fetch the signed-in user's profile.
    pub async fn fetch_userinfo(&self, access_token: &str) -> Result<User, AuthError> {
        let resp = self
            .client
            .get(&self.userinfo_url)
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp, "Userinfo request").await);
        }
        Ok(resp.json().await?)
    }

    /// Ask the provider to revoke `token`. Sign-out treats failures here as
    /// advisory.
    pub async fn revoke_token(&self, token: &str) -> Result<(), AuthError> {
        let resp = self
            .client
            .post(&self.revoke_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("token", token),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp, "Token revocation").await);
        }
        Ok(())
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        context: &str,
    ) -> Result<TokenResponse, AuthError> {
        let resp = self
            .client
            .post(&self.token_url)
            .timeout(self.token_timeout)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp, context).await);
        }
        let payload: TokenResponse = resp.json().await?;
        if let Some(code) = payload.error.as_deref() {
            return Err(AuthError::Provider {
                code: ProviderCode::from(code),
                message: payload
                    .error_description
                    .unwrap_or_else(|| format!("{context} rejected by provider")),
            });
        }
        Ok(payload)
    }
}

/// Map a non-2xx response to a provider error, preserving the OAuth error
/// code when the body carries one.
async fn provider_error(resp: reqwest::Response, context: &str) -> AuthError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let parsed: ProviderErrorBody = serde_json::from_str(&body).unwrap_or_default();
    match parsed.error {
        Some(code) => AuthError::Provider {
            code: ProviderCode::from(code.as_str()),
            message: parsed
                .error_description
                .unwrap_or_else(|| format!("{context} failed with status {status}")),
        },
        None => AuthError::Provider {
            code: ProviderCode::Other(format!("http_{}", status.as_u16())),
            message: format!("{context} failed with status {status}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_error_codes_parse() {
        assert_eq!(
            ProviderCode::from("authorization_pending"),
            ProviderCode::AuthorizationPending
        );
        assert_eq!(ProviderCode::from("slow_down"), ProviderCode::SlowDown);
        assert_eq!(
            ProviderCode::from("invalid_grant"),
            ProviderCode::InvalidGrant
        );
    }

    #[test]
    fn unknown_error_codes_are_preserved() {
        let code = ProviderCode::from("mfa_required");
        assert_eq!(code, ProviderCode::Other("mfa_required".to_string()));
        assert_eq!(code.to_string(), "mfa_required");
    }

    #[test]
    fn error_codes_display_in_snake_case() {
        assert_eq!(
            ProviderCode::AuthorizationPending.to_string(),
            "authorization_pending"
        );
        assert_eq!(ProviderCode::InvalidClient.to_string(), "invalid_client");
    }

    fn grant(expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: Some("access".to_string()),
            expires_in: Some(expires_in),
            ..TokenResponse::default()
        }
    }

    #[test]
    fn grant_with_plausible_expiry_is_accepted() {
        let before = Utc::now();
        let tokens = grant(3600).into_tokens(None).expect("valid grant");
        let lifetime = tokens.expires_at - before;
        assert!(lifetime >= Duration::seconds(3595) && lifetime <= Duration::seconds(3605));
        assert_eq!(tokens.token_type, "Bearer");
    }

    #[test]
    fn grant_missing_access_token_is_rejected() {
        let response = TokenResponse {
            expires_in: Some(3600),
            ..TokenResponse::default()
        };
        let result = response.into_tokens(None);
        assert!(
            matches!(result, Err(AuthError::Validation(message)) if message.contains("access_token"))
        );
    }

    #[test]
    fn grant_missing_expiry_is_rejected() {
        let response = TokenResponse {
            access_token: Some("access".to_string()),
            ..TokenResponse::default()
        };
        let result = response.into_tokens(None);
        assert!(
            matches!(result, Err(AuthError::Validation(message)) if message.contains("expires_in"))
        );
    }

    #[test]
    fn non_positive_expiry_is_rejected() {
        for expires_in in [0, -100] {
            let result = grant(expires_in).into_tokens(None);
            assert!(
                matches!(result, Err(AuthError::Validation(message)) if message.contains("expiry")),
                "expires_in {expires_in} should be rejected"
            );
        }
    }

    #[test]
    fn expiry_beyond_a_day_is_rejected() {
        let result = grant(25 * 3600).into_tokens(None);
        assert!(
            matches!(result, Err(AuthError::Validation(message)) if message.contains("expiry"))
        );
    }

    #[test]
    fn expiry_of_exactly_a_day_is_accepted() {
        assert!(grant(24 * 3600).into_tokens(None).is_ok());
    }

    #[test]
    fn previous_refresh_token_is_kept_when_response_omits_one() {
        let tokens = grant(3600)
            .into_tokens(Some("old-refresh".to_string()))
            .expect("valid grant");
        assert_eq!(tokens.refresh_token.as_deref(), Some("old-refresh"));
    }

    #[test]
    fn rotated_refresh_token_wins_over_the_previous_one() {
        let mut response = grant(3600);
        response.refresh_token = Some("new-refresh".to_string());
        let tokens = response
            .into_tokens(Some("old-refresh".to_string()))
            .expect("valid grant");
        assert_eq!(tokens.refresh_token.as_deref(), Some("new-refresh"));
    }
}
