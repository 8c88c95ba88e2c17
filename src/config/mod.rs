//! Identity-provider configuration for the device authorization flow.

use regex::Regex;

use crate::error::AuthError;

const DEFAULT_SCOPES: &str = "openid profile email offline_access";

const DOMAIN_PATTERN: &str = r"^https://[A-Za-z0-9][A-Za-z0-9.-]*(:[0-9]+)?$";
const CLIENT_ID_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

/// Settings for one identity-provider tenant.
///
/// `domain` is the https origin of the tenant (no trailing slash, no path);
/// all OAuth endpoints are derived from it. Tests point individual endpoints
/// at a mock server through the `with_*_url` overrides on
/// [`ProviderClient`](crate::provider::ProviderClient) instead of changing
/// the domain.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub domain: String,
    pub client_id: String,
    pub audience: Option<String>,
    pub scopes: String,
}

impl AuthConfig {
    pub fn new(domain: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            audience: None,
            scopes: DEFAULT_SCOPES.to_string(),
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_scopes(mut self, scopes: impl Into<String>) -> Self {
        self.scopes = scopes.into();
        self
    }

    /// Load from environment variables (SIDECAR_AUTH_DOMAIN,
    /// SIDECAR_AUTH_CLIENT_ID, and optionally SIDECAR_AUTH_AUDIENCE and
    /// SIDECAR_AUTH_SCOPES).
    pub fn from_env() -> Result<Self, AuthError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let domain = std::env::var("SIDECAR_AUTH_DOMAIN")
            .map_err(|_| AuthError::Configuration("SIDECAR_AUTH_DOMAIN not set".to_string()))?;
        let client_id = std::env::var("SIDECAR_AUTH_CLIENT_ID")
            .map_err(|_| AuthError::Configuration("SIDECAR_AUTH_CLIENT_ID not set".to_string()))?;

        let mut config = Self::new(domain, client_id);
        if let Ok(audience) = std::env::var("SIDECAR_AUTH_AUDIENCE") {
            config = config.with_audience(audience);
        }
        if let Ok(scopes) = std::env::var("SIDECAR_AUTH_SCOPES") {
            config = config.with_scopes(scopes);
        }
        Ok(config)
    }

    /// Shape-check the configuration before any network traffic.
    pub fn validate(&self) -> Result<(), AuthError> {
        let domain = Regex::new(DOMAIN_PATTERN)
            .map_err(|e| AuthError::Configuration(e.to_string()))?;
        if !domain.is_match(&self.domain) {
            return Err(AuthError::Configuration(format!(
                "auth domain must be an https origin, got {:?}",
                self.domain
            )));
        }
        let client_id = Regex::new(CLIENT_ID_PATTERN)
            .map_err(|e| AuthError::Configuration(e.to_string()))?;
        if !client_id.is_match(&self.client_id) {
            return Err(AuthError::Configuration(
                "client id is empty or malformed".to_string(),
            ));
        }
        if self.scopes.trim().is_empty() {
            return Err(AuthError::Configuration(
                "at least one scope is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn device_code_url(&self) -> String {
        format!("{}/oauth/device/code", self.domain)
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.domain)
    }

    pub fn userinfo_url(&self) -> String {
        format!("{}/userinfo", self.domain)
    }

    pub fn revoke_url(&self) -> String {
        format!("{}/oauth/revoke", self.domain)
    }
}
