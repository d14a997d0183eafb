//! reqwest-backed Twinzo client
//!
//! One pooled [`reqwest::Client`] serves both endpoints:
//! - `authenticate` exchanges a device login for a token ([`IdentityProvider`])
//! - `post_localization` sends localization records ([`LocalizationSink`])

use std::time::Duration;

use amrlink_core::{
    AuthError, DeviceCredential, DispatchError, IdentityProvider, LocalizationRecord,
    LocalizationSink,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::api::{AuthRequest, AuthResponse};

/// Production API root
pub const DEFAULT_BASE_URL: &str = "https://api.platform.twinzo.com";
pub const AUTH_PATH: &str = "/v3/authorization/authenticate";
pub const LOCALIZATION_PATH: &str = "/v3/localization";

/// Response bodies are cut to this many characters in errors
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug)]
pub enum TwinzoError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Invalid header value for {name}")]
    InvalidHeader { name: &'static str },
}

/// Endpoint and tenant settings
#[derive(Debug, Clone, PartialEq)]
pub struct TwinzoConfig {
    pub auth_url: String,
    pub localization_url: String,
    /// Tenant name sent as `client` in the auth body
    pub tenant: String,
    /// Shared device password
    pub password: String,
    /// Sent as the `Api-Key` header on localization calls
    pub api_key: String,
    pub timeout: Duration,
}

impl TwinzoConfig {
    /// Derive both endpoint URLs from an API root
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            auth_url: format!("{}{}", base, AUTH_PATH),
            localization_url: format!("{}{}", base, LOCALIZATION_PATH),
            ..Self::default()
        }
    }
}

impl Default for TwinzoConfig {
    fn default() -> Self {
        Self {
            auth_url: format!("{}{}", DEFAULT_BASE_URL, AUTH_PATH),
            localization_url: format!("{}{}", DEFAULT_BASE_URL, LOCALIZATION_PATH),
            tenant: String::new(),
            password: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Twinzo REST client
pub struct TwinzoClient {
    http: reqwest::Client,
    config: TwinzoConfig,
}

impl TwinzoClient {
    pub fn new(config: TwinzoConfig) -> Result<Self, TwinzoError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        // Api-Key is sent verbatim on every localization call
        HeaderValue::from_str(&config.api_key)
            .map_err(|_| TwinzoError::InvalidHeader { name: "Api-Key" })?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &TwinzoConfig {
        &self.config
    }
}

#[async_trait]
impl IdentityProvider for TwinzoClient {
    async fn authenticate(&self, device_login: &str) -> Result<DeviceCredential, AuthError> {
        debug!(device = %device_login, url = %self.config.auth_url, "Requesting token");

        let response = self
            .http
            .post(&self.config.auth_url)
            .json(&AuthRequest {
                client: &self.config.tenant,
                login: device_login,
                password: &self.config.password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AuthError::Rejected {
                login: device_login.to_string(),
                status: status.as_u16(),
            });
        }

        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if body.token.is_empty() {
            return Err(AuthError::Malformed("empty Token".to_string()));
        }

        Ok(body.into_credential(device_login))
    }
}

#[async_trait]
impl LocalizationSink for TwinzoClient {
    async fn post_localization(
        &self,
        credential: &DeviceCredential,
        records: &[LocalizationRecord],
    ) -> Result<u16, DispatchError> {
        let response = self
            .http
            .post(&self.config.localization_url)
            .header("Client", &credential.tenant_id)
            .header("Branch", &credential.partition_id)
            .header("Token", &credential.access_token)
            .header("Api-Key", &self.config.api_key)
            .json(records)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        })
    }
}

impl std::fmt::Debug for TwinzoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwinzoClient")
            .field("auth_url", &self.config.auth_url)
            .field("localization_url", &self.config.localization_url)
            .field("tenant", &self.config.tenant)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_urls() {
        let config = TwinzoConfig::default();
        assert_eq!(
            config.auth_url,
            "https://api.platform.twinzo.com/v3/authorization/authenticate"
        );
        assert_eq!(
            config.localization_url,
            "https://api.platform.twinzo.com/v3/localization"
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let config = TwinzoConfig::with_base_url("http://127.0.0.1:8080/");
        assert_eq!(config.auth_url, "http://127.0.0.1:8080/v3/authorization/authenticate");
        assert_eq!(config.localization_url, "http://127.0.0.1:8080/v3/localization");
    }

    #[test]
    fn test_invalid_api_key_rejected() {
        let config = TwinzoConfig {
            api_key: "bad\nkey".to_string(),
            ..TwinzoConfig::default()
        };
        assert!(matches!(
            TwinzoClient::new(config),
            Err(TwinzoError::InvalidHeader { name: "Api-Key" })
        ));
    }
}
