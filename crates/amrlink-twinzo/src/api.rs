//! Wire types for the Twinzo authorization endpoint

use amrlink_core::DeviceCredential;
use serde::{Deserialize, Serialize};

/// Body of `POST /v3/authorization/authenticate`
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    pub client: &'a str,
    pub login: &'a str,
    pub password: &'a str,
}

/// Successful authorization response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResponse {
    pub token: String,
    pub client: String,
    pub branch: String,
    /// Epoch milliseconds
    pub expiration: i64,
}

impl AuthResponse {
    pub fn into_credential(self, device_login: &str) -> DeviceCredential {
        DeviceCredential {
            device_login: device_login.to_string(),
            access_token: self.token,
            tenant_id: self.client,
            partition_id: self.branch,
            expires_at: self.expiration,
        }
    }
}
