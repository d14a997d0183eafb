//! Per-device credential cache with expiry-aware refresh
//!
//! The cache hands back a usable [`DeviceCredential`] for a device login,
//! authenticating through an [`IdentityProvider`] when the cached entry is
//! missing or too close to expiry. Expired entries are evicted lazily:
//! either when requested again, or by a periodic sweep that runs at most
//! once per `sweep_interval`.
//!
//! Failed authentications are never cached; the next request for the same
//! login simply tries again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Device login is empty")]
    EmptyLogin,
    #[error("Authentication rejected for {login}: HTTP {status}")]
    Rejected { login: String, status: u16 },
    #[error("Authentication request failed: {0}")]
    Transport(String),
    #[error("Malformed authentication response: {0}")]
    Malformed(String),
    #[error("Credential for {login} already expired at {expires_at}")]
    AlreadyExpired { login: String, expires_at: i64 },
}

/// An authenticated session for one device login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredential {
    /// Login the credential was issued for
    pub device_login: String,
    /// Opaque session token
    pub access_token: String,
    /// Tenant identifier ("Client" in the wrapped API)
    pub tenant_id: String,
    /// Partition identifier ("Branch" in the wrapped API)
    pub partition_id: String,
    /// Expiry in epoch milliseconds
    pub expires_at: i64,
}

impl DeviceCredential {
    /// Check if the credential is still usable at `now_ms` with `margin_ms` to spare
    pub fn is_valid_at(&self, now_ms: i64, margin_ms: i64) -> bool {
        self.expires_at > now_ms.saturating_add(margin_ms)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// The external identity endpoint
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a device login for a fresh credential
    async fn authenticate(&self, device_login: &str) -> Result<DeviceCredential, AuthError>;
}

/// Cache tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Entries expiring sooner than this are refreshed instead of reused
    pub refresh_margin: Duration,
    /// Minimum time between sweeps of expired entries
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, DeviceCredential>,
    last_sweep_ms: i64,
}

/// Credential cache keyed by device login
pub struct CredentialCache {
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    state: RwLock<CacheState>,
}

impl CredentialCache {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let last_sweep_ms = clock.now_millis();
        Self {
            provider,
            clock,
            config,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                last_sweep_ms,
            }),
        }
    }

    /// Return a valid credential for `device_login`, authenticating if needed
    ///
    /// A cached entry is reused only while it expires more than
    /// `refresh_margin` in the future. Otherwise the provider is called and a
    /// successful result replaces any previous entry for the login.
    pub async fn get_credential(&self, device_login: &str) -> Result<DeviceCredential, AuthError> {
        if device_login.is_empty() {
            return Err(AuthError::EmptyLogin);
        }

        let now = self.clock.now_millis();
        self.maybe_sweep(now).await;

        let margin_ms = self.config.refresh_margin.as_millis() as i64;
        {
            let state = self.state.read().await;
            if let Some(cred) = state.entries.get(device_login) {
                if cred.is_valid_at(now, margin_ms) {
                    return Ok(cred.clone());
                }
                debug!(device = %device_login, "Cached credential near expiry, re-authenticating");
            }
        }

        let result = self.provider.authenticate(device_login).await;
        let mut state = self.state.write().await;
        match result {
            Ok(cred) => {
                let now = self.clock.now_millis();
                if cred.is_expired_at(now) {
                    state.entries.remove(device_login);
                    return Err(AuthError::AlreadyExpired {
                        login: device_login.to_string(),
                        expires_at: cred.expires_at,
                    });
                }
                info!(
                    device = %device_login,
                    expires_at = cred.expires_at,
                    "Authenticated device"
                );
                state.entries.insert(device_login.to_string(), cred.clone());
                Ok(cred)
            }
            Err(e) => {
                // A stale entry must not outlive a failed refresh
                state.entries.remove(device_login);
                Err(e)
            }
        }
    }

    /// Drop the cached credential for a login, if any
    pub async fn invalidate(&self, device_login: &str) -> bool {
        self.state.write().await.entries.remove(device_login).is_some()
    }

    /// Remove every entry that has already expired, returning how many went
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.write().await;
        Self::sweep_locked(&mut state, now)
    }

    pub async fn contains(&self, device_login: &str) -> bool {
        self.state.read().await.entries.contains_key(device_login)
    }

    pub async fn cached(&self, device_login: &str) -> Option<DeviceCredential> {
        self.state.read().await.entries.get(device_login).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    async fn maybe_sweep(&self, now: i64) {
        let interval_ms = self.config.sweep_interval.as_millis() as i64;
        if now - self.state.read().await.last_sweep_ms < interval_ms {
            return;
        }
        let mut state = self.state.write().await;
        // Another caller may have swept while we waited for the lock
        if now - state.last_sweep_ms >= interval_ms {
            Self::sweep_locked(&mut state, now);
        }
    }

    fn sweep_locked(state: &mut CacheState, now: i64) -> usize {
        let before = state.entries.len();
        state.entries.retain(|login, cred| {
            let keep = !cred.is_expired_at(now);
            if !keep {
                debug!(device = %login, "Evicted expired credential");
            }
            keep
        });
        state.last_sweep_ms = now;
        let removed = before - state.entries.len();
        if removed > 0 {
            info!(removed, remaining = state.entries.len(), "Swept expired credentials");
        }
        removed
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
