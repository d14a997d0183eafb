//! Per-message pipeline: decode, authenticate, transform, dispatch
//!
//! Every inbound message is handled on its own. A failure at any step drops
//! that message with a [`DropReason`] and leaves the forwarder ready for the
//! next one; nothing is queued or retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::credential::{AuthError, CredentialCache};
use crate::localization::{DispatchError, LocalizationRecord, LocalizationSink};
use crate::motion::{MotionConfig, MotionState, MotionTracker};
use crate::sample::{DecodeError, SourceAdapter, TransformedPosition};
use crate::transform::AffineCoefficients;

/// Forwarder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Destination sectors; each message is posted once per sector
    pub sector_ids: Vec<i64>,
    /// Reporting interval written into every record (ms)
    pub interval_ms: u32,
    /// Battery level used when the source reports none
    pub default_battery: u8,
    /// Acquire credentials but skip the POST
    pub dry_run: bool,
    /// Log one success line every N messages
    pub log_every_n: u64,
    /// Source identifier to destination login; empty means identity
    pub device_map: HashMap<String, String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            sector_ids: vec![1],
            interval_ms: 100,
            default_battery: 85,
            dry_run: false,
            log_every_n: 50,
            device_map: HashMap::new(),
        }
    }
}

/// What happened to one sector's POST
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryStatus {
    /// Endpoint answered with this 2xx status
    Accepted(u16),
    /// Dry run, nothing was sent
    DryRun,
    Failed(DispatchError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectorDelivery {
    pub sector_id: i64,
    pub status: DeliveryStatus,
}

/// Confirmation for a message that reached at least one sector
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// Identifier as found in the payload
    pub device_id: String,
    /// Login the credential was issued for
    pub device_login: String,
    pub position: TransformedPosition,
    pub motion: MotionState,
    pub deliveries: Vec<SectorDelivery>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Decode(DecodeError),
    /// Device map is configured and has no entry for this identifier
    UnmappedDevice(String),
    Auth(AuthError),
    /// Every sector failed
    Dispatch(Vec<(i64, DispatchError)>),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Decode(e) => write!(f, "decode: {}", e),
            DropReason::UnmappedDevice(id) => write!(f, "unmapped device '{}'", id),
            DropReason::Auth(e) => write!(f, "auth: {}", e),
            DropReason::Dispatch(errors) => {
                write!(f, "dispatch failed for {} sector(s)", errors.len())?;
                if let Some((sector, e)) = errors.first() {
                    write!(f, ", sector {}: {}", sector, e)?;
                }
                Ok(())
            }
        }
    }
}

/// Result of handling one message
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Dispatched(DispatchReport),
    Dropped(DropReason),
}

impl Outcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Outcome::Dispatched(_))
    }

    pub fn drop_reason(&self) -> Option<&DropReason> {
        match self {
            Outcome::Dropped(reason) => Some(reason),
            Outcome::Dispatched(_) => None,
        }
    }
}

/// Running message counters
#[derive(Debug, Default)]
pub struct ForwarderStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// Point-in-time copy of [`ForwarderStats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub failed_deliveries: u64,
}

impl StatsSnapshot {
    /// Percentage of received messages that were dispatched
    pub fn success_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.dispatched as f64 * 100.0 / self.received as f64
        }
    }
}

impl ForwarderStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// The bridging pipeline
pub struct Forwarder {
    adapter: SourceAdapter,
    transform: AffineCoefficients,
    credentials: Arc<CredentialCache>,
    sink: Arc<dyn LocalizationSink>,
    motion: Mutex<MotionTracker>,
    clock: Arc<dyn Clock>,
    config: ForwarderConfig,
    stats: Arc<ForwarderStats>,
}

impl Forwarder {
    pub fn new(
        adapter: SourceAdapter,
        transform: AffineCoefficients,
        credentials: Arc<CredentialCache>,
        sink: Arc<dyn LocalizationSink>,
        motion: MotionConfig,
        clock: Arc<dyn Clock>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            adapter,
            transform,
            credentials,
            sink,
            motion: Mutex::new(MotionTracker::new(motion)),
            clock,
            config,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    /// Run one raw payload through the pipeline
    ///
    /// Never fails: every problem becomes an [`Outcome::Dropped`] and is
    /// logged here.
    pub async fn handle_message(&self, payload: &[u8], topic: &str) -> Outcome {
        let seq = self.stats.received.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = self.process(payload, topic, seq).await;
        match &outcome {
            Outcome::Dispatched(_) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Dropped(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    async fn process(&self, payload: &[u8], topic: &str, seq: u64) -> Outcome {
        let now = self.clock.now_millis();
        let sample = match self.adapter.decode(payload, now) {
            Ok(sample) => sample,
            Err(e) => {
                debug!(topic = %topic, error = %e, "Discarding undecodable message");
                return Outcome::Dropped(DropReason::Decode(e));
            }
        };

        let device_login = if self.config.device_map.is_empty() {
            sample.device_id.clone()
        } else {
            match self.config.device_map.get(&sample.device_id) {
                Some(login) => login.clone(),
                None => {
                    debug!(device = %sample.device_id, "No device mapping, discarding");
                    return Outcome::Dropped(DropReason::UnmappedDevice(sample.device_id));
                }
            }
        };

        let credential = match self.credentials.get_credential(&device_login).await {
            Ok(cred) => cred,
            Err(e) => {
                warn!(device = %device_login, error = %e, "Authentication failed, dropping message");
                return Outcome::Dropped(DropReason::Auth(e));
            }
        };

        let position = sample.transformed(&self.transform);
        let motion = self
            .motion
            .lock()
            .await
            .observe(&device_login, position.x, position.y, now);

        let should_log = seq % self.config.log_every_n.max(1) == 0;
        let mut deliveries = Vec::with_capacity(self.config.sector_ids.len());
        // Set once the endpoint refuses the token; later sectors are not posted
        let mut token_rejected: Option<DispatchError> = None;
        for &sector_id in &self.config.sector_ids {
            let record = LocalizationRecord::from_position(
                &position,
                sector_id,
                self.config.interval_ms,
                self.config.default_battery,
                motion,
            );

            if self.config.dry_run {
                if should_log {
                    info!(
                        device = %device_login,
                        sector = sector_id,
                        payload = %serde_json::to_string(&record).unwrap_or_default(),
                        "Dry run, not sending"
                    );
                }
                deliveries.push(SectorDelivery {
                    sector_id,
                    status: DeliveryStatus::DryRun,
                });
                continue;
            }

            if let Some(e) = &token_rejected {
                self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                deliveries.push(SectorDelivery {
                    sector_id,
                    status: DeliveryStatus::Failed(e.clone()),
                });
                continue;
            }

            let status = match self
                .sink
                .post_localization(&credential, std::slice::from_ref(&record))
                .await
            {
                Ok(code) => {
                    if should_log {
                        info!(
                            device = %device_login,
                            sector = sector_id,
                            x = position.x,
                            y = position.y,
                            moving = motion.is_moving(),
                            messages = seq,
                            "Sent localization"
                        );
                    }
                    DeliveryStatus::Accepted(code)
                }
                Err(e) => {
                    self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    warn!(device = %device_login, sector = sector_id, error = %e, "Localization dispatch failed");
                    if e.is_unauthorized() {
                        if self.credentials.invalidate(&device_login).await {
                            debug!(device = %device_login, "Evicted rejected credential");
                        }
                        token_rejected = Some(e.clone());
                    }
                    DeliveryStatus::Failed(e)
                }
            };
            deliveries.push(SectorDelivery { sector_id, status });
        }

        let failures: Vec<(i64, DispatchError)> = deliveries
            .iter()
            .filter_map(|d| match &d.status {
                DeliveryStatus::Failed(e) => Some((d.sector_id, e.clone())),
                _ => None,
            })
            .collect();
        if !deliveries.is_empty() && failures.len() == deliveries.len() {
            return Outcome::Dropped(DropReason::Dispatch(failures));
        }

        Outcome::Dispatched(DispatchReport {
            device_id: sample.device_id,
            device_login,
            position,
            motion,
            deliveries,
        })
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("adapter", &self.adapter.name())
            .field("transform", &self.transform)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
