//! amrlink Core - Credential cache, coordinate transform and forwarding pipeline
//!
//! This crate provides the bridging core between a robot fleet's telemetry
//! feed and a digital-twin localization API:
//! - Per-device credential cache with expiry-aware refresh
//! - Static 2D affine transform from robot to twin coordinates
//! - Source adapters that decode array-pose and object-pose payloads
//! - Two-state movement inference per device
//! - The per-message forwarder (decode, authenticate, transform, dispatch)
//!
//! HTTP access is abstracted behind [`IdentityProvider`] and
//! [`LocalizationSink`] so the pipeline can run against fakes.

pub mod clock;
pub mod credential;
pub mod forwarder;
pub mod localization;
pub mod motion;
pub mod sample;
pub mod transform;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{AuthError, CacheConfig, CredentialCache, DeviceCredential, IdentityProvider};
pub use forwarder::{
    DeliveryStatus, DispatchReport, DropReason, Forwarder, ForwarderConfig, ForwarderStats,
    Outcome, SectorDelivery, StatsSnapshot,
};
pub use localization::{DispatchError, LocalizationRecord, LocalizationSink};
pub use motion::{MotionConfig, MotionState, MotionTracker};
pub use sample::{DecodeError, FieldMap, PositionSample, SourceAdapter, TransformedPosition};
pub use transform::AffineCoefficients;
