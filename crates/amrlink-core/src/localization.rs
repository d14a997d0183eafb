//! Outbound localization records and the sink that accepts them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::DeviceCredential;
use crate::motion::MotionState;
use crate::sample::TransformedPosition;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Localization rejected: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Localization request failed: {0}")]
    Transport(String),
}

impl DispatchError {
    /// True when the endpoint refused the token itself
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, DispatchError::Rejected { status: 401 | 403, .. })
    }
}

/// One localization entry as the twin API expects it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalizationRecord {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub sector_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Reporting interval in milliseconds
    pub interval: u32,
    /// Battery percentage, 0..=100
    pub battery: u8,
    pub is_moving: bool,
    pub localization_areas: Vec<serde_json::Value>,
    pub no_go_areas: Vec<serde_json::Value>,
}

impl LocalizationRecord {
    /// Build a record for one sector
    ///
    /// `default_battery` fills in when the source reported no battery level.
    pub fn from_position(
        position: &TransformedPosition,
        sector_id: i64,
        interval: u32,
        default_battery: u8,
        motion: MotionState,
    ) -> Self {
        Self {
            timestamp: position.timestamp,
            sector_id,
            x: position.x,
            y: position.y,
            z: position.z,
            interval,
            battery: position
                .battery_level
                .filter(|b| b.is_finite())
                .map(|b| b.clamp(0.0, 100.0) as u8)
                .unwrap_or(default_battery.min(100)),
            is_moving: motion.is_moving(),
            localization_areas: Vec::new(),
            no_go_areas: Vec::new(),
        }
    }
}

/// The external localization endpoint
#[async_trait]
pub trait LocalizationSink: Send + Sync {
    /// Post records under `credential`, returning the HTTP status on success
    async fn post_localization(
        &self,
        credential: &DeviceCredential,
        records: &[LocalizationRecord],
    ) -> Result<u16, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(battery: Option<f64>) -> TransformedPosition {
        TransformedPosition {
            device_id: "tug-55".to_string(),
            x: 120.0,
            y: 140.0,
            z: 0.0,
            heading: 0.0,
            battery_level: battery,
            timestamp: 1_700_000_000_000,
            mode: None,
        }
    }

    #[test]
    fn test_record_wire_names() {
        let record =
            LocalizationRecord::from_position(&position(Some(80.0)), 1, 100, 85, MotionState::Moving);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["Timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["SectorId"], 1);
        assert_eq!(json["X"], 120.0);
        assert_eq!(json["Y"], 140.0);
        assert_eq!(json["Z"], 0.0);
        assert_eq!(json["Interval"], 100);
        assert_eq!(json["Battery"], 80);
        assert_eq!(json["IsMoving"], true);
        assert_eq!(json["LocalizationAreas"], serde_json::json!([]));
        assert_eq!(json["NoGoAreas"], serde_json::json!([]));
    }

    #[test]
    fn test_battery_default_clamp_and_truncate() {
        let rec = |b| LocalizationRecord::from_position(&position(b), 1, 100, 85, MotionState::Stationary);

        assert_eq!(rec(None).battery, 85);
        assert_eq!(rec(Some(85.9)).battery, 85);
        assert_eq!(rec(Some(140.0)).battery, 100);
        assert_eq!(rec(Some(-3.0)).battery, 0);
        assert_eq!(rec(Some(f64::NAN)).battery, 85);
        assert!(!rec(None).is_moving);
    }

    #[test]
    fn test_unauthorized_statuses() {
        let rejected = |status| DispatchError::Rejected {
            status,
            body: String::new(),
        };
        assert!(rejected(401).is_unauthorized());
        assert!(rejected(403).is_unauthorized());
        assert!(!rejected(500).is_unauthorized());
        assert!(!DispatchError::Transport("refused".to_string()).is_unauthorized());
    }
}
