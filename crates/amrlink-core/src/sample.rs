//! Inbound telemetry decoding
//!
//! Robot fleets publish positions in one of two recurring shapes:
//!
//! - **Array pose**: `{"sherpa_name": "tug-55", "battery_status": 85.2, "pose": [x, y, z, roll, pitch, yaw]}`
//! - **Object pose**: `{"device_id": "tugger-01", "battery": 80, "pose": {"x": 1.0, "y": 2.0, "z": 0.0, "theta": 0.0}}`
//!
//! A [`SourceAdapter`] selects the shape and carries the field names to
//! look up, so one forwarder serves every feed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::transform::AffineCoefficients;

/// Values below this are treated as epoch seconds rather than milliseconds
const EPOCH_MILLIS_FLOOR: f64 = 1e11;

/// Object-pose feeds that predate the `pose` field nest coordinates here
const POSITION_FIELD: &str = "position";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("No device identifier in payload")]
    MissingIdentifier,
    #[error("No usable pose: {0}")]
    MissingPose(String),
}

/// One inbound position report, in source coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Heading in radians
    pub heading: f64,
    /// Battery percentage, when the source reports one
    pub battery_level: Option<f64>,
    /// Epoch milliseconds (source-provided or receipt time)
    pub timestamp: i64,
    /// Operating mode string, when the source reports one
    pub mode: Option<String>,
}

/// A sample after the affine map, in destination coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedPosition {
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading: f64,
    pub battery_level: Option<f64>,
    pub timestamp: i64,
    pub mode: Option<String>,
}

impl PositionSample {
    /// Apply the affine map to `x`/`y`; everything else passes through
    pub fn transformed(&self, coefficients: &AffineCoefficients) -> TransformedPosition {
        let (x, y) = coefficients.transform(self.x, self.y);
        TransformedPosition {
            device_id: self.device_id.clone(),
            x,
            y,
            z: self.z,
            heading: self.heading,
            battery_level: self.battery_level,
            timestamp: self.timestamp,
            mode: self.mode.clone(),
        }
    }
}

/// Field names looked up in an inbound payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    /// Identifier fields, tried in order; the first non-empty one wins
    pub id_fields: Vec<String>,
    /// Field holding the pose (array or object)
    pub pose_field: String,
    /// Battery fields, tried in order
    pub battery_fields: Vec<String>,
    /// Field holding a source timestamp
    pub timestamp_field: String,
    /// Field holding the operating mode
    pub mode_field: String,
}

impl FieldMap {
    /// Field names used by array-pose fleet feeds
    pub fn array_defaults() -> Self {
        Self {
            id_fields: vec!["sherpa_name".to_string()],
            pose_field: "pose".to_string(),
            battery_fields: vec!["battery_status".to_string()],
            timestamp_field: "timestamp".to_string(),
            mode_field: "mode".to_string(),
        }
    }

    /// Field names used by object-pose feeds
    pub fn object_defaults() -> Self {
        Self {
            id_fields: vec![
                "device_id".to_string(),
                "amr_id".to_string(),
                "id".to_string(),
            ],
            pose_field: "pose".to_string(),
            battery_fields: vec!["battery".to_string(), "battery_level".to_string()],
            timestamp_field: "timestamp".to_string(),
            mode_field: "mode".to_string(),
        }
    }
}

/// Pose extraction strategy for one inbound feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum SourceAdapter {
    /// `pose: [x, y, z, roll, pitch, yaw]`
    ArrayPose(FieldMap),
    /// `pose: {x, y, z, theta}`
    ObjectPose(FieldMap),
}

impl SourceAdapter {
    pub fn array_pose() -> Self {
        Self::ArrayPose(FieldMap::array_defaults())
    }

    pub fn object_pose() -> Self {
        Self::ObjectPose(FieldMap::object_defaults())
    }

    pub fn fields(&self) -> &FieldMap {
        match self {
            Self::ArrayPose(fields) | Self::ObjectPose(fields) => fields,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ArrayPose(_) => "array",
            Self::ObjectPose(_) => "object",
        }
    }

    /// Decode one raw payload into a [`PositionSample`]
    ///
    /// `received_at` is used as the timestamp when the payload carries none.
    pub fn decode(&self, payload: &[u8], received_at: i64) -> Result<PositionSample, DecodeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;
        let fields = self.fields();

        let device_id = fields
            .id_fields
            .iter()
            .find_map(|name| identifier(obj.get(name)?))
            .ok_or(DecodeError::MissingIdentifier)?;

        let (x, y, z, heading) = match self {
            Self::ArrayPose(_) => array_pose(obj.get(&fields.pose_field))?,
            Self::ObjectPose(_) => match obj
                .get(&fields.pose_field)
                .or_else(|| obj.get(POSITION_FIELD))
            {
                Some(pose) => {
                    let pose = pose.as_object().ok_or_else(|| {
                        DecodeError::MissingPose(format!("'{}' is not an object", fields.pose_field))
                    })?;
                    object_pose(pose)?
                }
                // Flat feeds put x/y at the top level
                None => object_pose(obj)?,
            },
        };

        let battery_level = fields
            .battery_fields
            .iter()
            .find_map(|name| number(obj.get(name)?));

        let timestamp = obj
            .get(&fields.timestamp_field)
            .and_then(number)
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|t| {
                if t < EPOCH_MILLIS_FLOOR {
                    (t * 1000.0) as i64
                } else {
                    t as i64
                }
            })
            .unwrap_or(received_at);

        let mode = obj
            .get(&fields.mode_field)
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(PositionSample {
            device_id,
            x,
            y,
            z,
            heading,
            battery_level,
            timestamp,
            mode,
        })
    }
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers may arrive as JSON numbers or numeric strings; only finite values count
fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn array_pose(value: Option<&Value>) -> Result<(f64, f64, f64, f64), DecodeError> {
    let items = value
        .and_then(Value::as_array)
        .ok_or_else(|| DecodeError::MissingPose("expected a pose array".to_string()))?;
    if items.len() < 3 {
        return Err(DecodeError::MissingPose(format!(
            "pose array has {} elements, need at least 3",
            items.len()
        )));
    }

    let mut coords = [0.0f64; 3];
    for (i, slot) in coords.iter_mut().enumerate() {
        *slot = number(&items[i])
            .ok_or_else(|| DecodeError::MissingPose(format!("pose[{}] is not a number", i)))?;
    }
    // Yaw sits at index 5 of [x, y, z, roll, pitch, yaw]
    let heading = items.get(5).and_then(number).unwrap_or(0.0);

    Ok((coords[0], coords[1], coords[2], heading))
}

fn object_pose(pose: &Map<String, Value>) -> Result<(f64, f64, f64, f64), DecodeError> {
    let x = pose
        .get("x")
        .and_then(number)
        .ok_or_else(|| DecodeError::MissingPose("missing numeric 'x'".to_string()))?;
    let y = pose
        .get("y")
        .and_then(number)
        .ok_or_else(|| DecodeError::MissingPose("missing numeric 'y'".to_string()))?;
    let z = pose.get("z").and_then(number).unwrap_or(0.0);
    let heading = ["theta", "heading", "yaw"]
        .iter()
        .find_map(|k| pose.get(*k).and_then(number))
        .unwrap_or(0.0);

    Ok((x, y, z, heading))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_decode_array_pose() {
        let payload = br#"{"sherpa_name":"tug-55","mode":"fleet","battery_status":85.2,"pose":[1.5,2.5,0.1,0.0,0.0,1.57]}"#;
        let sample = SourceAdapter::array_pose().decode(payload, NOW).unwrap();

        assert_eq!(sample.device_id, "tug-55");
        assert_eq!((sample.x, sample.y, sample.z), (1.5, 2.5, 0.1));
        assert_eq!(sample.heading, 1.57);
        assert_eq!(sample.battery_level, Some(85.2));
        assert_eq!(sample.mode.as_deref(), Some("fleet"));
        assert_eq!(sample.timestamp, NOW);
    }

    #[test]
    fn test_decode_object_pose() {
        let payload = br#"{"device_id":"tugger-01","pose":{"x":10,"y":20,"z":0,"theta":0.5},"battery":80}"#;
        let sample = SourceAdapter::object_pose().decode(payload, NOW).unwrap();

        assert_eq!(sample.device_id, "tugger-01");
        assert_eq!((sample.x, sample.y, sample.z), (10.0, 20.0, 0.0));
        assert_eq!(sample.heading, 0.5);
        assert_eq!(sample.battery_level, Some(80.0));
        assert!(sample.mode.is_none());
    }

    #[test]
    fn test_object_pose_identifier_fallbacks() {
        let adapter = SourceAdapter::object_pose();
        let sample = adapter
            .decode(br#"{"amr_id":"hitech_amr_001","pose":{"x":1,"y":2}}"#, NOW)
            .unwrap();
        assert_eq!(sample.device_id, "hitech_amr_001");

        let sample = adapter.decode(br#"{"id":7,"pose":{"x":1,"y":2}}"#, NOW).unwrap();
        assert_eq!(sample.device_id, "7");
    }

    #[test]
    fn test_object_pose_flat_coordinates() {
        let payload = br#"{"device_id":"hitech_amr_002","x":"4.5","y":6,"battery":"77"}"#;
        let sample = SourceAdapter::object_pose().decode(payload, NOW).unwrap();
        assert_eq!((sample.x, sample.y, sample.z), (4.5, 6.0, 0.0));
        assert_eq!(sample.battery_level, Some(77.0));
    }

    #[test]
    fn test_object_pose_position_field() {
        let payload = br#"{"device_id":"tugger-03","position":{"x":7,"y":8,"z":0.5}}"#;
        let sample = SourceAdapter::object_pose().decode(payload, NOW).unwrap();
        assert_eq!((sample.x, sample.y, sample.z), (7.0, 8.0, 0.5));
    }

    #[test]
    fn test_missing_identifier() {
        let adapter = SourceAdapter::object_pose();
        assert_eq!(
            adapter.decode(br#"{"pose":{"x":1,"y":2}}"#, NOW),
            Err(DecodeError::MissingIdentifier)
        );
        assert_eq!(
            adapter.decode(br#"{"device_id":"  ","pose":{"x":1,"y":2}}"#, NOW),
            Err(DecodeError::MissingIdentifier)
        );
    }

    #[test]
    fn test_invalid_json_and_non_object() {
        let adapter = SourceAdapter::array_pose();
        assert!(matches!(adapter.decode(b"{not json", NOW), Err(DecodeError::InvalidJson(_))));
        assert_eq!(adapter.decode(b"[1,2,3]", NOW), Err(DecodeError::NotAnObject));
    }

    #[test]
    fn test_non_finite_coordinates_rejected() {
        let adapter = SourceAdapter::object_pose();
        for payload in [
            &br#"{"device_id":"a","pose":{"x":"NaN","y":2}}"#[..],
            &br#"{"device_id":"a","pose":{"x":"inf","y":2}}"#[..],
            &br#"{"device_id":"a","pose":{"x":1,"y":"-infinity"}}"#[..],
        ] {
            assert!(matches!(
                adapter.decode(payload, NOW),
                Err(DecodeError::MissingPose(_))
            ));
        }

        let err = SourceAdapter::array_pose()
            .decode(br#"{"sherpa_name":"tug-55","pose":["NaN",2.0,0.0]}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MissingPose(_)));
    }

    #[test]
    fn test_non_finite_optional_fields_ignored() {
        let sample = SourceAdapter::object_pose()
            .decode(br#"{"device_id":"a","pose":{"x":1,"y":2,"z":"inf","theta":"NaN"},"battery":"NaN"}"#, NOW)
            .unwrap();
        assert_eq!((sample.z, sample.heading), (0.0, 0.0));
        assert!(sample.battery_level.is_none());
    }

    #[test]
    fn test_short_pose_array_rejected() {
        let err = SourceAdapter::array_pose()
            .decode(br#"{"sherpa_name":"tug-55","pose":[1.0,2.0]}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MissingPose(_)));
    }

    #[test]
    fn test_three_element_pose_has_zero_heading() {
        let sample = SourceAdapter::array_pose()
            .decode(br#"{"sherpa_name":"tug-55","pose":[1.0,2.0,3.0]}"#, NOW)
            .unwrap();
        assert_eq!(sample.heading, 0.0);
        assert!(sample.battery_level.is_none());
    }

    #[test]
    fn test_array_adapter_rejects_object_pose() {
        let err = SourceAdapter::array_pose()
            .decode(br#"{"sherpa_name":"tug-55","pose":{"x":1,"y":2}}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MissingPose(_)));
    }

    #[test]
    fn test_source_timestamp_seconds_and_millis() {
        let adapter = SourceAdapter::object_pose();
        let sample = adapter
            .decode(br#"{"device_id":"a","x":0,"y":0,"timestamp":1700000001.5}"#, NOW)
            .unwrap();
        assert_eq!(sample.timestamp, 1_700_000_001_500);

        let sample = adapter
            .decode(br#"{"device_id":"a","x":0,"y":0,"timestamp":1700000002000}"#, NOW)
            .unwrap();
        assert_eq!(sample.timestamp, 1_700_000_002_000);
    }

    #[test]
    fn test_transformed_passes_fields_through() {
        let sample = SourceAdapter::object_pose()
            .decode(br#"{"device_id":"tugger-01","pose":{"x":10,"y":20,"z":1.5,"theta":0.2},"battery":80}"#, NOW)
            .unwrap();
        let t = AffineCoefficients::new(2.0, 0.0, 0.0, 2.0, 100.0, 100.0);
        let out = sample.transformed(&t);

        assert_eq!((out.x, out.y), (120.0, 140.0));
        assert_eq!(out.z, 1.5);
        assert_eq!(out.heading, 0.2);
        assert_eq!(out.battery_level, Some(80.0));
        assert_eq!(out.device_id, "tugger-01");
    }

    #[test]
    fn test_adapter_serde_tagged() {
        let adapter: SourceAdapter = serde_json::from_str(
            r#"{"format":"array_pose","id_fields":["robot"],"pose_field":"p","battery_fields":[],"timestamp_field":"ts","mode_field":"m"}"#,
        )
        .unwrap();
        assert_eq!(adapter.name(), "array");
        assert_eq!(adapter.fields().id_fields, vec!["robot".to_string()]);
    }
}
