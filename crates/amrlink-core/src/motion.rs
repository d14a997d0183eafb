//! Two-state movement inference
//!
//! A device is `Moving` when it has travelled further than a threshold
//! (in destination units) since its reference position. The reference is
//! replaced whenever the device moves, and also once the observation window
//! has elapsed since it was recorded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Stationary,
    Moving,
}

impl MotionState {
    pub fn is_moving(self) -> bool {
        self == MotionState::Moving
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Minimum distance to count as movement
    pub threshold: f64,
    /// Reference positions older than this are replaced
    pub window_ms: i64,
    /// Upper bound on tracked devices
    pub max_devices: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: 250.0,
            window_ms: 1000,
            max_devices: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reference {
    x: f64,
    y: f64,
    at_ms: i64,
}

/// Per-device reference positions
#[derive(Debug)]
pub struct MotionTracker {
    config: MotionConfig,
    last: HashMap<String, Reference>,
}

impl MotionTracker {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            last: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Record a position and classify it
    ///
    /// The first observation of a device is `Moving`.
    pub fn observe(&mut self, device_id: &str, x: f64, y: f64, now_ms: i64) -> MotionState {
        let threshold = self.config.threshold;
        let window_ms = self.config.window_ms;
        let Some(reference) = self.last.get_mut(device_id) else {
            self.insert(device_id, Reference { x, y, at_ms: now_ms });
            return MotionState::Moving;
        };

        let distance = (x - reference.x).hypot(y - reference.y);
        let moving = distance > threshold;
        if moving || now_ms - reference.at_ms > window_ms {
            *reference = Reference { x, y, at_ms: now_ms };
        }

        if moving {
            MotionState::Moving
        } else {
            MotionState::Stationary
        }
    }

    pub fn forget(&mut self, device_id: &str) -> bool {
        self.last.remove(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    fn insert(&mut self, device_id: &str, reference: Reference) {
        if self.last.len() >= self.config.max_devices.max(1) {
            let oldest = self
                .last
                .iter()
                .min_by_key(|(_, r)| r.at_ms)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                self.last.remove(&id);
            }
        }
        self.last.insert(device_id.to_string(), reference);
    }
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self::new(MotionConfig::default())
    }
}
