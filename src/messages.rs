// Shared value types for the runtime

use serde::{Deserialize, Serialize};

/// Triaxial measurement. Doubles as a raw ADC accumulation buffer during
/// calibration and as a physical-unit sample (g, deg/s, uT) afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Sample3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn add(&mut self, other: &Sample3) {
        self.x += other.x;
        self.y += other.y;
        self.z += other.z;
    }

    pub fn divide(&mut self, n: f64) {
        self.x /= n;
        self.y /= n;
        self.z /= n;
    }

    pub fn reset(&mut self) {
        self.x = 0.0;
        self.y = 0.0;
        self.z = 0.0;
    }

    /// Exact-zero test on all three axes. The fusion filter uses this to
    /// skip normalization of an absent measurement.
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// Orientation estimate published by the runtime loop, in degrees
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttitudeSnapshot {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Runtime lifecycle state published alongside attitude snapshots
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    #[default]
    Calibrating,
    Running,
    ShuttingDown,
}

/// Latest attitude plus runtime state, as seen on the telemetry channel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub attitude: AttitudeSnapshot,
    pub health: RuntimeHealth,
}
