//! Conditions / calibration read interface.
//!
//! An in-memory, versioned key-value store: entries are keyed by identifier
//! and valid over an event-number range. Missing *required* entries (field
//! scale, alignment for a known surface) are hard errors; missing DCS-style
//! channel flags fall back to "good" when the configuration allows it.
//! Numeric edge cases (zero depletion voltage, non-physical scale factors)
//! are logged as warnings and processing continues with best-effort values.

use crate::error::ConfigError;
use crate::types::GeometryId;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Inclusive event-number validity range of one conditions payload.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Validity {
    pub first_event: u64,
    pub last_event: u64,
}

impl Validity {
    pub fn covers(&self, event: u64) -> bool {
        event >= self.first_event && event <= self.last_event
    }

    pub fn always() -> Self {
        Self {
            first_event: 0,
            last_event: u64::MAX,
        }
    }
}

/// Rigid alignment correction for one surface.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AlignmentDelta {
    /// Translation of the surface center (mm)
    pub shift: [f64; 3],
    /// Small rotation about z (radians)
    pub rot_z: f64,
}

impl AlignmentDelta {
    pub fn shift_vector(&self) -> Vector3<f64> {
        Vector3::new(self.shift[0], self.shift[1], self.shift[2])
    }
}

/// Per-channel DCS-derived status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Good,
    Noisy,
    Dead,
}

/// Per-sensor electrical calibration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SensorCalibration {
    /// Depletion voltage (V); zero is suspicious but not fatal
    pub depletion_voltage: f64,
    /// Charge gain (arbitrary units, nominal 1.0)
    pub gain: f64,
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self {
            depletion_voltage: 150.0,
            gain: 1.0,
        }
    }
}

impl SensorCalibration {
    /// Warn on suspicious values; never aborts.
    pub fn validated(self, id: GeometryId) -> Self {
        if self.depletion_voltage == 0.0 {
            warn!(surface = %id, "depletion voltage of zero, using value as-is");
        }
        if self.gain <= 0.0 {
            warn!(surface = %id, gain = self.gain, "non-physical gain, using value as-is");
        }
        self
    }
}

/// The versioned conditions store for one job.
#[derive(Clone, Debug)]
pub struct ConditionsStore {
    field_scale: Vec<(Validity, f64)>,
    alignment: HashMap<GeometryId, AlignmentDelta>,
    channel_status: HashMap<GeometryId, ChannelStatus>,
    calibration: HashMap<GeometryId, SensorCalibration>,
    /// Treat a missing channel-status entry as Good
    pub default_good: bool,
}

impl Default for ConditionsStore {
    fn default() -> Self {
        Self {
            field_scale: vec![(Validity::always(), 1.0)],
            alignment: HashMap::new(),
            channel_status: HashMap::new(),
            calibration: HashMap::new(),
            default_good: true,
        }
    }
}

impl ConditionsStore {
    pub fn set_field_scale(&mut self, validity: Validity, scale: f64) {
        if scale <= 0.0 {
            warn!(scale, "non-physical field scale registered");
        }
        self.field_scale.push((validity, scale));
    }

    pub fn set_alignment(&mut self, id: GeometryId, delta: AlignmentDelta) {
        self.alignment.insert(id, delta);
    }

    pub fn set_channel_status(&mut self, id: GeometryId, status: ChannelStatus) {
        self.channel_status.insert(id, status);
    }

    pub fn set_calibration(&mut self, id: GeometryId, calib: SensorCalibration) {
        self.calibration.insert(id, calib.validated(id));
    }

    /// Field scale valid for `event`. A missing entry is a hard error.
    pub fn field_scale(&self, event: u64) -> Result<f64, ConfigError> {
        self.field_scale
            .iter()
            .rev()
            .find(|(v, _)| v.covers(event))
            .map(|(_, s)| *s)
            .ok_or(ConfigError::MissingConditions {
                key: "field_scale".into(),
                event,
            })
    }

    /// Alignment correction for a surface (identity if none registered).
    pub fn alignment(&self, id: GeometryId) -> AlignmentDelta {
        self.alignment.get(&id).copied().unwrap_or_default()
    }

    /// Channel usability. Missing entries default to good only when
    /// configured to; otherwise a missing entry is a hard error.
    pub fn channel_good(&self, id: GeometryId, event: u64) -> Result<bool, ConfigError> {
        match self.channel_status.get(&id) {
            Some(status) => Ok(*status != ChannelStatus::Dead),
            None if self.default_good => Ok(true),
            None => Err(ConfigError::MissingConditions {
                key: format!("channel_status/{id}"),
                event,
            }),
        }
    }

    pub fn calibration(&self, id: GeometryId) -> SensorCalibration {
        self.calibration.get(&id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_scale_picks_covering_validity() {
        let mut store = ConditionsStore::default();
        store.set_field_scale(
            Validity {
                first_event: 100,
                last_event: 200,
            },
            0.95,
        );
        assert_eq!(store.field_scale(150).unwrap(), 0.95);
        assert_eq!(store.field_scale(50).unwrap(), 1.0);
    }

    #[test]
    fn missing_channel_status_defaults_good() {
        let store = ConditionsStore::default();
        assert!(store.channel_good(GeometryId::new(0, 0), 1).unwrap());
    }

    #[test]
    fn missing_channel_status_hard_error_when_strict() {
        let mut store = ConditionsStore::default();
        store.default_good = false;
        assert!(store.channel_good(GeometryId::new(0, 0), 1).is_err());
    }

    #[test]
    fn dead_channel_reported_bad() {
        let mut store = ConditionsStore::default();
        let id = GeometryId::new(1, 2);
        store.set_channel_status(id, ChannelStatus::Dead);
        assert!(!store.channel_good(id, 1).unwrap());
    }
}
