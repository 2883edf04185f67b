//! Fundamental types used across the entire workspace.

use nalgebra::{DMatrix, DVector, Matrix2, Matrix6, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Scalar type: f64 throughout for numerical precision in the Kalman filter.
// Units: mm (length), GeV (momentum), Tesla (field), ns (time).
// ---------------------------------------------------------------------------

/// Bound track-parameter vector: [loc0, loc1, phi, theta, q/p, t]
pub type BoundVector = Vector6<f64>;

/// 6×6 bound-parameter covariance matrix
pub type BoundCov = Matrix6<f64>;

/// Generic dynamic-size vector (measurement residuals, innovations)
pub type DVec = DVector<f64>;

/// Generic dynamic-size matrix (H, R, S — dimension depends on the sensor)
pub type DMat = DMatrix<f64>;

/// Bound-parameter component indices.
pub const E_LOC0: usize = 0;
pub const E_LOC1: usize = 1;
pub const E_PHI: usize = 2;
pub const E_THETA: usize = 3;
pub const E_QOP: usize = 4;
pub const E_TIME: usize = 5;

/// Speed of light in mm/ns.
pub const C_LIGHT: f64 = 299.792_458;

// ---------------------------------------------------------------------------
// Identifier types — newtype wrappers so IDs are never confused at compile time
// ---------------------------------------------------------------------------

/// Identifier of one sensor plane, packing (station, layer).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GeometryId(pub u32);

impl GeometryId {
    /// Station value reserved for the upstream reference surface.
    pub const REFERENCE_STATION: u16 = 0xFF;

    pub fn new(station: u16, layer: u16) -> Self {
        GeometryId(((station as u32) << 8) | (layer as u32 & 0xFF))
    }

    /// The shared upstream reference surface (seed anchor).
    pub fn reference() -> Self {
        Self::new(Self::REFERENCE_STATION, 0)
    }

    pub fn station(&self) -> u16 {
        (self.0 >> 8) as u16
    }

    pub fn layer(&self) -> u16 {
        (self.0 & 0xFF) as u16
    }

    pub fn is_reference(&self) -> bool {
        self.station() == Self::REFERENCE_STATION
    }
}

impl fmt::Display for GeometryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reference() {
            write!(f, "REF")
        } else {
            write!(f, "S{}L{}", self.station(), self.layer())
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TrackId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SourceLink — lightweight handle from a track state back to its measurement
// ---------------------------------------------------------------------------

/// (surface, measurement-index, originating cluster). Equality is defined by
/// (surface, index) only; the cluster id is carried for diagnostics.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SourceLink {
    pub geometry: GeometryId,
    pub index: usize,
    pub cluster: ClusterId,
}

impl PartialEq for SourceLink {
    fn eq(&self, other: &Self) -> bool {
        self.geometry == other.geometry && self.index == other.index
    }
}

impl Eq for SourceLink {}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// The calibrated local observation carried by a [`Measurement`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeasurementValue {
    /// 1-D strip measurement: loc0 on its (possibly stereo-rotated) surface.
    Strip { loc0: f64, var: f64 },
    /// 2-D pixel-like measurement: both local coordinates.
    Pixel {
        loc: Vector2<f64>,
        cov: Matrix2<f64>,
    },
}

/// A calibrated measurement on one sensor surface. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Measurement {
    /// Surface this measurement lives on
    pub geometry: GeometryId,
    /// Local position + covariance
    pub value: MeasurementValue,
    /// Back-reference to the raw cluster (for residual output)
    pub cluster: ClusterId,
}

impl Measurement {
    /// Dimension of the observation vector (1 strip, 2 pixel).
    pub fn dim(&self) -> usize {
        match &self.value {
            MeasurementValue::Strip { .. } => 1,
            MeasurementValue::Pixel { .. } => 2,
        }
    }

    /// Observation vector z.
    pub fn z_vector(&self) -> DVec {
        match &self.value {
            MeasurementValue::Strip { loc0, .. } => DVector::from_vec(vec![*loc0]),
            MeasurementValue::Pixel { loc, .. } => DVector::from_vec(vec![loc.x, loc.y]),
        }
    }

    /// Measurement noise covariance R.
    pub fn r_matrix(&self) -> DMat {
        match &self.value {
            MeasurementValue::Strip { var, .. } => DMatrix::from_element(1, 1, *var),
            MeasurementValue::Pixel { cov, .. } => {
                DMatrix::from_row_slice(2, 2, &[cov.m11, cov.m12, cov.m21, cov.m22])
            }
        }
    }

    /// Projection matrix H mapping bound parameters to the observation.
    /// Local coordinates already live in the surface frame, so H just selects
    /// loc0 (and loc1 for pixels).
    pub fn h_matrix(&self) -> DMat {
        match &self.value {
            MeasurementValue::Strip { .. } => {
                DMatrix::from_row_slice(1, 6, &[1., 0., 0., 0., 0., 0.])
            }
            MeasurementValue::Pixel { .. } => DMatrix::from_row_slice(
                2,
                6,
                &[1., 0., 0., 0., 0., 0., 0., 1., 0., 0., 0., 0.],
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// MeasurementContainer — per-event, built once, then only read
// ---------------------------------------------------------------------------

/// Owns all calibrated measurements of one event plus a per-surface index.
#[derive(Clone, Debug, Default)]
pub struct MeasurementContainer {
    measurements: Vec<Measurement>,
    source_links: Vec<SourceLink>,
    by_surface: HashMap<GeometryId, Vec<usize>>,
}

impl MeasurementContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a measurement, returning its stable index.
    pub fn push(&mut self, measurement: Measurement) -> usize {
        let index = self.measurements.len();
        let link = SourceLink {
            geometry: measurement.geometry,
            index,
            cluster: measurement.cluster,
        };
        self.by_surface
            .entry(measurement.geometry)
            .or_default()
            .push(index);
        self.measurements.push(measurement);
        self.source_links.push(link);
        index
    }

    pub fn get(&self, index: usize) -> &Measurement {
        &self.measurements[index]
    }

    pub fn source_link(&self, index: usize) -> SourceLink {
        self.source_links[index]
    }

    /// Indices of all measurements on one surface (empty slice if none).
    pub fn on_surface(&self, id: GeometryId) -> &[usize] {
        self.by_surface.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Bound track parameters
// ---------------------------------------------------------------------------

/// Propagation direction along the beam axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropDirection {
    Forward,
    Backward,
}

impl PropDirection {
    pub fn sign(&self) -> f64 {
        match self {
            PropDirection::Forward => 1.0,
            PropDirection::Backward => -1.0,
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            PropDirection::Forward => PropDirection::Backward,
            PropDirection::Backward => PropDirection::Forward,
        }
    }
}

/// Bound parameters: a 6-component state tied to a reference surface, with an
/// optional covariance. The charge is encoded in the sign of q/p.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundParameters {
    pub surface: GeometryId,
    pub vector: BoundVector,
    pub covariance: Option<BoundCov>,
}

impl BoundParameters {
    pub fn new(surface: GeometryId, vector: BoundVector, covariance: Option<BoundCov>) -> Self {
        Self {
            surface,
            vector,
            covariance,
        }
    }

    pub fn loc0(&self) -> f64 {
        self.vector[E_LOC0]
    }

    pub fn loc1(&self) -> f64 {
        self.vector[E_LOC1]
    }

    pub fn phi(&self) -> f64 {
        self.vector[E_PHI]
    }

    pub fn theta(&self) -> f64 {
        self.vector[E_THETA]
    }

    pub fn qop(&self) -> f64 {
        self.vector[E_QOP]
    }

    pub fn time(&self) -> f64 {
        self.vector[E_TIME]
    }

    /// Unit direction vector from (phi, theta).
    pub fn direction(&self) -> Vector3<f64> {
        let (sp, cp) = self.phi().sin_cos();
        let (st, ct) = self.theta().sin_cos();
        Vector3::new(st * cp, st * sp, ct)
    }

    /// Momentum magnitude |p| = 1/|q/p|.
    pub fn momentum(&self) -> f64 {
        1.0 / self.qop().abs()
    }

    /// Signed charge (±1) from the sign of q/p.
    pub fn charge(&self) -> f64 {
        self.qop().signum()
    }

    /// Fail fast on a q/p of exactly zero or any non-finite component.
    pub fn validate(&self) -> Result<(), crate::error::FitError> {
        let qop = self.qop();
        if qop == 0.0 || !qop.is_finite() {
            return Err(crate::error::FitError::InvalidQop(qop));
        }
        if self.vector.iter().any(|v| !v.is_finite()) {
            return Err(crate::error::FitError::InvalidQop(qop));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventContext — per-event handle replacing any static counters
// ---------------------------------------------------------------------------

/// Read-only per-event context threaded through seeding, finding and
/// selection. Carries the measurement-space size so shared-hit bitsets can be
/// sized without global state.
#[derive(Clone, Copy, Debug)]
pub struct EventContext {
    pub event_number: u64,
    pub n_measurements: usize,
}

impl EventContext {
    pub fn new(event_number: u64, n_measurements: usize) -> Self {
        Self {
            event_number,
            n_measurements,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
