//! Output assembly: converts selected tracks into the persistence
//! representation with residuals and pulls per state.
//!
//! Residuals are `calibrated − H·smoothed`; pulls are normalized by
//! `sqrt(R − H·P_smoothed·Hᵀ)`, the unbiased convention for smoothed states.
//! A non-positive variance under the square root yields no pull rather than a
//! NaN.

use crate::error::{ConfigError, FitError};
use crate::geometry::TrackingGeometry;
use crate::propagator::Propagator;
use crate::track::{StateType, Track};
use crate::types::{
    BoundParameters, BoundVector, GeometryId, MeasurementContainer, PropDirection, TrackId,
};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Tracks below this measurement count are dropped (recoverable)
    pub min_measurements: usize,
    /// Attach fitted parameters at this surface as an extra hole-typed state
    pub reference_surface: Option<GeometryId>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_measurements: 12,
            reference_surface: Some(GeometryId::reference()),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence representation
// ---------------------------------------------------------------------------

/// One fitted state of an output track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FittedState {
    pub geometry: GeometryId,
    pub state_type: StateType,
    /// Best (smoothed where available) bound parameters at this surface
    pub parameters: BoundVector,
    /// Local position on the surface
    pub local: [f64; 2],
    /// Global position of the state
    pub global: [f64; 3],
    /// Measurement residual per observation dimension (None for holes)
    pub residual: Option<Vec<f64>>,
    /// Covariance-normalized pull per dimension (None when not computable)
    pub pull: Option<Vec<f64>>,
    pub chi2: f64,
}

/// Summary block of one output track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackSummary {
    pub id: TrackId,
    pub n_measurements: usize,
    pub n_outliers: usize,
    pub n_holes: usize,
    pub chi2: f64,
    pub ndf: usize,
    pub momentum: f64,
    pub charge: f64,
}

/// Output representation of one selected, smoothed track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FittedTrack {
    pub summary: TrackSummary,
    pub states: Vec<FittedState>,
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

pub struct OutputAssembler {
    pub config: OutputConfig,
    pub propagator: Propagator,
}

impl OutputAssembler {
    pub fn new(config: OutputConfig, propagator: Propagator) -> Self {
        Self { config, propagator }
    }

    /// Convert the selected tracks. An unknown reference surface is a
    /// configuration error; a track with too few measurements is dropped with
    /// a debug log, not an error.
    pub fn assemble(
        &self,
        geometry: &TrackingGeometry,
        tracks: &[Track],
        container: &MeasurementContainer,
    ) -> Result<Vec<FittedTrack>, ConfigError> {
        if let Some(ref_id) = self.config.reference_surface {
            geometry.require(ref_id)?;
        }

        let mut out = Vec::with_capacity(tracks.len());
        for (n, track) in tracks.iter().enumerate() {
            match self.assemble_one(geometry, track, container, TrackId(n as u64)) {
                Ok(fitted) => out.push(fitted),
                Err(err) => debug!(track = n, %err, "track dropped at output"),
            }
        }
        Ok(out)
    }

    fn assemble_one(
        &self,
        geometry: &TrackingGeometry,
        track: &Track,
        container: &MeasurementContainer,
        id: TrackId,
    ) -> Result<FittedTrack, FitError> {
        if track.states.is_empty() {
            return Err(FitError::EmptyTrack);
        }
        if track.n_measurements < self.config.min_measurements {
            return Err(FitError::TooFewMeasurements {
                got: track.n_measurements,
                need: self.config.min_measurements,
            });
        }

        let mut states = Vec::with_capacity(track.states.len() + 1);
        if let Some(state) = self.reference_state(geometry, track) {
            states.push(state);
        }

        for state in &track.states {
            let surface = geometry
                .surface(state.geometry)
                .ok_or(FitError::MissingSurface(state.geometry))?;
            let (vector, cov) = state.best();
            let local = Vector2::new(vector[0], vector[1]);
            let global = surface.local_to_global(&local);

            let (residual, pull) = match state.measurement {
                None => (None, None),
                Some(idx) => {
                    let m = container.get(idx);
                    let h = m.h_matrix();
                    let r = m.r_matrix();
                    let z = m.z_vector();
                    let x = crate::types::DVec::from_iterator(6, vector.iter().copied());
                    let res = &z - &h * &x;

                    let p_dyn =
                        crate::types::DMat::from_row_slice(6, 6, cov.as_slice());
                    let res_cov = &r - &h * &p_dyn * h.transpose();
                    let pulls: Vec<Option<f64>> = (0..res.len())
                        .map(|i| {
                            let var = res_cov[(i, i)];
                            (var > 0.0).then(|| res[i] / var.sqrt())
                        })
                        .collect();
                    let pull = pulls
                        .iter()
                        .all(Option::is_some)
                        .then(|| pulls.into_iter().flatten().collect());
                    (Some(res.iter().copied().collect()), pull)
                }
            };

            states.push(FittedState {
                geometry: state.geometry,
                state_type: state.state_type,
                parameters: *vector,
                local: [local.x, local.y],
                global: [global.x, global.y, global.z],
                residual,
                pull,
                chi2: state.chi2,
            });
        }

        let first = &track.states[0];
        let (best, _) = first.best();
        let qop = best[crate::types::E_QOP];
        Ok(FittedTrack {
            summary: TrackSummary {
                id,
                n_measurements: track.n_measurements,
                n_outliers: track.n_outliers,
                n_holes: track.n_holes,
                chi2: track.chi2,
                ndf: track.ndf,
                momentum: 1.0 / qop.abs().max(1e-12),
                charge: qop.signum(),
            },
            states,
        })
    }

    /// Fitted parameters at the configured external reference surface,
    /// attached as a hole-typed state so consumers can locate the track
    /// without re-propagating.
    fn reference_state(
        &self,
        geometry: &TrackingGeometry,
        track: &Track,
    ) -> Option<FittedState> {
        let ref_id = self.config.reference_surface?;
        let first = track.first_state()?;
        let target = geometry.surface(ref_id)?;
        let from = geometry.surface(first.geometry)?;
        let (vector, cov) = first.best();
        let params = BoundParameters::new(first.geometry, *vector, Some(*cov));

        let end = self
            .propagator
            .propagate(geometry, &params, from, target, PropDirection::Backward, None)
            .ok()?;
        let v = end.parameters.vector;
        let local = Vector2::new(v[0], v[1]);
        let global = target.local_to_global(&local);
        Some(FittedState {
            geometry: ref_id,
            state_type: StateType::Hole,
            parameters: v,
            local: [local.x, local.y],
            global: [global.x, global.y, global.z],
            residual: None,
            pull: None,
            chi2: 0.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
