//! Extrapolation engine: propagates bound parameters from surface to surface
//! through the magnetic field.
//!
//! # Design choices
//! - Adaptive-step 4th-order Runge-Kutta on the free state (position, unit
//!   direction, q/p): a full step is compared against two half steps and the
//!   step size shrinks/grows from the embedded error estimate.
//! - Covariance transport via a finite-difference bound-to-bound Jacobian:
//!   6 perturbed point propagations per surface pair. The Jacobian is also
//!   what the RTS smoother consumes.
//! - Material effects (multiple scattering, energy loss) are applied at the
//!   destination surface using its thickness in radiation lengths; both are
//!   toggles.
//! - Every failure mode (step budget, path limit, leaving the volume,
//!   degenerate direction) is a [`PropagationError`] value, never a panic.

use crate::error::PropagationError;
use crate::field::MagneticField;
use crate::geometry::{Surface, TrackingGeometry};
use crate::kalman::wrap_angle;
use crate::types::{
    BoundCov, BoundParameters, BoundVector, PropDirection, C_LIGHT, E_LOC0, E_LOC1, E_PHI, E_QOP,
    E_THETA, E_TIME,
};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Curvature constant: du/ds = (q/p) · K · (u × B), with s in mm, B in Tesla
/// and p in GeV.
pub const K_CURVATURE: f64 = 2.997_924_58e-4;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PropagatorConfig {
    /// Largest allowed RK step (mm)
    pub max_step: f64,
    /// Smallest step before the remainder is taken linearly (mm)
    pub min_step: f64,
    /// Hard cap on RK steps per surface-to-surface propagation
    pub max_steps: usize,
    /// Local error tolerance on the embedded step estimate (mm)
    pub tolerance: f64,
    /// Default path-length limit when the caller passes none (mm)
    pub default_path_limit: f64,
    /// Apply Highland multiple-scattering noise at each surface
    pub multiple_scattering: bool,
    /// Apply mean energy loss at each surface
    pub energy_loss: bool,
    /// Mean energy loss per unit x/X0 (GeV)
    pub energy_loss_per_x0: f64,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            max_step: 50.0,
            min_step: 1e-3,
            max_steps: 10_000,
            tolerance: 1e-6,
            default_path_limit: 1e5,
            multiple_scattering: true,
            energy_loss: true,
            energy_loss_per_x0: 0.036,
        }
    }
}

/// One entry of the optional stepping log.
#[derive(Clone, Copy, Debug)]
pub struct StepRecord {
    pub path: f64,
    pub position: Vector3<f64>,
    pub step: f64,
}

/// Result of a successful propagation.
#[derive(Clone, Debug)]
pub struct EndParameters {
    pub parameters: BoundParameters,
    /// Bound-to-bound transport Jacobian (identity when no covariance was
    /// requested)
    pub jacobian: BoundCov,
}

// ---------------------------------------------------------------------------
// Free-state helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct FreeState {
    position: Vector3<f64>,
    direction: Vector3<f64>,
    qop: f64,
    time: f64,
    path: f64,
}

fn bound_to_free(surface: &Surface, vector: &BoundVector) -> FreeState {
    let local = Vector2::new(vector[E_LOC0], vector[E_LOC1]);
    let (sp, cp) = vector[E_PHI].sin_cos();
    let (st, ct) = vector[E_THETA].sin_cos();
    FreeState {
        position: surface.local_to_global(&local),
        direction: Vector3::new(st * cp, st * sp, ct),
        qop: vector[E_QOP],
        time: vector[E_TIME],
        path: 0.0,
    }
}

fn free_to_bound(surface: &Surface, state: &FreeState) -> BoundVector {
    let local = surface.global_to_local(&state.position);
    let dir = state.direction;
    let mut v = BoundVector::zeros();
    v[E_LOC0] = local.x;
    v[E_LOC1] = local.y;
    v[E_PHI] = wrap_angle(dir.y.atan2(dir.x));
    v[E_THETA] = dir.z.clamp(-1.0, 1.0).acos();
    v[E_QOP] = state.qop;
    v[E_TIME] = state.time;
    v
}

// ---------------------------------------------------------------------------
// Propagator
// ---------------------------------------------------------------------------

/// Field integrator shared by seeding-to-target extrapolation, the CKF
/// forward/backward passes and reference-surface attachment.
#[derive(Clone, Debug)]
pub struct Propagator {
    pub field: MagneticField,
    pub config: PropagatorConfig,
}

impl Propagator {
    pub fn new(field: MagneticField, config: PropagatorConfig) -> Self {
        Self { field, config }
    }

    /// Propagate bound parameters from their surface to `target`.
    ///
    /// Covariance (and the transport Jacobian) are computed only when the
    /// start parameters carry a covariance.
    pub fn propagate(
        &self,
        geometry: &TrackingGeometry,
        start: &BoundParameters,
        start_surface: &Surface,
        target: &Surface,
        direction: PropDirection,
        path_limit: Option<f64>,
    ) -> Result<EndParameters, PropagationError> {
        let limit = path_limit.unwrap_or(self.config.default_path_limit);

        let end_vector =
            self.propagate_point(geometry, start_surface, &start.vector, target, direction, limit, None)?;

        let (covariance, jacobian) = match &start.covariance {
            None => (None, BoundCov::identity()),
            Some(cov) => {
                let jac = self.numeric_jacobian(
                    geometry,
                    start_surface,
                    &start.vector,
                    &end_vector,
                    target,
                    direction,
                    limit,
                )?;
                let mut transported = jac * cov * jac.transpose();
                self.apply_material(&mut transported, &end_vector, target, direction);
                (Some(transported), jac)
            }
        };

        let mut vector = end_vector;
        if self.config.energy_loss {
            vector[E_QOP] = self.energy_loss_qop(vector[E_QOP], target, direction)?;
        }

        Ok(EndParameters {
            parameters: BoundParameters::new(target.id, vector, covariance),
            jacobian,
        })
    }

    /// Same as [`propagate`](Self::propagate) but collecting a stepping log
    /// for diagnostics.
    pub fn propagate_logged(
        &self,
        geometry: &TrackingGeometry,
        start: &BoundParameters,
        start_surface: &Surface,
        target: &Surface,
        direction: PropDirection,
    ) -> Result<(EndParameters, Vec<StepRecord>), PropagationError> {
        let mut log = Vec::new();
        let end_vector = self.propagate_point(
            geometry,
            start_surface,
            &start.vector,
            target,
            direction,
            self.config.default_path_limit,
            Some(&mut log),
        )?;
        Ok((
            EndParameters {
                parameters: BoundParameters::new(target.id, end_vector, None),
                jacobian: BoundCov::identity(),
            },
            log,
        ))
    }

    // -----------------------------------------------------------------
    // Point propagation (no covariance)
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn propagate_point(
        &self,
        geometry: &TrackingGeometry,
        start_surface: &Surface,
        start_vector: &BoundVector,
        target: &Surface,
        direction: PropDirection,
        path_limit: f64,
        mut log: Option<&mut Vec<StepRecord>>,
    ) -> Result<BoundVector, PropagationError> {
        let mut state = bound_to_free(start_surface, start_vector);
        let sign = direction.sign();
        let target_z = target.z();
        let mut h = self.config.max_step;

        for _ in 0..self.config.max_steps {
            let remaining = target_z - state.position.z;
            if remaining.abs() < 1e-9 {
                return Ok(free_to_bound(target, &state));
            }

            let uz = state.direction.z * sign;
            if uz.abs() < 1e-6 {
                return Err(PropagationError::Divergent);
            }
            // Step required to land on the plane with the current direction
            let to_plane = remaining / (state.direction.z * sign);
            if to_plane < 0.0 {
                // Plane behind the direction of travel
                return Err(PropagationError::Divergent);
            }

            if to_plane < self.config.min_step {
                // Close enough: take the remainder as one linear step
                state.position += state.direction * (sign * to_plane);
                state.time += to_plane / C_LIGHT;
                state.path += to_plane;
                return Ok(free_to_bound(target, &state));
            }

            let step = h.min(to_plane);
            match self.try_step(&state, sign * step) {
                StepOutcome::Accept(next, grow) => {
                    state = next;
                    state.path += step;
                    if let Some(log) = log.as_deref_mut() {
                        log.push(StepRecord {
                            path: state.path,
                            position: state.position,
                            step,
                        });
                    }
                    if grow {
                        h = (h * 2.0).min(self.config.max_step);
                    }
                }
                StepOutcome::Shrink => {
                    h = (h * 0.5).max(self.config.min_step);
                }
            }

            if state.path > path_limit {
                return Err(PropagationError::PathLimit);
            }
            if !geometry.inside_volume(&state.position) {
                return Err(PropagationError::LeftVolume);
            }
        }
        Err(PropagationError::StepLimit)
    }

    /// One adaptive step attempt: full step vs. two half steps.
    fn try_step(&self, state: &FreeState, h: f64) -> StepOutcome {
        let full = self.rk4(state, h);
        let half = self.rk4(state, h * 0.5);
        let double = self.rk4(&half, h * 0.5);

        let err = (full.position - double.position).norm()
            + (full.direction - double.direction).norm() * h.abs();

        if err > self.config.tolerance && h.abs() > self.config.min_step * 2.0 {
            StepOutcome::Shrink
        } else {
            // Keep the more accurate two-half-step result
            StepOutcome::Accept(double, err < 0.1 * self.config.tolerance)
        }
    }

    /// Classic RK4 on (position, direction); q/p is constant during a step.
    fn rk4(&self, state: &FreeState, h: f64) -> FreeState {
        let kappa = state.qop * K_CURVATURE;
        let deriv = |pos: &Vector3<f64>, dir: &Vector3<f64>| -> Vector3<f64> {
            kappa * dir.cross(&self.field.field(pos))
        };

        let p0 = state.position;
        let u0 = state.direction;

        let k1 = deriv(&p0, &u0);
        let p1 = p0 + u0 * (h * 0.5);
        let k2 = deriv(&p1, &(u0 + k1 * (h * 0.5)));
        let k3 = deriv(&p1, &(u0 + k2 * (h * 0.5)));
        let p3 = p0 + u0 * h;
        let k4 = deriv(&p3, &(u0 + k3 * h));

        let du = (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
        let u_mid = u0 + du * 0.5;
        let mut next = *state;
        next.position = p0 + u_mid * h;
        next.direction = (u0 + du).normalize();
        next.time += h.abs() / C_LIGHT;
        next
    }

    // -----------------------------------------------------------------
    // Covariance transport
    // -----------------------------------------------------------------

    /// Finite-difference bound-to-bound transport Jacobian.
    #[allow(clippy::too_many_arguments)]
    fn numeric_jacobian(
        &self,
        geometry: &TrackingGeometry,
        start_surface: &Surface,
        start_vector: &BoundVector,
        end_vector: &BoundVector,
        target: &Surface,
        direction: PropDirection,
        path_limit: f64,
    ) -> Result<BoundCov, PropagationError> {
        const EPS: [f64; 6] = [1e-4, 1e-4, 1e-7, 1e-7, 1e-7, 1e-4];
        let mut jac = BoundCov::zeros();
        for col in 0..6 {
            let mut perturbed = *start_vector;
            perturbed[col] += EPS[col];
            let end = self.propagate_point(
                geometry,
                start_surface,
                &perturbed,
                target,
                direction,
                path_limit,
                None,
            )?;
            for row in 0..6 {
                let mut delta = end[row] - end_vector[row];
                if row == E_PHI {
                    delta = wrap_angle(delta);
                }
                jac[(row, col)] = delta / EPS[col];
            }
        }
        Ok(jac)
    }

    /// Highland multiple-scattering noise at the destination surface.
    fn apply_material(
        &self,
        cov: &mut BoundCov,
        vector: &BoundVector,
        target: &Surface,
        _direction: PropDirection,
    ) {
        if !self.config.multiple_scattering || target.thickness_x0 <= 0.0 {
            return;
        }
        let p = 1.0 / vector[E_QOP].abs();
        let cos_inc = vector[E_THETA].cos().abs().max(1e-3);
        let x0_eff = target.thickness_x0 / cos_inc;
        let theta0 = 0.0136 / p * x0_eff.sqrt() * (1.0 + 0.038 * x0_eff.ln());
        let theta0_sq = theta0 * theta0;
        let sin_theta = vector[E_THETA].sin().abs().max(1e-3);
        cov[(E_PHI, E_PHI)] += theta0_sq / (sin_theta * sin_theta);
        cov[(E_THETA, E_THETA)] += theta0_sq;

        if self.config.energy_loss {
            // Variance of the loss fluctuation, taken as half the mean loss
            let de = self.config.energy_loss_per_x0 * x0_eff;
            let d_qop = de / (p * p);
            cov[(E_QOP, E_QOP)] += 0.25 * d_qop * d_qop;
        }
    }

    /// Mean energy loss applied to q/p. Backward propagation restores energy.
    fn energy_loss_qop(
        &self,
        qop: f64,
        target: &Surface,
        direction: PropDirection,
    ) -> Result<f64, PropagationError> {
        if target.thickness_x0 <= 0.0 {
            return Ok(qop);
        }
        let de = self.config.energy_loss_per_x0 * target.thickness_x0;
        let p = 1.0 / qop.abs();
        let p_new = p - direction.sign() * de;
        if p_new <= 1e-3 {
            return Err(PropagationError::Divergent);
        }
        Ok(qop.signum() / p_new)
    }
}

enum StepOutcome {
    Accept(FreeState, bool),
    Shrink,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
