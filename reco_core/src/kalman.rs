//! Kalman filter mathematics: gain-matrix update, chi-square, RTS smoother
//! step.
//!
//! # Design choices
//! - All math in `f64` via `nalgebra`; the measurement side uses dynamic-size
//!   vectors/matrices because strips are 1-D and pixels 2-D.
//! - The covariance update uses the **Joseph form**
//!   `P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ`, which stays symmetric PSD even with
//!   rounding.
//! - A singular innovation covariance is a recoverable `FitError`, never a
//!   panic: the candidate measurement is simply rejected upstream.

use crate::error::FitError;
use crate::types::{BoundCov, BoundVector, DMat, DVec, E_PHI};

/// Result of one gain-matrix update.
#[derive(Clone, Debug)]
pub struct KalmanUpdate {
    pub filtered: BoundVector,
    pub filtered_cov: BoundCov,
    /// Chi-square of the *predicted* residual against this measurement
    pub chi2: f64,
    /// Measurement dimension (1 strip, 2 pixel)
    pub dim: usize,
}

/// Normalize an angle to (−π, π].
pub fn wrap_angle(a: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut w = a.rem_euclid(two_pi);
    if w > std::f64::consts::PI {
        w -= two_pi;
    }
    w
}

/// Chi-square of a predicted state against a measurement:
/// `νᵀ S⁻¹ ν` with `ν = z − H·x` and `S = H·P·Hᵀ + R`.
pub fn predicted_chi2(
    predicted: &BoundVector,
    predicted_cov: &BoundCov,
    z: &DVec,
    h: &DMat,
    r: &DMat,
) -> Result<f64, FitError> {
    let (residual, s) = innovation(predicted, predicted_cov, z, h, r);
    let s_inv = s.lu().try_inverse().ok_or(FitError::SingularInnovation)?;
    Ok(residual.dot(&(&s_inv * &residual)))
}

/// Gain-matrix Kalman update of a predicted state against one measurement.
pub fn update(
    predicted: &BoundVector,
    predicted_cov: &BoundCov,
    z: &DVec,
    h: &DMat,
    r: &DMat,
) -> Result<KalmanUpdate, FitError> {
    let dim = z.len();
    let (residual, s) = innovation(predicted, predicted_cov, z, h, r);

    let s_inv = s.lu().try_inverse().ok_or(FitError::SingularInnovation)?;
    let chi2 = residual.dot(&(&s_inv * &residual));

    // K = P·Hᵀ·S⁻¹
    let p_dyn = DMat::from_row_slice(6, 6, predicted_cov.as_slice());
    let k = &p_dyn * h.transpose() * &s_inv;

    // x' = x + K·ν
    let correction = &k * &residual;
    let mut filtered = *predicted;
    for i in 0..6 {
        filtered[i] += correction[i];
    }
    filtered[E_PHI] = wrap_angle(filtered[E_PHI]);

    // Joseph form P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
    let kh = &k * h;
    let i_kh = DMat::identity(6, 6) - kh;
    let p_new = &i_kh * &p_dyn * i_kh.transpose() + &k * r * k.transpose();
    let filtered_cov = BoundCov::from_fn(|row, col| p_new[(row, col)]);

    Ok(KalmanUpdate {
        filtered,
        filtered_cov,
        chi2,
        dim,
    })
}

fn innovation(
    predicted: &BoundVector,
    predicted_cov: &BoundCov,
    z: &DVec,
    h: &DMat,
    r: &DMat,
) -> (DVec, DMat) {
    let x_dyn = DVec::from_iterator(6, predicted.iter().copied());
    let residual = z - h * &x_dyn;
    let p_dyn = DMat::from_row_slice(6, 6, predicted_cov.as_slice());
    let s = h * &p_dyn * h.transpose() + r;
    (residual, s)
}

/// One RTS (Rauch-Tung-Striebel) backward step.
///
/// Given the filtered state at surface k, the prediction and smoothed result
/// at surface k+1 and the transport Jacobian F from k to k+1, produce the
/// smoothed state at k:
/// `G = P_f·Fᵀ·P_pred⁻¹`,
/// `x_s = x_f + G·(x_s,next − x_pred,next)`,
/// `P_s = P_f + G·(P_s,next − P_pred,next)·Gᵀ`.
#[allow(clippy::too_many_arguments)]
pub fn rts_step(
    filtered: &BoundVector,
    filtered_cov: &BoundCov,
    predicted_next: &BoundVector,
    predicted_cov_next: &BoundCov,
    smoothed_next: &BoundVector,
    smoothed_cov_next: &BoundCov,
    jacobian_next: &BoundCov,
) -> Result<(BoundVector, BoundCov), FitError> {
    let pred_inv = predicted_cov_next
        .try_inverse()
        .ok_or(FitError::SingularSmoother)?;
    let gain = filtered_cov * jacobian_next.transpose() * pred_inv;

    let mut delta = smoothed_next - predicted_next;
    delta[E_PHI] = wrap_angle(delta[E_PHI]);

    let mut smoothed = filtered + gain * delta;
    smoothed[E_PHI] = wrap_angle(smoothed[E_PHI]);
    let smoothed_cov =
        filtered_cov + gain * (smoothed_cov_next - predicted_cov_next) * gain.transpose();
    Ok((smoothed, smoothed_cov))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector};

    fn strip_h() -> DMat {
        DMatrix::from_row_slice(1, 6, &[1., 0., 0., 0., 0., 0.])
    }

    #[test]
    fn update_reduces_uncertainty_and_is_symmetric_psd() {
        let predicted = BoundVector::new(1.0, 2.0, 0.01, 0.02, 0.1, 0.0);
        let predicted_cov = BoundCov::identity() * 4.0;
        let z = DVector::from_vec(vec![1.3]);
        let r = DMatrix::from_element(1, 1, 0.01);

        let up = update(&predicted, &predicted_cov, &z, &strip_h(), &r).unwrap();

        assert!(up.chi2 >= 0.0);
        assert!(up.filtered_cov[(0, 0)] < predicted_cov[(0, 0)]);
        // Symmetry
        for i in 0..6 {
            for j in 0..6 {
                assert_abs_diff_eq!(
                    up.filtered_cov[(i, j)],
                    up.filtered_cov[(j, i)],
                    epsilon = 1e-10
                );
            }
        }
        // PSD via diagonal positivity after symmetric update (spot check)
        for i in 0..6 {
            assert!(up.filtered_cov[(i, i)] > 0.0);
        }
        // Filtered position moves toward the measurement
        assert!(up.filtered[0] > 1.0 && up.filtered[0] < 1.3 + 1e-9);
    }

    #[test]
    fn filtered_cov_matches_i_minus_kh_form() {
        // For a linear model, Joseph form must agree with (I−KH)·P.
        let predicted = BoundVector::zeros();
        let predicted_cov = BoundCov::identity() * 2.0;
        let z = DVector::from_vec(vec![0.5]);
        let r = DMatrix::from_element(1, 1, 0.5);
        let h = strip_h();

        let up = update(&predicted, &predicted_cov, &z, &h, &r).unwrap();

        let p_dyn = DMat::from_row_slice(6, 6, predicted_cov.as_slice());
        let s = &h * &p_dyn * h.transpose() + &r;
        let k = &p_dyn * h.transpose() * s.try_inverse().unwrap();
        let simple = (DMat::identity(6, 6) - &k * &h) * &p_dyn;
        for i in 0..6 {
            for j in 0..6 {
                assert_abs_diff_eq!(up.filtered_cov[(i, j)], simple[(i, j)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn chi2_zero_for_perfect_measurement() {
        let predicted = BoundVector::new(3.0, 0.0, 0.0, 0.0, 0.1, 0.0);
        let cov = BoundCov::identity();
        let z = DVector::from_vec(vec![3.0]);
        let r = DMatrix::from_element(1, 1, 0.01);
        let chi2 = predicted_chi2(&predicted, &cov, &z, &strip_h(), &r).unwrap();
        assert_abs_diff_eq!(chi2, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_innovation_is_recoverable() {
        let predicted = BoundVector::zeros();
        let cov = BoundCov::zeros();
        let z = DVector::from_vec(vec![0.0]);
        let r = DMatrix::from_element(1, 1, 0.0);
        assert_eq!(
            predicted_chi2(&predicted, &cov, &z, &strip_h(), &r),
            Err(FitError::SingularInnovation)
        );
    }

    #[test]
    fn wrap_angle_range() {
        assert_abs_diff_eq!(wrap_angle(3.0 * std::f64::consts::PI), std::f64::consts::PI);
        assert_abs_diff_eq!(wrap_angle(-0.1), -0.1, epsilon = 1e-15);
        assert!(wrap_angle(100.0) <= std::f64::consts::PI);
        assert!(wrap_angle(-100.0) > -std::f64::consts::PI);
    }
}
