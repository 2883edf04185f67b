//! Magnetic field access.
//!
//! The field variant is chosen once at configuration time; the rest of the
//! pipeline only depends on the `field(position)` capability. The dipole
//! bends in the y-z plane (field along x), which is also the plane the
//! circle-fit seeder works in.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Which field map to use. Selected once from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldMode {
    /// Spectrometer dipole: B = (b_tesla, 0, 0), uniform over the tracker.
    Dipole { b_tesla: f64 },
    /// Arbitrary constant field (test setups).
    Constant { b: [f64; 3] },
    /// Field off: straight-line propagation.
    Off,
}

/// Magnetic field with a configurable overall scale factor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MagneticField {
    pub mode: FieldMode,
    /// Overall scale (conditions-derived; 1.0 = nominal)
    pub scale: f64,
}

impl MagneticField {
    pub fn new(mode: FieldMode) -> Self {
        Self { mode, scale: 1.0 }
    }

    pub fn with_scale(mode: FieldMode, scale: f64) -> Self {
        Self { mode, scale }
    }

    /// Field vector (Tesla) at a global position.
    pub fn field(&self, _position: &Vector3<f64>) -> Vector3<f64> {
        let b = match self.mode {
            FieldMode::Dipole { b_tesla } => Vector3::new(b_tesla, 0.0, 0.0),
            FieldMode::Constant { b } => Vector3::new(b[0], b[1], b[2]),
            FieldMode::Off => Vector3::zeros(),
        };
        b * self.scale
    }

    /// Field and its spatial gradient (central differences). The uniform
    /// built-in modes have zero gradient; the numeric form keeps the contract
    /// uniform for future mapped fields.
    pub fn field_gradient(&self, position: &Vector3<f64>) -> (Vector3<f64>, Matrix3<f64>) {
        const H: f64 = 1.0; // mm
        let b = self.field(position);
        let mut grad = Matrix3::zeros();
        for axis in 0..3 {
            let mut up = *position;
            let mut dn = *position;
            up[axis] += H;
            dn[axis] -= H;
            let db = (self.field(&up) - self.field(&dn)) / (2.0 * H);
            grad.set_column(axis, &db);
        }
        (b, grad)
    }

    /// The bending-plane field magnitude used by the seeders.
    pub fn bending_field(&self) -> f64 {
        match self.mode {
            FieldMode::Dipole { b_tesla } => b_tesla * self.scale,
            FieldMode::Constant { b } => b[0] * self.scale,
            FieldMode::Off => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dipole_points_along_x_and_scales() {
        let f = MagneticField::with_scale(FieldMode::Dipole { b_tesla: 0.57 }, 2.0);
        let b = f.field(&Vector3::new(10.0, -5.0, 300.0));
        assert_eq!(b, Vector3::new(1.14, 0.0, 0.0));
        assert_eq!(f.bending_field(), 1.14);
    }

    #[test]
    fn uniform_field_has_zero_gradient() {
        let f = MagneticField::new(FieldMode::Dipole { b_tesla: 0.57 });
        let (b, grad) = f.field_gradient(&Vector3::zeros());
        assert_eq!(b.x, 0.57);
        assert!(grad.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn off_mode_is_zero() {
        let f = MagneticField::new(FieldMode::Off);
        assert_eq!(f.field(&Vector3::zeros()), Vector3::zeros());
    }
}
