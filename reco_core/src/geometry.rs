//! Measurement surfaces and the tracking-geometry container.
//!
//! Surfaces are planes (nearly) perpendicular to the beam axis z. A stereo
//! rotation about z is encoded in the surface frame, so a 1-D strip
//! measurement is always "loc0 on its own surface" and the filter never sees
//! stereo angles explicitly.

use crate::error::ConfigError;
use crate::types::{GeometryId, PropDirection};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

/// One sensor plane: center, local frame and material budget.
///
/// The rotation columns are the local axes: col0 = loc0 axis, col1 = loc1
/// axis, col2 = plane normal (along +z for this spectrometer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Surface {
    pub id: GeometryId,
    pub center: Vector3<f64>,
    pub rotation: Matrix3<f64>,
    /// Sensor half-widths along loc0/loc1 (mm)
    pub half_bounds: Vector2<f64>,
    /// Material thickness in radiation lengths (x/X0)
    pub thickness_x0: f64,
}

impl Surface {
    /// Plane at `z` with a stereo rotation about the beam axis.
    pub fn plane_at_z(
        id: GeometryId,
        z: f64,
        stereo: f64,
        half_bounds: Vector2<f64>,
        thickness_x0: f64,
    ) -> Self {
        let (s, c) = stereo.sin_cos();
        let rotation = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
        Self {
            id,
            center: Vector3::new(0.0, 0.0, z),
            rotation,
            half_bounds,
            thickness_x0,
        }
    }

    pub fn z(&self) -> f64 {
        self.center.z
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.rotation.column(2).into()
    }

    /// Local (loc0, loc1) → global position on the plane.
    pub fn local_to_global(&self, local: &Vector2<f64>) -> Vector3<f64> {
        self.center
            + Vector3::from(self.rotation.column(0)) * local.x
            + Vector3::from(self.rotation.column(1)) * local.y
    }

    /// Global position → local (loc0, loc1), projecting onto the plane.
    pub fn global_to_local(&self, global: &Vector3<f64>) -> Vector2<f64> {
        let d = global - self.center;
        Vector2::new(self.rotation.column(0).dot(&d), self.rotation.column(1).dot(&d))
    }

    /// True if (loc0, loc1) is inside the sensor bounds.
    pub fn within_bounds(&self, local: &Vector2<f64>) -> bool {
        local.x.abs() <= self.half_bounds.x && local.y.abs() <= self.half_bounds.y
    }
}

// ---------------------------------------------------------------------------
// Station mask
// ---------------------------------------------------------------------------

/// Restriction of seeding / finding to a subset of stations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StationMask {
    /// None = all stations allowed; Some = explicit allow-list.
    allowed: Option<Vec<u16>>,
}

impl StationMask {
    pub fn all() -> Self {
        Self { allowed: None }
    }

    pub fn only(stations: &[u16]) -> Self {
        Self {
            allowed: Some(stations.to_vec()),
        }
    }

    /// An empty allow-list: every station masked out.
    pub fn none() -> Self {
        Self {
            allowed: Some(Vec::new()),
        }
    }

    pub fn allows(&self, station: u16) -> bool {
        match &self.allowed {
            None => true,
            Some(list) => list.contains(&station),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackingGeometry
// ---------------------------------------------------------------------------

/// Immutable per-job geometry snapshot: id → surface lookup plus the
/// z-ordered surface sequence used for track finding.
#[derive(Clone, Debug)]
pub struct TrackingGeometry {
    surfaces: HashMap<GeometryId, Surface>,
    /// Sensor surfaces ordered by z ascending (reference surface excluded)
    ordered: Vec<GeometryId>,
    /// Volume bounds for "left the tracking volume" checks
    z_min: f64,
    z_max: f64,
    transverse_limit: f64,
}

impl TrackingGeometry {
    /// Build from a flat list of surfaces. The reference surface participates
    /// in lookups but not in the finding sequence.
    pub fn new(surfaces: Vec<Surface>) -> Self {
        let mut ordered: Vec<(f64, GeometryId)> = surfaces
            .iter()
            .filter(|s| !s.id.is_reference())
            .map(|s| (s.z(), s.id))
            .collect();
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

        let z_lo = surfaces.iter().map(Surface::z).fold(f64::INFINITY, f64::min);
        let z_hi = surfaces
            .iter()
            .map(Surface::z)
            .fold(f64::NEG_INFINITY, f64::max);
        let transverse_limit = surfaces
            .iter()
            .map(|s| s.half_bounds.x.max(s.half_bounds.y))
            .fold(0.0, f64::max)
            * 3.0;

        let map = surfaces.into_iter().map(|s| (s.id, s)).collect();
        Self {
            surfaces: map,
            ordered: ordered.into_iter().map(|(_, id)| id).collect(),
            z_min: z_lo - 500.0,
            z_max: z_hi + 500.0,
            transverse_limit,
        }
    }

    pub fn surface(&self, id: GeometryId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// Lookup that treats an unknown identifier as a configuration error.
    pub fn require(&self, id: GeometryId) -> Result<&Surface, ConfigError> {
        self.surfaces
            .get(&id)
            .ok_or(ConfigError::UnknownSurface(id))
    }

    /// All sensor surfaces ordered along +z.
    pub fn ordered_surfaces(&self) -> &[GeometryId] {
        &self.ordered
    }

    /// Distinct station numbers present, ascending.
    pub fn stations(&self) -> Vec<u16> {
        let mut s: Vec<u16> = self.ordered.iter().map(GeometryId::station).collect();
        s.sort_unstable();
        s.dedup();
        s
    }

    /// The surface sequence a branch visits, starting downstream (or
    /// upstream, for backward finding) of `from_z`, restricted by `mask`.
    pub fn sequence(&self, from_z: f64, direction: PropDirection, mask: &StationMask) -> Vec<GeometryId> {
        let mut seq: Vec<GeometryId> = self
            .ordered
            .iter()
            .copied()
            .filter(|id| mask.allows(id.station()))
            .filter(|id| {
                let z = self.surfaces[id].z();
                match direction {
                    PropDirection::Forward => z > from_z,
                    PropDirection::Backward => z < from_z,
                }
            })
            .collect();
        if direction == PropDirection::Backward {
            seq.reverse();
        }
        seq
    }

    /// True if a global position is still inside the instrumented volume.
    pub fn inside_volume(&self, position: &Vector3<f64>) -> bool {
        position.z >= self.z_min
            && position.z <= self.z_max
            && position.x.abs() <= self.transverse_limit
            && position.y.abs() <= self.transverse_limit
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
