//! Raw clusters and their calibration into measurements and space points.
//!
//! Calibration applies the conditions snapshot: dead channels are skipped,
//! alignment corrections shift and rotate the local coordinates, and the
//! cluster width and sensor gain scale the position variance. Space points
//! are produced from pixel layers only, where both local coordinates are
//! known.

use crate::plane::SpectrometerParams;
use nalgebra::{Matrix2, Vector2, Vector3};
use reco_core::conditions::ConditionsStore;
use reco_core::error::ConfigError;
use reco_core::seeding::SpacePoint;
use reco_core::types::{ClusterId, GeometryId, Measurement, MeasurementValue};
use reco_core::{MeasurementContainer, TrackingGeometry};
use serde::{Deserialize, Serialize};

/// One raw cluster as delivered by the readout: local coordinates on its
/// surface plus the channel multiplicity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RawCluster {
    pub id: ClusterId,
    pub geometry: GeometryId,
    pub loc0: f64,
    /// Meaningful on pixel layers only; strips carry no loc1 information
    pub loc1: f64,
    /// Number of channels in the cluster
    pub width: u32,
}

/// Calibrate an event's raw clusters into the measurement container and the
/// pixel-layer space points used for seeding.
///
/// Dead channels (per conditions) are dropped silently; an unknown surface is
/// a configuration error.
pub fn calibrate(
    params: &SpectrometerParams,
    geometry: &TrackingGeometry,
    conditions: &ConditionsStore,
    event: u64,
    clusters: &[RawCluster],
) -> Result<(MeasurementContainer, Vec<SpacePoint>), ConfigError> {
    let mut container = MeasurementContainer::new();
    let mut spacepoints = Vec::new();

    for cluster in clusters {
        let surface = geometry.require(cluster.geometry)?;
        if !conditions.channel_good(cluster.geometry, event)? {
            continue;
        }

        // Alignment: shift the measured local coordinates by the projection
        // of the surface shift onto the local axes
        let delta = conditions.alignment(cluster.geometry);
        let shift = delta.shift_vector();
        let d0 = surface.rotation.column(0).dot(&shift);
        let d1 = surface.rotation.column(1).dot(&shift);
        // Small in-plane rotation of the surface, then the shift projection
        let (sin_r, cos_r) = delta.rot_z.sin_cos();
        let loc0 = cos_r * cluster.loc0 - sin_r * cluster.loc1 - d0;
        let loc1 = sin_r * cluster.loc0 + cos_r * cluster.loc1 - d1;

        let width = cluster.width.max(1) as f64;
        // Higher charge gain sharpens the centroid estimate
        let gain = conditions.calibration(cluster.geometry).gain.max(1e-6);
        let value = if params.is_pixel_layer(cluster.geometry.layer()) {
            let var = params.pixel_resolution.powi(2) * width / gain;
            MeasurementValue::Pixel {
                loc: Vector2::new(loc0, loc1),
                cov: Matrix2::identity() * var,
            }
        } else {
            let var = params.strip_resolution().powi(2) * width / gain;
            MeasurementValue::Strip { loc0, var }
        };

        container.push(Measurement {
            geometry: cluster.geometry,
            value,
            cluster: cluster.id,
        });

        if params.is_pixel_layer(cluster.geometry.layer()) {
            let global = surface.local_to_global(&Vector2::new(loc0, loc1));
            spacepoints.push(SpacePoint {
                cluster: cluster.id,
                geometry: cluster.geometry,
                position: Vector3::new(global.x, global.y, global.z),
            });
        }
    }

    Ok((container, spacepoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use reco_core::conditions::{AlignmentDelta, ChannelStatus};

    fn setup() -> (SpectrometerParams, TrackingGeometry) {
        let params = SpectrometerParams::default();
        let geometry = params.build_geometry();
        (params, geometry)
    }

    fn pixel_cluster(station: u16, loc0: f64, loc1: f64) -> RawCluster {
        RawCluster {
            id: ClusterId(station as u64),
            geometry: GeometryId::new(station, 0),
            loc0,
            loc1,
            width: 1,
        }
    }

    #[test]
    fn pixel_and_strip_clusters_get_the_right_dimension() {
        let (params, geometry) = setup();
        let conditions = ConditionsStore::default();
        let clusters = [
            pixel_cluster(0, 1.0, 2.0),
            RawCluster {
                id: ClusterId(10),
                geometry: GeometryId::new(0, 1),
                loc0: 3.0,
                loc1: 0.0,
                width: 2,
            },
        ];
        let (container, spacepoints) =
            calibrate(&params, &geometry, &conditions, 1, &clusters).unwrap();

        assert_eq!(container.len(), 2);
        assert_eq!(container.get(0).dim(), 2);
        assert_eq!(container.get(1).dim(), 1);
        // Space points come from pixel layers only
        assert_eq!(spacepoints.len(), 1);
        assert_abs_diff_eq!(spacepoints[0].position.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn dead_channel_is_skipped() {
        let (params, geometry) = setup();
        let mut conditions = ConditionsStore::default();
        conditions.set_channel_status(GeometryId::new(0, 0), ChannelStatus::Dead);
        let clusters = [pixel_cluster(0, 1.0, 2.0), pixel_cluster(1, 1.0, 2.0)];
        let (container, spacepoints) =
            calibrate(&params, &geometry, &conditions, 1, &clusters).unwrap();
        assert_eq!(container.len(), 1);
        assert_eq!(spacepoints.len(), 1);
        assert_eq!(spacepoints[0].geometry.station(), 1);
    }

    #[test]
    fn alignment_shift_moves_local_coordinates() {
        let (params, geometry) = setup();
        let mut conditions = ConditionsStore::default();
        conditions.set_alignment(
            GeometryId::new(0, 0),
            AlignmentDelta {
                shift: [0.5, -0.25, 0.0],
                rot_z: 0.0,
            },
        );
        let clusters = [pixel_cluster(0, 1.0, 2.0)];
        let (container, _) = calibrate(&params, &geometry, &conditions, 1, &clusters).unwrap();
        match &container.get(0).value {
            MeasurementValue::Pixel { loc, .. } => {
                // Pixel layer has no stereo rotation: axes align with x/y
                assert_abs_diff_eq!(loc.x, 0.5, epsilon = 1e-12);
                assert_abs_diff_eq!(loc.y, 2.25, epsilon = 1e-12);
            }
            other => panic!("expected pixel measurement, got {other:?}"),
        }
    }

    #[test]
    fn alignment_rotation_turns_local_coordinates() {
        let (params, geometry) = setup();
        let mut conditions = ConditionsStore::default();
        let rot_z = 0.01;
        conditions.set_alignment(
            GeometryId::new(0, 0),
            AlignmentDelta {
                shift: [0.0; 3],
                rot_z,
            },
        );
        let clusters = [pixel_cluster(0, 10.0, 20.0)];
        let (container, _) = calibrate(&params, &geometry, &conditions, 1, &clusters).unwrap();
        match &container.get(0).value {
            MeasurementValue::Pixel { loc, .. } => {
                let (s, c) = rot_z.sin_cos();
                assert_abs_diff_eq!(loc.x, c * 10.0 - s * 20.0, epsilon = 1e-12);
                assert_abs_diff_eq!(loc.y, s * 10.0 + c * 20.0, epsilon = 1e-12);
            }
            other => panic!("expected pixel measurement, got {other:?}"),
        }
    }

    #[test]
    fn sensor_gain_scales_the_variance() {
        let (params, geometry) = setup();
        let mut conditions = ConditionsStore::default();
        conditions.set_calibration(
            GeometryId::new(0, 1),
            reco_core::conditions::SensorCalibration {
                depletion_voltage: 150.0,
                gain: 4.0,
            },
        );
        let cluster = RawCluster {
            id: ClusterId(0),
            geometry: GeometryId::new(0, 1),
            loc0: 0.0,
            loc1: 0.0,
            width: 1,
        };
        let (container, _) =
            calibrate(&params, &geometry, &conditions, 1, &[cluster]).unwrap();
        match &container.get(0).value {
            MeasurementValue::Strip { var, .. } => {
                assert_abs_diff_eq!(
                    *var,
                    params.strip_resolution().powi(2) / 4.0,
                    epsilon = 1e-15
                );
            }
            other => panic!("expected strip, got {other:?}"),
        }
    }

    #[test]
    fn wide_cluster_has_larger_variance() {
        let (params, geometry) = setup();
        let conditions = ConditionsStore::default();
        let narrow = RawCluster {
            id: ClusterId(0),
            geometry: GeometryId::new(0, 1),
            loc0: 0.0,
            loc1: 0.0,
            width: 1,
        };
        let wide = RawCluster {
            id: ClusterId(1),
            width: 3,
            ..narrow
        };
        let (container, _) =
            calibrate(&params, &geometry, &conditions, 1, &[narrow, wide]).unwrap();
        let var = |i: usize| match &container.get(i).value {
            MeasurementValue::Strip { var, .. } => *var,
            other => panic!("expected strip, got {other:?}"),
        };
        assert!(var(1) > var(0));
    }

    #[test]
    fn unknown_surface_is_config_error() {
        let (params, geometry) = setup();
        let conditions = ConditionsStore::default();
        let bogus = RawCluster {
            id: ClusterId(0),
            geometry: GeometryId::new(40, 0),
            loc0: 0.0,
            loc1: 0.0,
            width: 1,
        };
        assert!(calibrate(&params, &geometry, &conditions, 1, &[bogus]).is_err());
    }
}
