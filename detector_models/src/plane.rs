//! Parametrized forward-spectrometer geometry.
//!
//! Stations of silicon planes perpendicular to the beam axis z. The first
//! layer of each station is pixel-like (2-D); the remaining layers are strips
//! with a small alternating stereo rotation, so each strip plane measures
//! loc0 in its own rotated frame.

use nalgebra::Vector2;
use reco_core::geometry::Surface;
use reco_core::types::GeometryId;
use reco_core::TrackingGeometry;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SpectrometerParams {
    pub n_stations: u16,
    pub layers_per_station: u16,
    /// z of the first layer of the first station (mm)
    pub first_station_z: f64,
    /// Distance between station fronts (mm)
    pub station_spacing: f64,
    /// Distance between layers within a station (mm)
    pub layer_spacing: f64,
    /// Stereo angle of strip layers, alternating in sign (radians)
    pub stereo_angle: f64,
    /// Strip readout pitch (mm)
    pub strip_pitch: f64,
    /// Pixel-layer point resolution per coordinate (mm)
    pub pixel_resolution: f64,
    /// Sensor half-width along both local axes (mm)
    pub half_width: f64,
    /// Layer material thickness in radiation lengths
    pub thickness_x0: f64,
    /// z of the upstream reference surface the seeds anchor to (mm)
    pub reference_z: f64,
}

impl Default for SpectrometerParams {
    fn default() -> Self {
        Self {
            n_stations: 4,
            layers_per_station: 4,
            first_station_z: 0.0,
            station_spacing: 500.0,
            layer_spacing: 40.0,
            stereo_angle: 0.026,
            strip_pitch: 0.08,
            pixel_resolution: 0.05,
            half_width: 200.0,
            thickness_x0: 0.02,
            reference_z: -200.0,
        }
    }
}

impl SpectrometerParams {
    /// First layer of each station carries 2-D pixels; the rest are strips.
    pub fn is_pixel_layer(&self, layer: u16) -> bool {
        layer == 0
    }

    /// Binary-readout strip resolution, pitch / √12.
    pub fn strip_resolution(&self) -> f64 {
        self.strip_pitch / 12.0_f64.sqrt()
    }

    pub fn layer_z(&self, station: u16, layer: u16) -> f64 {
        self.first_station_z
            + station as f64 * self.station_spacing
            + layer as f64 * self.layer_spacing
    }

    /// Stereo rotation of one layer: zero on pixel layers, alternating sign
    /// on strip layers.
    pub fn layer_stereo(&self, layer: u16) -> f64 {
        if self.is_pixel_layer(layer) {
            0.0
        } else if layer % 2 == 1 {
            self.stereo_angle
        } else {
            -self.stereo_angle
        }
    }

    /// Build the immutable tracking geometry, reference surface included.
    pub fn build_geometry(&self) -> TrackingGeometry {
        let half_bounds = Vector2::new(self.half_width, self.half_width);
        let mut surfaces = vec![Surface::plane_at_z(
            GeometryId::reference(),
            self.reference_z,
            0.0,
            half_bounds,
            0.0,
        )];
        for station in 0..self.n_stations {
            for layer in 0..self.layers_per_station {
                surfaces.push(Surface::plane_at_z(
                    GeometryId::new(station, layer),
                    self.layer_z(station, layer),
                    self.layer_stereo(layer),
                    half_bounds,
                    self.thickness_x0,
                ));
            }
        }
        TrackingGeometry::new(surfaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_geometry_has_all_planes_and_reference() {
        let params = SpectrometerParams::default();
        let geo = params.build_geometry();
        assert_eq!(geo.ordered_surfaces().len(), 16);
        assert!(geo.surface(GeometryId::reference()).is_some());
        assert_eq!(geo.stations(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn planes_are_ordered_along_z() {
        let geo = SpectrometerParams::default().build_geometry();
        let zs: Vec<f64> = geo
            .ordered_surfaces()
            .iter()
            .map(|id| geo.surface(*id).unwrap().z())
            .collect();
        assert!(zs.windows(2).all(|w| w[0] < w[1]));
        assert_abs_diff_eq!(zs[0], 0.0);
        assert_abs_diff_eq!(zs[15], 3.0 * 500.0 + 3.0 * 40.0);
    }

    #[test]
    fn stereo_alternates_on_strip_layers_only() {
        let p = SpectrometerParams::default();
        assert_eq!(p.layer_stereo(0), 0.0);
        assert_abs_diff_eq!(p.layer_stereo(1), 0.026);
        assert_abs_diff_eq!(p.layer_stereo(2), -0.026);
        assert_abs_diff_eq!(p.layer_stereo(3), 0.026);
    }

    #[test]
    fn strip_resolution_is_pitch_over_sqrt12() {
        let p = SpectrometerParams::default();
        assert_abs_diff_eq!(p.strip_resolution(), 0.08 / 12.0_f64.sqrt());
    }
}
