//! Digitization: truth crossings → raw clusters with inefficiency, smearing
//! and noise.

use crate::particle::TruthParticle;
use detector_models::{RawCluster, SpectrometerParams};
use nalgebra::Vector2;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use reco_core::types::ClusterId;
use reco_core::{MagneticField, TrackingGeometry};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DigitizerConfig {
    /// Per-crossing detection probability
    pub efficiency: f64,
    /// Mean number of noise clusters per plane per event
    pub noise_per_plane: f64,
    /// Cluster widths are drawn uniformly in 1..=max_width
    pub max_width: u32,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            efficiency: 0.98,
            noise_per_plane: 0.1,
            max_width: 3,
        }
    }
}

/// Deterministic (seeded) event digitizer.
pub struct EventSimulator {
    pub params: SpectrometerParams,
    pub field: MagneticField,
    pub config: DigitizerConfig,
    rng: ChaCha8Rng,
}

impl EventSimulator {
    pub fn new(
        params: SpectrometerParams,
        field: MagneticField,
        config: DigitizerConfig,
        seed: u64,
    ) -> Self {
        Self {
            params,
            field,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Digitize one event: trace every particle through the planes, apply
    /// efficiency and resolution smearing, then add noise clusters.
    pub fn digitize(
        &mut self,
        geometry: &TrackingGeometry,
        particles: &[TruthParticle],
    ) -> Vec<RawCluster> {
        let mut clusters = Vec::new();
        let mut next_id = 0u64;

        for particle in particles {
            for (id, position) in particle.crossings(&self.field, geometry) {
                if self.rng.gen::<f64>() > self.config.efficiency {
                    continue;
                }
                let surface = match geometry.surface(id) {
                    Some(s) => s,
                    None => continue,
                };
                let local = surface.global_to_local(&position);

                let (loc0, loc1) = if self.params.is_pixel_layer(id.layer()) {
                    let s = self.params.pixel_resolution;
                    (local.x + s * self.gauss(), local.y + s * self.gauss())
                } else {
                    // Strips measure loc0 only; loc1 is not read out
                    let s = self.params.strip_resolution();
                    (local.x + s * self.gauss(), 0.0)
                };

                clusters.push(RawCluster {
                    id: ClusterId(next_id),
                    geometry: id,
                    loc0,
                    loc1,
                    width: self.rng.gen_range(1..=self.config.max_width),
                });
                next_id += 1;
            }
        }

        // Noise clusters, Poisson per plane, uniform over the sensor
        let plane_ids: Vec<_> = geometry.ordered_surfaces().to_vec();
        for id in plane_ids {
            let n_noise = self.poisson(self.config.noise_per_plane);
            for _ in 0..n_noise {
                let surface = match geometry.surface(id) {
                    Some(s) => s,
                    None => continue,
                };
                let local = Vector2::new(
                    (self.rng.gen::<f64>() * 2.0 - 1.0) * surface.half_bounds.x,
                    (self.rng.gen::<f64>() * 2.0 - 1.0) * surface.half_bounds.y,
                );
                let is_pixel = self.params.is_pixel_layer(id.layer());
                clusters.push(RawCluster {
                    id: ClusterId(next_id),
                    geometry: id,
                    loc0: local.x,
                    loc1: if is_pixel { local.y } else { 0.0 },
                    width: 1,
                });
                next_id += 1;
            }
        }

        clusters
    }

    /// Standard-normal draw (Box-Muller).
    fn gauss(&mut self) -> f64 {
        let u1: f64 = self.rng.gen::<f64>().max(1e-12);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Poisson draw by product-of-uniforms inversion (small lambda only).
    fn poisson(&mut self, lambda: f64) -> usize {
        if lambda <= 0.0 {
            return 0;
        }
        let threshold = (-lambda).exp();
        let mut n = 0usize;
        let mut prod = self.rng.gen::<f64>();
        while prod > threshold && n < 50 {
            prod *= self.rng.gen::<f64>();
            n += 1;
        }
        n
    }
}
