//! Combinatorial Kalman filter: branch exploration, gain-matrix filtering and
//! backward smoothing.
//!
//! # Design choices
//! - Per branch the state machine is predict → select measurements → update,
//!   with a fork per compatible measurement (chi-square below `cut × dim`,
//!   ranked ascending, at most `n_max` children). Zero compatible
//!   measurements produce a Hole state and the branch continues.
//! - Branches live in a per-event [`TrackStateArena`]; forking appends one
//!   state and shares the history through parent links.
//! - Propagation failure abandons the branch silently; only per-event
//!   counters record it.
//! - Smoothing is RTS by default; below a configurable momentum the track is
//!   instead refit backward from the last filtered state with an inflated
//!   covariance, because forward-only linearization is unreliable there.

use crate::error::ConfigError;
use crate::geometry::{StationMask, TrackingGeometry};
use crate::kalman;
use crate::propagator::Propagator;
use crate::seeding::SeedSet;
use crate::track::{StateType, Track, TrackState, TrackStateArena};
use crate::types::{
    BoundCov, BoundParameters, MeasurementContainer, PropDirection,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Deliberate demotion of measurements to outliers, used to compute unbiased
/// residuals for alignment studies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum OutlierPolicy {
    /// No demotion: outliers arise only from failed chi-square cuts upstream
    #[default]
    None,
    /// Demote every hit on one station
    Station(u16),
    /// Demote every hit on surfaces inside a z-window (mm)
    ZWindow { z_min: f64, z_max: f64 },
}

impl OutlierPolicy {
    fn demotes(&self, station: u16, z: f64) -> bool {
        match self {
            OutlierPolicy::None => false,
            OutlierPolicy::Station(s) => station == *s,
            OutlierPolicy::ZWindow { z_min, z_max } => z >= *z_min && z <= *z_max,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CkfConfig {
    /// Chi-square cut per measurement dimension
    pub chi2_cut: f64,
    /// Maximum child branches per surface (fan-out limit)
    pub n_max: usize,
    /// Hard cap on live branches per seed; excess is truncated by quality
    pub max_branches: usize,
    /// Below this momentum (GeV) the smoother is replaced by a backward refit
    pub reverse_filter_momentum: f64,
    /// Covariance inflation applied when starting the backward refit
    pub reverse_inflation: f64,
    pub outlier_policy: OutlierPolicy,
}

impl Default for CkfConfig {
    fn default() -> Self {
        Self {
            chi2_cut: 15.0,
            n_max: 4,
            max_branches: 128,
            reverse_filter_momentum: 2.0,
            reverse_inflation: 100.0,
            outlier_policy: OutlierPolicy::None,
        }
    }
}

/// Per-event counters; silent per-branch drops are observable here.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CkfStats {
    pub seeds: usize,
    pub invalid_seeds: usize,
    pub branches_created: usize,
    pub branches_abandoned: usize,
    pub holes: usize,
    pub forks: usize,
    pub tracks_finalized: usize,
    pub reverse_filtered: usize,
    pub smoother_failures: usize,
}

// ---------------------------------------------------------------------------
// Finder
// ---------------------------------------------------------------------------

struct Branch {
    tip: Option<crate::track::StateHandle>,
    /// Current filtered parameters (at `surface`, or the seed target before
    /// the first surface)
    parameters: BoundParameters,
    surface: crate::types::GeometryId,
    n_measurements: usize,
    chi2: f64,
}

pub struct CombinatorialKalmanFilter {
    pub propagator: Propagator,
    pub config: CkfConfig,
}

impl CombinatorialKalmanFilter {
    pub fn new(propagator: Propagator, config: CkfConfig) -> Self {
        Self { propagator, config }
    }

    /// Explore all seeds and return the finalized (smoothed) tracks.
    ///
    /// Unknown surfaces are configuration errors; per-seed fit failures are
    /// logged and skipped.
    pub fn find(
        &self,
        geometry: &TrackingGeometry,
        seeds: &SeedSet,
        container: &MeasurementContainer,
        mask: &StationMask,
        stats: &mut CkfStats,
    ) -> Result<Vec<Track>, ConfigError> {
        let target = geometry.require(seeds.target)?;
        let sequence = geometry.sequence(target.z(), seeds.direction, mask);
        // Resolve the whole sequence up front so an unknown id fails the job,
        // not one branch.
        for id in &sequence {
            geometry.require(*id)?;
        }

        let mut tracks = Vec::new();
        for seed in &seeds.candidates {
            stats.seeds += 1;
            if seed.parameters.validate().is_err() {
                stats.invalid_seeds += 1;
                debug!(qop = seed.parameters.qop(), "seed with invalid q/p skipped");
                continue;
            }
            self.explore_seed(
                geometry,
                &sequence,
                &seed.parameters,
                seeds.direction,
                container,
                stats,
                &mut tracks,
            )?;
        }
        Ok(tracks)
    }

    #[allow(clippy::too_many_arguments)]
    fn explore_seed(
        &self,
        geometry: &TrackingGeometry,
        sequence: &[crate::types::GeometryId],
        seed: &BoundParameters,
        direction: PropDirection,
        container: &MeasurementContainer,
        stats: &mut CkfStats,
        tracks: &mut Vec<Track>,
    ) -> Result<(), ConfigError> {
        let mut arena = TrackStateArena::new();
        let mut branches = vec![Branch {
            tip: None,
            parameters: seed.clone(),
            surface: seed.surface,
            n_measurements: 0,
            chi2: 0.0,
        }];
        stats.branches_created += 1;

        for surface_id in sequence {
            let surface = geometry.require(*surface_id)?;
            let mut next: Vec<Branch> = Vec::new();

            for branch in branches {
                let from = geometry.require(branch.surface)?;
                let end = match self.propagator.propagate(
                    geometry,
                    &branch.parameters,
                    from,
                    surface,
                    direction,
                    None,
                ) {
                    Ok(end) => end,
                    Err(err) => {
                        stats.branches_abandoned += 1;
                        debug!(surface = %surface_id, %err, "branch abandoned");
                        continue;
                    }
                };
                let predicted = end.parameters.vector;
                let predicted_cov = match end.parameters.covariance {
                    Some(c) => c,
                    None => {
                        stats.branches_abandoned += 1;
                        continue;
                    }
                };

                // Measurement selection: chi2 ≤ cut × dim, best n_max
                let demoted = self
                    .config
                    .outlier_policy
                    .demotes(surface_id.station(), surface.z());
                let mut compatible: Vec<(usize, f64, usize)> = Vec::new();
                for &idx in container.on_surface(*surface_id) {
                    let m = container.get(idx);
                    let chi2 = match kalman::predicted_chi2(
                        &predicted,
                        &predicted_cov,
                        &m.z_vector(),
                        &m.h_matrix(),
                        &m.r_matrix(),
                    ) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    if chi2 <= self.config.chi2_cut * m.dim() as f64 {
                        compatible.push((idx, chi2, m.dim()));
                    }
                }
                compatible.sort_by(|a, b| a.1.total_cmp(&b.1));
                compatible.truncate(self.config.n_max);

                if compatible.is_empty() || demoted {
                    // Hole, or deliberate outlier demotion: no filtered update
                    let (state_type, measurement, chi2, dim) = match compatible.first() {
                        Some(&(idx, chi2, dim)) if demoted => {
                            (StateType::Outlier, Some(idx), chi2, dim)
                        }
                        _ => {
                            stats.holes += 1;
                            (StateType::Hole, None, 0.0, 0)
                        }
                    };
                    let state = TrackState {
                        geometry: *surface_id,
                        state_type,
                        predicted,
                        predicted_cov,
                        filtered: predicted,
                        filtered_cov: predicted_cov,
                        smoothed: None,
                        jacobian: end.jacobian,
                        measurement,
                        source_link: measurement.map(|i| container.source_link(i)),
                        chi2,
                        dim,
                    };
                    let tip = arena.push(state, branch.tip);
                    next.push(Branch {
                        tip: Some(tip),
                        parameters: BoundParameters::new(
                            *surface_id,
                            predicted,
                            Some(predicted_cov),
                        ),
                        surface: *surface_id,
                        n_measurements: branch.n_measurements,
                        chi2: branch.chi2,
                    });
                    continue;
                }

                if compatible.len() > 1 {
                    stats.forks += 1;
                }
                for &(idx, _, _) in &compatible {
                    let m = container.get(idx);
                    let up = match kalman::update(
                        &predicted,
                        &predicted_cov,
                        &m.z_vector(),
                        &m.h_matrix(),
                        &m.r_matrix(),
                    ) {
                        Ok(up) => up,
                        Err(_) => continue,
                    };
                    let state = TrackState {
                        geometry: *surface_id,
                        state_type: StateType::Measurement,
                        predicted,
                        predicted_cov,
                        filtered: up.filtered,
                        filtered_cov: up.filtered_cov,
                        smoothed: None,
                        jacobian: end.jacobian,
                        measurement: Some(idx),
                        source_link: Some(container.source_link(idx)),
                        chi2: up.chi2,
                        dim: up.dim,
                    };
                    let tip = arena.push(state, branch.tip);
                    stats.branches_created += 1;
                    next.push(Branch {
                        tip: Some(tip),
                        parameters: BoundParameters::new(
                            *surface_id,
                            up.filtered,
                            Some(up.filtered_cov),
                        ),
                        surface: *surface_id,
                        n_measurements: branch.n_measurements + 1,
                        chi2: branch.chi2 + up.chi2,
                    });
                }
            }

            // Quality truncation when the fan-out exceeds the live-branch cap
            if next.len() > self.config.max_branches {
                next.sort_by(|a, b| {
                    b.n_measurements
                        .cmp(&a.n_measurements)
                        .then(a.chi2.total_cmp(&b.chi2))
                });
                next.truncate(self.config.max_branches);
            }
            branches = next;
            if branches.is_empty() {
                break;
            }
        }

        for branch in branches {
            let Some(tip) = branch.tip else { continue };
            if branch.n_measurements == 0 {
                continue;
            }
            let mut states = arena.chain(tip);
            self.smooth(geometry, &mut states, direction, container, stats);
            let mut track = Track::from_states(states);
            track.reference = Some(seed.clone());
            stats.tracks_finalized += 1;
            tracks.push(track);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Smoothing
    // -----------------------------------------------------------------

    /// RTS backward pass over the state sequence, or a backward refit for
    /// low-momentum tracks.
    fn smooth(
        &self,
        geometry: &TrackingGeometry,
        states: &mut [TrackState],
        direction: PropDirection,
        container: &MeasurementContainer,
        stats: &mut CkfStats,
    ) {
        let Some(last) = states.last() else { return };
        let momentum = 1.0 / last.filtered[crate::types::E_QOP].abs().max(1e-12);
        if momentum < self.config.reverse_filter_momentum {
            stats.reverse_filtered += 1;
            self.reverse_filter(geometry, states, direction, container, stats);
            return;
        }

        // Smoothed == filtered at the terminal state
        let n = states.len();
        states[n - 1].smoothed = Some((states[n - 1].filtered, states[n - 1].filtered_cov));
        for k in (0..n - 1).rev() {
            let (smoothed_next, smoothed_cov_next) = match states[k + 1].smoothed {
                Some(s) => s,
                None => break,
            };
            match kalman::rts_step(
                &states[k].filtered,
                &states[k].filtered_cov,
                &states[k + 1].predicted,
                &states[k + 1].predicted_cov,
                &smoothed_next,
                &smoothed_cov_next,
                &states[k + 1].jacobian,
            ) {
                Ok((v, c)) => states[k].smoothed = Some((v, c)),
                Err(_) => {
                    // Remaining states keep their filtered estimates
                    stats.smoother_failures += 1;
                    break;
                }
            }
        }
    }

    /// Backward refit: start from the last filtered state with an inflated
    /// covariance and filter through the visited surfaces in reverse.
    fn reverse_filter(
        &self,
        geometry: &TrackingGeometry,
        states: &mut [TrackState],
        direction: PropDirection,
        container: &MeasurementContainer,
        stats: &mut CkfStats,
    ) {
        let n = states.len();
        let last = &states[n - 1];
        let inflated: BoundCov = last.filtered_cov * self.config.reverse_inflation;
        let mut current =
            BoundParameters::new(last.geometry, last.filtered, Some(inflated));
        states[n - 1].smoothed = Some((last.filtered, last.filtered_cov));

        let back = direction.reverse();
        for k in (0..n - 1).rev() {
            let from = match geometry.surface(current.surface) {
                Some(s) => s,
                None => return,
            };
            let target = match geometry.surface(states[k].geometry) {
                Some(s) => s,
                None => return,
            };
            let end = match self
                .propagator
                .propagate(geometry, &current, from, target, back, None)
            {
                Ok(end) => end,
                Err(_) => {
                    // Remaining states keep their forward-filtered estimates
                    stats.smoother_failures += 1;
                    return;
                }
            };
            let predicted = end.parameters.vector;
            let predicted_cov = match end.parameters.covariance {
                Some(c) => c,
                None => return,
            };

            if states[k].state_type == StateType::Measurement {
                if let Some(idx) = states[k].measurement {
                    let m = container.get(idx);
                    match kalman::update(
                        &predicted,
                        &predicted_cov,
                        &m.z_vector(),
                        &m.h_matrix(),
                        &m.r_matrix(),
                    ) {
                        Ok(up) => {
                            states[k].smoothed = Some((up.filtered, up.filtered_cov));
                            current = BoundParameters::new(
                                states[k].geometry,
                                up.filtered,
                                Some(up.filtered_cov),
                            );
                            continue;
                        }
                        Err(_) => {
                            stats.smoother_failures += 1;
                            return;
                        }
                    }
                }
            }
            states[k].smoothed = Some((predicted, predicted_cov));
            current = BoundParameters::new(states[k].geometry, predicted, Some(predicted_cov));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldMode, MagneticField};
    use crate::geometry::Surface;
    use crate::propagator::PropagatorConfig;
    use crate::seeding::SeedCandidate;
    use crate::types::{
        BoundVector, ClusterId, GeometryId, Measurement, MeasurementValue, E_LOC0, E_LOC1, E_QOP,
        E_THETA,
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix2, Vector2};

    const N_PLANES: u16 = 6;

    fn telescope() -> TrackingGeometry {
        let mut surfaces = vec![Surface::plane_at_z(
            GeometryId::reference(),
            -200.0,
            0.0,
            Vector2::new(500.0, 500.0),
            0.0,
        )];
        for station in 0..N_PLANES {
            surfaces.push(Surface::plane_at_z(
                GeometryId::new(station, 0),
                station as f64 * 500.0,
                0.0,
                Vector2::new(500.0, 500.0),
                0.0,
            ));
        }
        TrackingGeometry::new(surfaces)
    }

    fn finder() -> CombinatorialKalmanFilter {
        let prop = Propagator::new(
            MagneticField::new(FieldMode::Off),
            PropagatorConfig {
                multiple_scattering: false,
                energy_loss: false,
                ..Default::default()
            },
        );
        CombinatorialKalmanFilter::new(prop, CkfConfig::default())
    }

    fn pixel(station: u16, x: f64, y: f64, cluster: u64) -> Measurement {
        Measurement {
            geometry: GeometryId::new(station, 0),
            value: MeasurementValue::Pixel {
                loc: Vector2::new(x, y),
                cov: Matrix2::identity() * 1e-4,
            },
            cluster: ClusterId(cluster),
        }
    }

    fn straight_seed(x: f64, y: f64, qop: f64) -> SeedSet {
        let mut v = BoundVector::zeros();
        v[E_LOC0] = x;
        v[E_LOC1] = y;
        v[E_THETA] = 1e-9;
        v[E_QOP] = qop;
        let mut cov = crate::types::BoundCov::zeros();
        for (i, var) in [1.0, 1.0, 1e-2, 1e-2, 1e-2, 1.0].iter().enumerate() {
            cov[(i, i)] = *var;
        }
        SeedSet {
            target: GeometryId::reference(),
            direction: PropDirection::Forward,
            candidates: vec![SeedCandidate {
                parameters: BoundParameters::new(GeometryId::reference(), v, Some(cov)),
                clusters: vec![],
                quality_chi2: 0.0,
            }],
        }
    }

    fn clean_container(x: f64, y: f64) -> MeasurementContainer {
        let mut c = MeasurementContainer::new();
        for station in 0..N_PLANES {
            c.push(pixel(station, x, y, station as u64));
        }
        c
    }

    #[test]
    fn clean_track_is_found_with_all_measurements() {
        let geo = telescope();
        let ckf = finder();
        let container = clean_container(1.0, 2.0);
        let seeds = straight_seed(1.0, 2.0, 0.2);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert_eq!(tracks.len(), 1);
        let t = &tracks[0];
        assert_eq!(t.n_measurements, N_PLANES as usize);
        assert_eq!(t.n_holes, 0);
        assert!(t.chi2_per_ndf() < 5.0);

        // Smoothed equals filtered at the terminal state
        let last = t.last_state().unwrap();
        let (sv, _) = last.smoothed.as_ref().unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(sv[i], last.filtered[i], epsilon = 1e-12);
        }
        // Every state carries a smoothed estimate after the backward pass
        assert!(t.states.iter().all(|s| s.smoothed.is_some()));
    }

    #[test]
    fn missing_measurement_becomes_hole() {
        let geo = telescope();
        let ckf = finder();
        let mut container = MeasurementContainer::new();
        for station in 0..N_PLANES {
            if station == 2 {
                continue;
            }
            container.push(pixel(station, 1.0, 2.0, station as u64));
        }
        let seeds = straight_seed(1.0, 2.0, 0.2);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].n_holes, 1);
        assert_eq!(tracks[0].n_measurements, N_PLANES as usize - 1);
        assert_eq!(stats.holes, 1);
    }

    #[test]
    fn two_compatible_measurements_fork_the_branch() {
        let geo = telescope();
        let ckf = finder();
        let mut container = clean_container(1.0, 2.0);
        // Second compatible hit on the first plane
        container.push(pixel(0, 1.3, 2.0, 99));
        let seeds = straight_seed(1.0, 2.0, 0.2);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(stats.forks >= 1);
    }

    #[test]
    fn fan_out_is_bounded_by_n_max() {
        let geo = telescope();
        let ckf = finder();
        let mut container = clean_container(1.0, 2.0);
        // Many compatible hits on one plane; children must stay ≤ n_max
        for k in 0..8 {
            container.push(pixel(3, 1.0 + 0.02 * k as f64, 2.0, 100 + k));
        }
        let seeds = straight_seed(1.0, 2.0, 0.2);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert!(tracks.len() <= ckf.config.n_max);
        assert!(!tracks.is_empty());
    }

    #[test]
    fn station_demotion_records_outliers() {
        let geo = telescope();
        let mut ckf = finder();
        ckf.config.outlier_policy = OutlierPolicy::Station(1);
        let container = clean_container(1.0, 2.0);
        let seeds = straight_seed(1.0, 2.0, 0.2);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert_eq!(tracks.len(), 1);
        let t = &tracks[0];
        assert_eq!(t.n_outliers, 1);
        assert_eq!(t.n_measurements, N_PLANES as usize - 1);
        let outlier = t
            .states
            .iter()
            .find(|s| s.state_type == StateType::Outlier)
            .unwrap();
        assert_eq!(outlier.geometry.station(), 1);
        assert!(outlier.measurement.is_some());
    }

    #[test]
    fn low_momentum_triggers_reverse_filter() {
        let geo = telescope();
        let ckf = finder();
        let container = clean_container(1.0, 2.0);
        // 1 GeV, below the 2 GeV reverse-filter threshold
        let seeds = straight_seed(1.0, 2.0, 1.0);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(stats.reverse_filtered, 1);
        assert!(tracks[0].states.iter().all(|s| s.smoothed.is_some()));
    }

    #[test]
    fn empty_container_yields_no_tracks() {
        let geo = telescope();
        let ckf = finder();
        let container = MeasurementContainer::new();
        let seeds = straight_seed(0.0, 0.0, 0.2);
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert!(tracks.is_empty());
    }

    #[test]
    fn invalid_seed_qop_is_skipped() {
        let geo = telescope();
        let ckf = finder();
        let container = clean_container(0.0, 0.0);
        let seeds = straight_seed(0.0, 0.0, 0.0); // q/p = 0 must fail fast
        let mut stats = CkfStats::default();

        let tracks = ckf
            .find(&geo, &seeds, &container, &StationMask::all(), &mut stats)
            .unwrap();
        assert!(tracks.is_empty());
        assert_eq!(stats.invalid_seeds, 1);
    }
}
