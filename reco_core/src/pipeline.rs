//! Event-scope reconstruction pipeline: seeding → combinatorial finding →
//! selection → output assembly.
//!
//! # Design choices
//! - The pipeline is re-entrant: `process_event(&self, ..)` holds no mutable
//!   state, so a caller may process events concurrently from one shared
//!   pipeline (geometry, conditions and configuration are read-only).
//! - Conditions (field scale) are resolved per event; the per-event field and
//!   propagator are rebuilt from them, which is cheap since both are small
//!   value types.
//! - Per-event counters make silent drops (abandoned branches, dropped
//!   tracks) observable in aggregate.

use crate::ckf::{CkfConfig, CkfStats, CombinatorialKalmanFilter};
use crate::conditions::ConditionsStore;
use crate::error::ConfigError;
use crate::field::{FieldMode, MagneticField};
use crate::geometry::{StationMask, TrackingGeometry};
use crate::output::{FittedTrack, OutputAssembler, OutputConfig};
use crate::propagator::{Propagator, PropagatorConfig};
use crate::seeding::{
    CircleFitSeeder, SeedFinder, SeedFinderConfig, SpacePoint, ThreeStationSeeder,
};
use crate::selection::{select_tracks, SelectionConfig};
use crate::types::{EventContext, MeasurementContainer};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Which seed-builder variant to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeederKind {
    #[default]
    CircleFit,
    ThreeStation,
}

/// Full pipeline configuration: one block per stage, all overridable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub field: FieldModeConfig,
    pub seeder: SeederKind,
    pub seeding: SeedFinderConfig,
    pub propagator: PropagatorConfig,
    pub ckf: CkfConfig,
    pub selection: SelectionConfig,
    pub output: OutputConfig,
    /// Stations used for seeding and finding (default: all)
    pub mask: StationMask,
}

/// Serializable field selection (the mode is fixed at configuration time).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldModeConfig {
    pub mode: FieldMode,
}

impl Default for FieldModeConfig {
    fn default() -> Self {
        Self {
            mode: FieldMode::Dipole { b_tesla: 0.57 },
        }
    }
}

// ---------------------------------------------------------------------------
// Event input / output
// ---------------------------------------------------------------------------

/// One event's reconstruction input, built by the detector-model layer.
pub struct EventInput {
    pub event_number: u64,
    pub spacepoints: Vec<SpacePoint>,
    pub measurements: MeasurementContainer,
}

/// Per-event summary counters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EventCounters {
    pub n_measurements: usize,
    pub seeds: usize,
    pub tracks_found: usize,
    pub tracks_selected: usize,
    pub tracks_written: usize,
    pub ckf: CkfStats,
}

/// Result of processing one event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventOutput {
    pub event_number: u64,
    pub tracks: Vec<FittedTrack>,
    pub counters: EventCounters,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    geometry: TrackingGeometry,
    conditions: ConditionsStore,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        geometry: TrackingGeometry,
        conditions: ConditionsStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            geometry,
            conditions,
            config,
        }
    }

    pub fn geometry(&self) -> &TrackingGeometry {
        &self.geometry
    }

    /// Run the full chain on one event. Only configuration-level problems are
    /// errors; per-seed and per-track failures end up in the counters.
    pub fn process_event(&self, input: &EventInput) -> Result<EventOutput, ConfigError> {
        let ctx = EventContext::new(input.event_number, input.measurements.len());
        let scale = self.conditions.field_scale(input.event_number)?;
        let field = MagneticField::with_scale(self.config.field.mode, scale);
        let propagator = Propagator::new(field, self.config.propagator);

        let seeder: Box<dyn SeedFinder> = match self.config.seeder {
            SeederKind::CircleFit => {
                Box::new(CircleFitSeeder::new(self.config.seeding, field))
            }
            SeederKind::ThreeStation => {
                Box::new(ThreeStationSeeder::new(self.config.seeding, field))
            }
        };
        let seeds = seeder.find(&self.geometry, &input.spacepoints, &self.config.mask)?;

        let ckf = CombinatorialKalmanFilter::new(propagator.clone(), self.config.ckf);
        let mut stats = CkfStats::default();
        let tracks = ckf.find(
            &self.geometry,
            &seeds,
            &input.measurements,
            &self.config.mask,
            &mut stats,
        )?;
        let tracks_found = tracks.len();

        let selected = select_tracks(tracks, &ctx, &self.config.selection);
        let tracks_selected = selected.len();

        let assembler = OutputAssembler::new(self.config.output, propagator);
        let fitted = assembler.assemble(&self.geometry, &selected, &input.measurements)?;

        let counters = EventCounters {
            n_measurements: input.measurements.len(),
            seeds: seeds.candidates.len(),
            tracks_found,
            tracks_selected,
            tracks_written: fitted.len(),
            ckf: stats,
        };
        debug!(
            event = input.event_number,
            measurements = counters.n_measurements,
            seeds = counters.seeds,
            found = counters.tracks_found,
            selected = counters.tracks_selected,
            written = counters.tracks_written,
            "event processed"
        );

        Ok(EventOutput {
            event_number: input.event_number,
            tracks: fitted,
            counters,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
