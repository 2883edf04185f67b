//! `reco_core` — Charged-particle track reconstruction core.
//!
//! # Module layout
//! - [`types`]      — Fundamental types (IDs, bound parameters, measurements)
//! - [`error`]      — Error taxonomy (config / propagation / fit)
//! - [`geometry`]   — Measurement surfaces and the tracking-geometry snapshot
//! - [`field`]      — Magnetic-field access
//! - [`conditions`] — Versioned conditions / calibration store
//! - [`kalman`]     — Gain-matrix update, chi-square, RTS smoother step
//! - [`track`]      — Track states, per-event state arena, finalized tracks
//! - [`propagator`] — Adaptive RK4 extrapolation engine
//! - [`seeding`]    — Circle-fit and three-station seed builders
//! - [`ckf`]        — Combinatorial Kalman filter (branch exploration)
//! - [`selection`]  — Greedy track selection / de-duplication
//! - [`output`]     — Residuals, pulls, persistence representation
//! - [`pipeline`]   — Full per-event reconstruction orchestrator

pub mod ckf;
pub mod conditions;
pub mod error;
pub mod field;
pub mod geometry;
pub mod kalman;
pub mod output;
pub mod pipeline;
pub mod propagator;
pub mod seeding;
pub mod selection;
pub mod track;
pub mod types;

pub use ckf::{CkfConfig, CkfStats, CombinatorialKalmanFilter, OutlierPolicy};
pub use conditions::{ConditionsStore, Validity};
pub use error::{ConfigError, FitError, PropagationError};
pub use field::{FieldMode, MagneticField};
pub use geometry::{StationMask, Surface, TrackingGeometry};
pub use output::{FittedTrack, OutputConfig};
pub use pipeline::{EventCounters, EventInput, EventOutput, Pipeline, PipelineConfig};
pub use propagator::{Propagator, PropagatorConfig};
pub use seeding::{SeedFinder, SeedFinderConfig, SeedSet, SpacePoint};
pub use selection::SelectionConfig;
pub use track::{StateType, Track, TrackState};
pub use types::{
    BoundCov, BoundParameters, BoundVector, ClusterId, EventContext, GeometryId, Measurement,
    MeasurementContainer, MeasurementValue, PropDirection, SourceLink, TrackId,
};
