//! Error taxonomy for the reconstruction core.
//!
//! Three tiers, matching how failures propagate:
//! - [`ConfigError`] — wrong at initialization (unknown geometry identifier,
//!   missing conditions entry). Aborts the job, never handled per event.
//! - [`PropagationError`] — one branch's extrapolation failed. The branch is
//!   abandoned; the event continues.
//! - [`FitError`] — one seed or one track failed to fit. Logged, counted,
//!   and skipped; the event continues.

use crate::types::GeometryId;
use thiserror::Error;

/// Fatal configuration problems detected at startup or on first lookup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown geometry identifier {0}")]
    UnknownSurface(GeometryId),
    #[error("conditions entry missing for {key} at event {event}")]
    MissingConditions { key: String, event: u64 },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-branch extrapolation failures. Expected and silent at branch level.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PropagationError {
    /// Step budget exhausted before reaching the target surface.
    #[error("maximum step count exceeded")]
    StepLimit,
    /// Accumulated path length exceeded the caller-supplied limit.
    #[error("path limit exceeded")]
    PathLimit,
    /// The state left the instrumented volume.
    #[error("track left the tracking volume")]
    LeftVolume,
    /// Direction became (numerically) parallel to the target plane.
    #[error("numerical divergence during stepping")]
    Divergent,
}

/// Per-seed / per-track fit failures. Recoverable at event level.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    /// q/p of exactly zero (or non-finite) is not a valid charged particle.
    #[error("invalid q/p: {0}")]
    InvalidQop(f64),
    /// Innovation covariance could not be inverted.
    #[error("singular innovation covariance")]
    SingularInnovation,
    /// Smoother gain could not be formed (singular predicted covariance).
    #[error("singular predicted covariance in smoother")]
    SingularSmoother,
    /// Track has too few measurements to be fit-worthy for output.
    #[error("too few measurements: {got} < {need}")]
    TooFewMeasurements { got: usize, need: usize },
    /// The branch this track came from had no states at all.
    #[error("empty track state sequence")]
    EmptyTrack,
    /// A track state references a surface missing from the geometry.
    #[error("track state on unknown surface {0}")]
    MissingSurface(GeometryId),
}
