//! Track states, the per-event state arena and the finalized Track.
//!
//! During combinatorial finding, branches share their common prefix: states
//! live in a [`TrackStateArena`] and each state carries a parent handle, so a
//! fork costs one new state, not a copy of the history. Finalized tracks copy
//! their chain out of the arena and own it.

use crate::types::{BoundCov, BoundParameters, BoundVector, GeometryId, SourceLink};
use serde::{Deserialize, Serialize};

/// What kind of state was recorded at a surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    /// A measurement was selected and entered the filtered update
    Measurement,
    /// A measurement was present but excluded from the fit
    Outlier,
    /// No compatible measurement at an expected surface
    Hole,
}

/// One state per surface visited during filtering.
///
/// `predicted` and `filtered` are fixed once created; `smoothed` is filled
/// only by the backward pass. For Hole and Outlier states the filtered state
/// equals the predicted one.
#[derive(Clone, Debug)]
pub struct TrackState {
    pub geometry: GeometryId,
    pub state_type: StateType,
    pub predicted: BoundVector,
    pub predicted_cov: BoundCov,
    pub filtered: BoundVector,
    pub filtered_cov: BoundCov,
    pub smoothed: Option<(BoundVector, BoundCov)>,
    /// Transport Jacobian from the previous state's surface to this one
    pub jacobian: BoundCov,
    /// Index into the event measurement container (Measurement / Outlier)
    pub measurement: Option<usize>,
    pub source_link: Option<SourceLink>,
    /// Chi-square of the predicted residual against the measurement
    pub chi2: f64,
    /// Measurement dimension (0 for holes)
    pub dim: usize,
}

impl TrackState {
    /// The best available parameters at this surface: smoothed if present,
    /// filtered otherwise.
    pub fn best(&self) -> (&BoundVector, &BoundCov) {
        match &self.smoothed {
            Some((v, c)) => (v, c),
            None => (&self.filtered, &self.filtered_cov),
        }
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Stable handle into the per-event state arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateHandle(u32);

/// Per-event arena of track states with parent links. Dropped wholesale at
/// end of event; finalized tracks have copied their chains out by then.
#[derive(Clone, Debug, Default)]
pub struct TrackStateArena {
    states: Vec<TrackState>,
    parents: Vec<Option<StateHandle>>,
}

impl TrackStateArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: TrackState, parent: Option<StateHandle>) -> StateHandle {
        let handle = StateHandle(self.states.len() as u32);
        self.states.push(state);
        self.parents.push(parent);
        handle
    }

    pub fn get(&self, handle: StateHandle) -> &TrackState {
        &self.states[handle.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Walk tip → root and return the chain in forward (first-surface-first)
    /// order, cloning states out of the arena.
    pub fn chain(&self, tip: StateHandle) -> Vec<TrackState> {
        let mut out = Vec::new();
        let mut cursor = Some(tip);
        while let Some(h) = cursor {
            out.push(self.states[h.0 as usize].clone());
            cursor = self.parents[h.0 as usize];
        }
        out.reverse();
        out
    }
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

/// A finalized fitted trajectory: owns its ordered state sequence.
#[derive(Clone, Debug)]
pub struct Track {
    /// States from first to last surface along the finding direction
    pub states: Vec<TrackState>,
    /// Cumulative chi-square over measurement states
    pub chi2: f64,
    /// Degrees of freedom: sum of measurement dimensions − 5
    pub ndf: usize,
    pub n_measurements: usize,
    pub n_outliers: usize,
    pub n_holes: usize,
    /// Fitted parameters at a designated reference surface, if attached
    pub reference: Option<BoundParameters>,
    /// Measurement-container indices used by this track (for shared-hit tests)
    pub measurement_indices: Vec<usize>,
}

impl Track {
    /// Build a track from an ordered state sequence, deriving the summary
    /// counts. The caller runs the smoother before or after as appropriate.
    pub fn from_states(states: Vec<TrackState>) -> Self {
        let mut chi2 = 0.0;
        let mut dims = 0usize;
        let mut n_measurements = 0;
        let mut n_outliers = 0;
        let mut n_holes = 0;
        let mut measurement_indices = Vec::new();

        for state in &states {
            match state.state_type {
                StateType::Measurement => {
                    chi2 += state.chi2;
                    dims += state.dim;
                    n_measurements += 1;
                    if let Some(idx) = state.measurement {
                        measurement_indices.push(idx);
                    }
                }
                StateType::Outlier => n_outliers += 1,
                StateType::Hole => n_holes += 1,
            }
        }

        let ndf = dims.saturating_sub(5).max(1);
        Self {
            states,
            chi2,
            ndf,
            n_measurements,
            n_outliers,
            n_holes,
            reference: None,
            measurement_indices,
        }
    }

    pub fn chi2_per_ndf(&self) -> f64 {
        self.chi2 / self.ndf as f64
    }

    pub fn first_state(&self) -> Option<&TrackState> {
        self.states.first()
    }

    pub fn last_state(&self) -> Option<&TrackState> {
        self.states.last()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
