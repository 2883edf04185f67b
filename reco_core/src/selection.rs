//! Track selection / de-duplication.
//!
//! Greedy maximal-weight-independent-set approximation: candidates sorted by
//! measurement count descending with chi-square ascending as tie-break; the
//! best remaining track is accepted and every remaining candidate sharing too
//! many measurements with it (or falling below the minimum measurement count)
//! is dropped. Shared hits are tested via bitset intersection over the
//! per-event measurement-index space, sized from the [`EventContext`].

use crate::track::Track;
use crate::types::EventContext;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Candidates with fewer measurements than this are dropped
    pub min_measurements: usize,
    /// Two selected tracks may share at most this many measurements
    pub max_shared: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_measurements: 12,
            max_shared: 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Bitset over the per-event measurement-index space
// ---------------------------------------------------------------------------

/// Fixed-size bitset keyed by measurement index.
#[derive(Clone, Debug)]
pub struct HitMask {
    words: Vec<u64>,
}

impl HitMask {
    pub fn new(n_measurements: usize) -> Self {
        Self {
            words: vec![0; n_measurements.div_ceil(64)],
        }
    }

    pub fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    /// Number of bits set in both masks.
    pub fn shared(&self, other: &HitMask) -> usize {
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a & b).count_ones() as usize)
            .sum()
    }

    fn from_track(track: &Track, n_measurements: usize) -> Self {
        let mut mask = Self::new(n_measurements);
        for &idx in &track.measurement_indices {
            mask.set(idx);
        }
        mask
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Select a mutually-distinct subset of the finalized tracks.
///
/// Zero selected tracks for an event with zero valid candidates is valid
/// output, never an error.
pub fn select_tracks(
    candidates: Vec<Track>,
    ctx: &EventContext,
    config: &SelectionConfig,
) -> Vec<Track> {
    let mut pool: Vec<(Track, HitMask)> = candidates
        .into_iter()
        .filter(|t| t.n_measurements >= config.min_measurements)
        .map(|t| {
            let mask = HitMask::from_track(&t, ctx.n_measurements);
            (t, mask)
        })
        .collect();

    // Measurement count descending, chi-square ascending on ties
    pool.sort_by(|(a, _), (b, _)| {
        b.n_measurements
            .cmp(&a.n_measurements)
            .then(a.chi2.total_cmp(&b.chi2))
    });

    let mut selected: Vec<(Track, HitMask)> = Vec::new();
    for (track, mask) in pool {
        let distinct = selected
            .iter()
            .all(|(_, sel)| mask.shared(sel) <= config.max_shared);
        if distinct {
            selected.push((track, mask));
        }
    }
    selected.into_iter().map(|(t, _)| t).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
