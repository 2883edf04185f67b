//! `detector_models` — Spectrometer geometry construction and cluster
//! calibration.
//!
//! # Module layout
//! - [`plane`]   — Parametrized forward-spectrometer geometry builder
//! - [`cluster`] — Raw clusters and their calibration into measurements

pub mod cluster;
pub mod plane;

pub use cluster::{calibrate, RawCluster};
pub use plane::SpectrometerParams;
