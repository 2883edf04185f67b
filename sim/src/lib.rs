//! `sim` — Synthetic event simulator: truth particles, digitization,
//! scenarios, replay.

pub mod event_sim;
pub mod particle;
pub mod replay;
pub mod scenarios;

pub use event_sim::{DigitizerConfig, EventSimulator};
pub use particle::TruthParticle;
pub use replay::{load_replay, save_replay, RecordedEvent, ReplayLog};
pub use scenarios::{Scenario, ScenarioKind};
