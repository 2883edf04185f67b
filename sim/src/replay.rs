//! Replay: serialize/deserialize recorded events for offline reprocessing.

use crate::particle::TruthParticle;
use detector_models::RawCluster;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A full recorded simulation log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayLog {
    pub scenario_name: String,
    pub seed: u64,
    /// All events in order
    pub events: Vec<RecordedEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_number: u64,
    pub clusters: Vec<RawCluster>,
    /// Ground truth for efficiency/pull studies
    pub truth: Vec<TruthParticle>,
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)?;
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use reco_core::types::{ClusterId, GeometryId};

    #[test]
    fn replay_log_roundtrips_through_json() {
        let log = ReplayLog {
            scenario_name: "single".into(),
            seed: 42,
            events: vec![RecordedEvent {
                event_number: 1,
                clusters: vec![RawCluster {
                    id: ClusterId(0),
                    geometry: GeometryId::new(0, 0),
                    loc0: 1.25,
                    loc1: -3.5,
                    width: 2,
                }],
                truth: vec![TruthParticle {
                    id: 1000,
                    origin: Vector3::new(0.0, 0.0, -300.0),
                    direction: Vector3::new(0.0, 0.0, 1.0),
                    momentum: 10.0,
                    charge: -1.0,
                }],
            }],
        };
        let dir = std::env::temp_dir().join("fwdreco_replay_test.json");
        save_replay(&log, &dir).unwrap();
        let loaded = load_replay(&dir).unwrap();
        assert_eq!(loaded.scenario_name, "single");
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.events[0].clusters[0].width, 2);
        assert_eq!(loaded.events[0].truth[0].charge, -1.0);
        std::fs::remove_file(&dir).ok();
    }
}
