//! End-to-end checks: simulate, calibrate, reconstruct.

use detector_models::{calibrate, SpectrometerParams};
use reco_core::pipeline::{EventInput, Pipeline, PipelineConfig};
use reco_core::{ConditionsStore, MagneticField};
use sim::{DigitizerConfig, EventSimulator, Scenario, ScenarioKind};

fn clean_digitizer() -> DigitizerConfig {
    DigitizerConfig {
        efficiency: 1.0,
        noise_per_plane: 0.0,
        max_width: 1,
    }
}

struct RunResult {
    tracks: usize,
    full_length: usize,
    /// chi2/ndf of every output track
    fit_quality: Vec<f64>,
}

fn run_events(
    kind: ScenarioKind,
    seed: u64,
    n_events: u64,
    digitizer: DigitizerConfig,
) -> RunResult {
    let scenario = Scenario::build(kind, seed);
    let params = SpectrometerParams::default();
    let geometry = params.build_geometry();
    let field = MagneticField::new(scenario.field);
    let mut simulator = EventSimulator::new(params, field, digitizer, seed);

    let mut config = PipelineConfig::default();
    config.field.mode = scenario.field;
    let conditions = ConditionsStore::default();
    let pipeline = Pipeline::new(geometry.clone(), conditions.clone(), config);

    let mut result = RunResult {
        tracks: 0,
        full_length: 0,
        fit_quality: Vec::new(),
    };
    for event in 0..n_events {
        let truth = scenario.generate_particles(event);
        let clusters = simulator.digitize(&geometry, &truth);
        let (measurements, spacepoints) =
            calibrate(&params, &geometry, &conditions, event, &clusters).unwrap();
        let out = pipeline
            .process_event(&EventInput {
                event_number: event,
                spacepoints,
                measurements,
            })
            .unwrap();
        for t in &out.tracks {
            assert!(t.summary.n_measurements >= 12);
            result.tracks += 1;
            if t.summary.n_measurements == 16 {
                result.full_length += 1;
            }
            result.fit_quality.push(t.summary.chi2 / t.summary.ndf as f64);
        }
    }
    result
}

#[test]
fn single_scenario_reconstructs_most_events() {
    let r = run_events(ScenarioKind::Single, 11, 5, clean_digitizer());
    assert!(
        r.tracks >= 3,
        "expected tracks in most clean events, got {}",
        r.tracks
    );
    assert!(r.full_length >= 1, "expected at least one full-length track");
}

#[test]
fn single_scenario_fit_quality_is_near_unity() {
    // Realistic digitization: smearing, inefficiency and noise on
    let r = run_events(ScenarioKind::Single, 11, 10, DigitizerConfig::default());
    assert!(r.tracks >= 5, "expected tracks in most events, got {}", r.tracks);
    let mean = r.fit_quality.iter().sum::<f64>() / r.fit_quality.len() as f64;
    assert!(
        mean > 0.05 && mean < 3.0,
        "mean chi2/ndf out of range: {mean}"
    );
}

#[test]
fn zero_field_scenario_reconstructs_straight_tracks() {
    let r = run_events(ScenarioKind::ZeroField, 5, 5, clean_digitizer());
    assert!(
        r.tracks >= 3,
        "straight tracks should be found, got {}",
        r.tracks
    );
}

#[test]
fn empty_event_runs_through_the_full_chain() {
    let params = SpectrometerParams::default();
    let geometry = params.build_geometry();
    let conditions = ConditionsStore::default();
    let pipeline = Pipeline::new(
        geometry.clone(),
        conditions.clone(),
        PipelineConfig::default(),
    );
    let (measurements, spacepoints) =
        calibrate(&params, &geometry, &conditions, 1, &[]).unwrap();
    let out = pipeline
        .process_event(&EventInput {
            event_number: 1,
            spacepoints,
            measurements,
        })
        .unwrap();
    assert!(out.tracks.is_empty());
}
