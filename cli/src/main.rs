//! `fwdreco` CLI: batch reconstruction of simulated scenarios and recorded
//! replay logs.

use anyhow::Result;
use clap::{Parser, Subcommand};
use detector_models::{calibrate, SpectrometerParams};
use rayon::prelude::*;
use reco_core::pipeline::{EventCounters, EventInput, Pipeline, PipelineConfig};
use reco_core::ConditionsStore;
use sim::replay::{save_replay, RecordedEvent, ReplayLog};
use sim::scenarios::{Scenario, ScenarioKind};
use sim::EventSimulator;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "fwdreco", about = "Forward-spectrometer track reconstruction CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a named scenario and reconstruct every event.
    RunScenario {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Number of events (overrides the scenario default)
        #[arg(long)]
        events: Option<usize>,
        /// Pipeline configuration overrides (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the per-run summary to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also save the simulated events as a replay log
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Reconstruct a previously recorded replay log.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        /// Pipeline configuration overrides (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the per-run summary to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RunScenario {
            scenario,
            seed,
            events,
            config,
            output,
            save_replay: save_path,
        } => run_scenario(
            scenario,
            seed,
            events,
            config.as_deref(),
            output.as_deref(),
            save_path.as_deref(),
        ),
        Commands::Replay {
            input,
            config,
            output,
        } => run_replay(&input, config.as_deref(), output.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        None => Ok(PipelineConfig::default()),
        Some(p) => {
            let text = std::fs::read_to_string(p)?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}

fn run_scenario(
    kind: ScenarioKind,
    seed: u64,
    events: Option<usize>,
    config_path: Option<&Path>,
    output_path: Option<&Path>,
    replay_path: Option<&Path>,
) -> Result<()> {
    let scenario = Scenario::build(kind, seed);
    let n_events = events.unwrap_or(scenario.n_events);
    let mut config = load_config(config_path)?;
    config.field.mode = scenario.field;

    let params = SpectrometerParams::default();
    let geometry = params.build_geometry();
    let field = reco_core::MagneticField::new(scenario.field);
    let mut simulator = EventSimulator::new(params, field, scenario.digitizer, seed);

    println!(
        "Running scenario '{}' (seed={}, {} events)...",
        scenario.name, seed, n_events
    );
    let start = std::time::Instant::now();

    // Simulation is sequential (one RNG stream); reconstruction is parallel.
    let recorded: Vec<RecordedEvent> = (0..n_events as u64)
        .map(|event_number| {
            let truth = scenario.generate_particles(event_number);
            let clusters = simulator.digitize(&geometry, &truth);
            RecordedEvent {
                event_number,
                clusters,
                truth,
            }
        })
        .collect();

    let summary = reconstruct(&params, &geometry, &config, &recorded)?;
    let elapsed = start.elapsed();
    print_summary(&summary, n_events, elapsed);

    if let Some(rpath) = replay_path {
        let log = ReplayLog {
            scenario_name: scenario.name.clone(),
            seed,
            events: recorded,
        };
        save_replay(&log, rpath)?;
        println!("Replay saved to {}", rpath.display());
    }

    if let Some(opath) = output_path {
        write_summary(opath, &scenario.name, seed, &summary, n_events, elapsed)?;
        println!("Summary saved to {}", opath.display());
    }

    Ok(())
}

fn run_replay(
    input: &Path,
    config_path: Option<&Path>,
    output_path: Option<&Path>,
) -> Result<()> {
    let log = sim::load_replay(input)?;
    println!(
        "Replaying '{}' ({} events)...",
        log.scenario_name,
        log.events.len()
    );

    let config = load_config(config_path)?;
    let params = SpectrometerParams::default();
    let geometry = params.build_geometry();

    let start = std::time::Instant::now();
    let summary = reconstruct(&params, &geometry, &config, &log.events)?;
    let elapsed = start.elapsed();
    print_summary(&summary, log.events.len(), elapsed);

    if let Some(opath) = output_path {
        write_summary(
            opath,
            &log.scenario_name,
            log.seed,
            &summary,
            log.events.len(),
            elapsed,
        )?;
    }
    Ok(())
}

/// Calibrate and reconstruct all events in parallel, aggregating the
/// per-event counters.
fn reconstruct(
    params: &SpectrometerParams,
    geometry: &reco_core::TrackingGeometry,
    config: &PipelineConfig,
    events: &[RecordedEvent],
) -> Result<RunSummary> {
    let conditions = ConditionsStore::default();
    let pipeline = Pipeline::new(geometry.clone(), conditions.clone(), config.clone());

    let counters: Vec<EventCounters> = events
        .par_iter()
        .map(|event| -> Result<EventCounters> {
            let (measurements, spacepoints) = calibrate(
                params,
                geometry,
                &conditions,
                event.event_number,
                &event.clusters,
            )?;
            let input = EventInput {
                event_number: event.event_number,
                spacepoints,
                measurements,
            };
            let out = pipeline.process_event(&input)?;
            info!(
                event = out.event_number,
                tracks = out.tracks.len(),
                "event reconstructed"
            );
            Ok(out.counters)
        })
        .collect::<Result<_>>()?;

    let mut total = RunSummary::default();
    for c in counters {
        total.measurements += c.n_measurements;
        total.seeds += c.seeds;
        total.tracks_found += c.tracks_found;
        total.tracks_selected += c.tracks_selected;
        total.tracks_written += c.tracks_written;
        total.branches_abandoned += c.ckf.branches_abandoned;
    }
    Ok(total)
}

#[derive(Clone, Copy, Debug, Default)]
struct RunSummary {
    measurements: usize,
    seeds: usize,
    tracks_found: usize,
    tracks_selected: usize,
    tracks_written: usize,
    branches_abandoned: usize,
}

fn print_summary(s: &RunSummary, n_events: usize, elapsed: std::time::Duration) {
    println!(
        "Done: {} events, {} measurements, {} seeds, elapsed={:.2}s",
        n_events,
        s.measurements,
        s.seeds,
        elapsed.as_secs_f64()
    );
    println!(
        "Tracks: {} found, {} selected, {} written ({} branches abandoned)",
        s.tracks_found, s.tracks_selected, s.tracks_written, s.branches_abandoned
    );
}

fn write_summary(
    path: &Path,
    scenario: &str,
    seed: u64,
    s: &RunSummary,
    n_events: usize,
    elapsed: std::time::Duration,
) -> Result<()> {
    let json = serde_json::json!({
        "scenario": scenario,
        "seed": seed,
        "events": n_events,
        "elapsed_s": elapsed.as_secs_f64(),
        "measurements": s.measurements,
        "seeds": s.seeds,
        "tracks_found": s.tracks_found,
        "tracks_selected": s.tracks_selected,
        "tracks_written": s.tracks_written,
        "branches_abandoned": s.branches_abandoned,
    });
    std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
    Ok(())
}
