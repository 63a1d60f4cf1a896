//! FluoTrack Simulator CLI
//!
//! Run tracking scenarios on phantom volumes and report how the engine did.

use clap::Parser;
use fluotrack_core::TrackConfig;
use fluotrack_sim::scenarios::ScenarioId;
use fluotrack_sim::{ScenarioResult, ScenarioRunner, SimError, TrackExport};
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// FluoTrack scenario runner
#[derive(Parser, Debug)]
#[command(name = "fluotrack-sim")]
#[command(about = "Run deterministic cell-tracking scenarios", long_about = None)]
struct Args {
    /// Master seed for phantoms and tracker
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (isolated_cell, ambiguous_swap, cell_split, drifting_cells, round_trip, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Frames per phantom (scenarios raise it to their minimum)
    #[arg(short, long)]
    frames: Option<usize>,

    /// Global refinement passes (overrides the config file)
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Tracker config as JSON
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Write the final map of a single scenario as JSON
    #[arg(long)]
    export: Option<String>,

    /// Write the final map of a single scenario in the binary link format
    #[arg(long)]
    save: Option<String>,
}

fn build_runner(args: &Args) -> Result<ScenarioRunner, SimError> {
    let mut runner = ScenarioRunner::new(args.seed);
    if let Some(path) = &args.config {
        runner = runner.with_config(TrackConfig::from_json_file(path)?);
    }
    if let Some(frames) = args.frames {
        runner = runner.with_frames(frames);
    }
    if let Some(iterations) = args.iterations {
        runner = runner.with_iterations(iterations);
    }
    Ok(runner)
}

/// Runs one scenario and writes its map where asked.
fn run_with_output(args: &Args, runner: &ScenarioRunner, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
    let run = runner.run_scenario(scenario)?;
    if let Some(path) = &args.export {
        let export = TrackExport::from_map(scenario.name(), args.seed, run.result.passed, run.processor.map());
        export.write_to_file(path)?;
        info!("Exported {} frames to {}", export.frames.len(), path);
    }
    if let Some(path) = &args.save {
        run.processor.export_map(path)?;
    }
    Ok(run.result)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("FluoTrack Simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(s) => vec![s],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: isolated_cell, ambiguous_swap, cell_split, drifting_cells, round_trip, all");
                return ExitCode::FAILURE;
            }
        }
    };

    let runner = match build_runner(&args) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if (args.export.is_some() || args.save.is_some()) && scenarios.len() > 1 {
        eprintln!("Error: --export and --save need a single scenario, not 'all'");
        return ExitCode::FAILURE;
    }

    let mut results = Vec::with_capacity(scenarios.len());
    for &scenario in &scenarios {
        let result = if args.export.is_some() || args.save.is_some() {
            match run_with_output(&args, &runner, scenario) {
                Ok(r) => r,
                Err(e) => {
                    error!("{} aborted: {}", scenario, e);
                    return ExitCode::FAILURE;
                }
            }
        } else {
            runner.run(scenario)
        };

        if !args.json {
            if result.passed {
                info!("✓ {} (seed={}) PASSED", scenario.name(), result.seed);
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        results.push(result);
    }

    let total = results.len();
    let failed = results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed,
            "failed": failed,
            "results": results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "frames": r.frames,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else if failed == 0 {
        info!("All {} scenario runs passed", total);
    } else {
        error!("{}/{} scenario runs failed", failed, total);
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
