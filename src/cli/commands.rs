//! CLI command handlers.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{info, warn, Level};

use crate::config::WrapperConfig;
use crate::engine::{SampleDistribution, SampleRng, TaskRuntime, WorkStealingRuntime};
use crate::error::WrapperResult;
use crate::scenario::{BenchmarkScenario, SAMPLE_COMPONENTS};
use crate::wrapper::{Lifecycle, SolverWrapper};

use super::output::{print_config_summary, print_help, print_run_summary, print_version, RunSummary};
use super::{Args, Command};

/// Main CLI entry point.
///
/// Dispatches to the appropriate command handler based on parsed arguments.
#[must_use]
pub fn run_cli(args: Args) -> ExitCode {
    match args.command {
        Command::Run {
            config_path,
            samples,
            seed,
            workers,
        } => run_samples(&config_path, samples, seed, workers),
        Command::Validate { config_path } => validate_config(&config_path),
        Command::Help => {
            print_help();
            ExitCode::SUCCESS
        }
        Command::Version => {
            print_version();
            ExitCode::SUCCESS
        }
    }
}

/// Map a log level name to a tracing level, defaulting to `INFO`.
#[must_use]
pub fn parse_log_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build a wrapper over the benchmark scenario and solve `samples` draws.
#[must_use]
pub fn run_samples(path: &Path, samples: usize, seed: u64, workers: Option<usize>) -> ExitCode {
    let runtime = match workers {
        Some(n) => WorkStealingRuntime::with_workers(n),
        None => WorkStealingRuntime::new(),
    };
    let runtime = match runtime {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    match execute_run(path, samples, seed, runtime) {
        Ok(summary) => {
            print_run_summary(&summary);
            if summary.failed == summary.samples && summary.samples > 0 {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Run a batch of samples through a wrapper built from `path`.
///
/// Refinement failures are counted and skipped; any other error aborts.
///
/// # Errors
///
/// Returns the first non-retryable error.
pub fn execute_run<R: TaskRuntime>(
    path: &Path,
    samples: usize,
    seed: u64,
    runtime: Arc<R>,
) -> WrapperResult<RunSummary> {
    let config = WrapperConfig::load(path)?;
    let components = config.fake_random_variable.len().max(SAMPLE_COMPONENTS);
    let scenario = Arc::new(BenchmarkScenario::new(
        config.number_qoi,
        config.number_combined_qoi,
    ));
    info!(path = %path.display(), runtime = runtime.name(), "building solver wrapper");

    let mut wrapper = SolverWrapper::new(config, scenario, runtime)?;
    if wrapper.lifecycle() == Lifecycle::Constructed {
        wrapper.serialize()?;
    }

    let distributions = vec![SampleDistribution::default(); components];
    let mut rng = SampleRng::new(seed);
    let mut sums: Vec<Vec<f64>> = Vec::new();
    let mut failed = 0;
    let mut elapsed = 0.0;

    for i in 0..samples {
        let sample = rng.draw(&distributions);
        match wrapper.solve(sample) {
            Ok((result, time)) => {
                elapsed += time;
                if sums.is_empty() {
                    sums = result.parts().iter().map(|p| vec![0.0; p.len()]).collect();
                }
                for (sum, part) in sums.iter_mut().zip(result.parts()) {
                    for (s, v) in sum.iter_mut().zip(part) {
                        *s += v;
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(sample = i, error = %e, "sample failed");
                failed += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let solved = (samples - failed).max(1) as f64;
    let mean = sums
        .into_iter()
        .map(|part| part.into_iter().map(|s| s / solved).collect())
        .collect();
    let mesh = wrapper.mesh_parameters();
    wrapper.dispose();

    Ok(RunSummary {
        samples,
        failed,
        mean,
        elapsed,
        mesh,
    })
}

/// Validate a configuration file and print its summary.
#[must_use]
pub fn validate_config(path: &Path) -> ExitCode {
    println!("Validating: {}\n", path.display());

    match WrapperConfig::load(path) {
        Ok(config) => {
            print_config_summary(&config);
            println!("\n✓ Configuration is valid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ {e}");
            ExitCode::from(1)
        }
    }
}
