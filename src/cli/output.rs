//! CLI output formatting.

use crate::config::WrapperConfig;
use crate::wrapper::MeshParameters;

/// Print version information.
pub fn print_version() {
    let version = option_env!("MLMC_WRAPPER_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    println!("mlmc-wrapper {version}");
    if let Some(hash) = option_env!("GIT_HASH") {
        println!("commit {hash}");
    }
}

/// Print help message.
pub fn print_help() {
    println!(
        r"mlmc-wrapper - multilevel Monte Carlo solver wrapper

USAGE:
    mlmc-wrapper <COMMAND> [OPTIONS]

COMMANDS:
    run <wrapper.yaml>          Serialize the level states and solve random samples
        -n, --samples <N>       Number of samples (default: 10)
        --seed <S>              Master seed for sample generation (default: 42)
        -w, --workers <W>       Worker threads (default: available parallelism)

    validate <wrapper.yaml>     Validate a wrapper configuration

    help                        Show this help message
    version                     Show version information

OPTIONS:
    -l, --log-level <LEVEL>     trace, debug, info, warn or error (default: info)

EXAMPLES:
    mlmc-wrapper run demos/stochastic.yaml --samples 100 --seed 7
    mlmc-wrapper validate demos/reading_from_file.yaml
"
    );
}

/// Print a summary of a validated configuration.
pub fn print_config_summary(config: &WrapperConfig) {
    println!("Refinement strategy:   {}", config.refinement_strategy);
    println!("Solver index:          {}", config.solver_index());
    println!(
        "Scheduling:            {}",
        if config.different_tasks() {
            "one task per level"
        } else {
            "one task per chain"
        }
    );
    println!(
        "Jump to finest level:  {}",
        config.adaptive_refinement_jump_to_finest_level
    );
    println!("Mapping outputs:       {}", config.mapping_output_quantities);
    println!(
        "Contributions:         {}",
        config.number_contributions_per_instance
    );
    println!(
        "Scalar outputs:        {} ({} QoI + {} combined)",
        config.number_of_scalar_outputs(),
        config.number_qoi,
        config.number_combined_qoi
    );
    match config.output_dimension() {
        Ok(dim) => println!("Output dimension:      {:?}", dim.as_slice()),
        Err(e) => println!("Output dimension:      invalid ({e})"),
    }
    for (level, path) in config.project_parameters_path.iter().enumerate() {
        println!("Project parameters[{level}]: {}", path.display());
    }
    if let Some(path) = &config.refinement_parameters_path {
        println!("Refinement parameters: {}", path.display());
    }
}

/// Outcome of a `run` command.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Samples attempted.
    pub samples: usize,
    /// Samples lost to refinement failures.
    pub failed: usize,
    /// Mean of every sub-result over successful samples.
    pub mean: Vec<Vec<f64>>,
    /// Total solve time in seconds.
    pub elapsed: f64,
    /// Mesh parameters of the level, if active.
    pub mesh: Option<MeshParameters>,
}

/// Print the outcome of a `run` command.
pub fn print_run_summary(summary: &RunSummary) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Samples: {} solved, {} failed",
        summary.samples - summary.failed,
        summary.failed
    );
    if let Some(mesh) = summary.mesh {
        println!(
            "Mesh size h = {:.6e}, 1/h = {:.6e}",
            mesh.mesh_size, mesh.mesh_parameter
        );
    }
    println!("Total solve time: {:.3} s", summary.elapsed);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (i, part) in summary.mean.iter().enumerate() {
        let values: Vec<String> = part.iter().map(|v| format!("{v:.6e}")).collect();
        println!("  QoI[{i}] mean: [{}]", values.join(", "));
    }
}
