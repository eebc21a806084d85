//! CLI module tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::args::{Args, Command, DEFAULT_LOG_LEVEL, DEFAULT_SAMPLES, DEFAULT_SEED};
use super::commands::{execute_run, parse_log_level, run_cli, validate_config};
use crate::engine::InlineRuntime;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Level;

// ============================================================================
// Args parsing tests
// ============================================================================

#[test]
fn test_parse_no_args_shows_help() {
    let args = Args::parse_from(["mlmc-wrapper"]);
    assert_eq!(args.command, Command::Help);
    assert_eq!(args.log_level, DEFAULT_LOG_LEVEL);
}

#[test]
fn test_parse_help_variants() {
    for flag in ["-h", "--help", "help"] {
        let args = Args::parse_from(["mlmc-wrapper", flag]);
        assert_eq!(args.command, Command::Help, "{flag}");
    }
}

#[test]
fn test_parse_version_variants() {
    for flag in ["-V", "--version", "version"] {
        let args = Args::parse_from(["mlmc-wrapper", flag]);
        assert_eq!(args.command, Command::Version, "{flag}");
    }
}

#[test]
fn test_parse_unknown_command() {
    let args = Args::parse_from(["mlmc-wrapper", "launch"]);
    assert_eq!(args.command, Command::Help);
}

#[test]
fn test_parse_run_defaults() {
    let args = Args::parse_from(["mlmc-wrapper", "run", "wrapper.yaml"]);
    assert_eq!(
        args.command,
        Command::Run {
            config_path: PathBuf::from("wrapper.yaml"),
            samples: DEFAULT_SAMPLES,
            seed: DEFAULT_SEED,
            workers: None,
        }
    );
}

#[test]
fn test_parse_run_options() {
    let args = Args::parse_from([
        "mlmc-wrapper",
        "run",
        "wrapper.yaml",
        "--samples",
        "25",
        "--seed",
        "7",
        "-w",
        "3",
        "--log-level",
        "debug",
    ]);
    assert_eq!(
        args.command,
        Command::Run {
            config_path: PathBuf::from("wrapper.yaml"),
            samples: 25,
            seed: 7,
            workers: Some(3),
        }
    );
    assert_eq!(args.log_level, "debug");
}

#[test]
fn test_parse_run_bad_number_keeps_default() {
    let args = Args::parse_from(["mlmc-wrapper", "run", "w.yaml", "-n", "many"]);
    match args.command {
        Command::Run { samples, .. } => assert_eq!(samples, DEFAULT_SAMPLES),
        other => panic!("expected run, got {other:?}"),
    }
}

#[test]
fn test_parse_run_requires_path() {
    assert_eq!(Args::parse_from(["mlmc-wrapper", "run"]).command, Command::Help);
    assert_eq!(
        Args::parse_from(["mlmc-wrapper", "run", "--seed", "1"]).command,
        Command::Help
    );
}

#[test]
fn test_parse_validate() {
    let args = Args::parse_from(["mlmc-wrapper", "validate", "w.json"]);
    assert_eq!(
        args.command,
        Command::Validate {
            config_path: PathBuf::from("w.json")
        }
    );
    assert_eq!(
        Args::parse_from(["mlmc-wrapper", "validate"]).command,
        Command::Help
    );
}

#[test]
fn test_parse_log_level() {
    assert_eq!(parse_log_level("TRACE"), Level::TRACE);
    assert_eq!(parse_log_level("debug"), Level::DEBUG);
    assert_eq!(parse_log_level("info"), Level::INFO);
    assert_eq!(parse_log_level("warn"), Level::WARN);
    assert_eq!(parse_log_level("error"), Level::ERROR);
    assert_eq!(parse_log_level("loud"), Level::INFO);
}

// ============================================================================
// Command tests
// ============================================================================

fn write_case(dir: &Path, wrapper_yaml: &str) -> PathBuf {
    std::fs::write(
        dir.join("project.json"),
        r#"{
            "problem_data": { "model_part_name": "Rod" },
            "solver_settings": { "model_import_settings": { "input_type": "mdpa" } },
            "mesh": { "elements": 8 }
        }"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("refinement.json"),
        r#"{
            "hessian_metric": { "interpolation_error": 0.05 },
            "refinement_mmg": { "minimal_size": 0.001 }
        }"#,
    )
    .unwrap();
    let path = dir.join("wrapper.yaml");
    std::fs::write(&path, wrapper_yaml).unwrap();
    path
}

const STOCHASTIC: &str = r"
projectParametersPath: project.json
refinementParametersPath: refinement.json
refinementStrategy: stochastic_adaptive_refinement
solverWrapperIndex: [1]
numberQoI: 2
numberCombinedQoi: 1
outputBatchSize: 2
";

#[test]
fn test_run_cli_help() {
    let exit = run_cli(Args::parse_from(["mlmc-wrapper", "help"]));
    assert_eq!(exit, ExitCode::SUCCESS);
}

#[test]
fn test_run_cli_version() {
    let exit = run_cli(Args::parse_from(["mlmc-wrapper", "version"]));
    assert_eq!(exit, ExitCode::SUCCESS);
}

#[test]
fn test_validate_missing_file() {
    assert_ne!(
        validate_config(Path::new("/nonexistent/wrapper.yaml")),
        ExitCode::SUCCESS
    );
}

#[test]
fn test_validate_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_case(dir.path(), STOCHASTIC);
    assert_eq!(validate_config(&path), ExitCode::SUCCESS);
}

#[test]
fn test_validate_unknown_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_case(
        dir.path(),
        "projectParametersPath: project.json\nrefinementStrategy: guesswork\n",
    );
    assert_ne!(validate_config(&path), ExitCode::SUCCESS);
}

#[test]
fn test_execute_run_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_case(dir.path(), STOCHASTIC);
    let summary = execute_run(&path, 4, 11, Arc::new(InlineRuntime)).unwrap();

    assert_eq!(summary.samples, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.mean.len(), 2);
    assert_eq!(summary.mean[0].len(), 2);
    assert_eq!(summary.mean[1].len(), 1);
    assert!(summary.mesh.is_some());
    assert!(summary.elapsed >= 0.0);
}

#[test]
fn test_execute_run_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_case(dir.path(), STOCHASTIC);
    let a = execute_run(&path, 3, 5, Arc::new(InlineRuntime)).unwrap();
    let b = execute_run(&path, 3, 5, Arc::new(InlineRuntime)).unwrap();
    assert_eq!(a.mean, b.mean);
}

#[test]
fn test_execute_run_asynchronous_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_case(dir.path(), &format!("{STOCHASTIC}asynchronous: true\n"));
    let summary = execute_run(&path, 2, 1, Arc::new(InlineRuntime)).unwrap();
    assert_eq!(summary.failed, 0);
}

#[test]
fn test_run_cli_run_command() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_case(dir.path(), STOCHASTIC);
    let exit = run_cli(Args::parse_from([
        "mlmc-wrapper",
        "run",
        path.to_str().unwrap(),
        "--samples",
        "2",
        "--workers",
        "2",
    ]));
    assert_eq!(exit, ExitCode::SUCCESS);
}

#[test]
fn test_run_cli_run_missing_file() {
    let exit = run_cli(Args::parse_from([
        "mlmc-wrapper",
        "run",
        "/nonexistent/wrapper.yaml",
        "-w",
        "1",
    ]));
    assert_ne!(exit, ExitCode::SUCCESS);
}
