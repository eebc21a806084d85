//! CLI argument parsing.
//!
//! Hand-rolled so the parser can be driven from tests with any iterator of
//! strings.

use std::path::PathBuf;

/// Default number of samples drawn by `run`.
pub const DEFAULT_SAMPLES: usize = 10;

/// Default master seed for sample generation.
pub const DEFAULT_SEED: u64 = 42;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// CLI arguments container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// The command to execute.
    pub command: Command,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Available CLI commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Build a wrapper and solve a batch of random samples
    Run {
        /// Path to the wrapper configuration (YAML or JSON).
        config_path: PathBuf,
        /// Number of samples to solve.
        samples: usize,
        /// Master seed for sample generation.
        seed: u64,
        /// Worker threads; `None` uses the available parallelism.
        workers: Option<usize>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the wrapper configuration.
        config_path: PathBuf,
    },
    /// Show help
    Help,
    /// Show version
    Version,
}

impl Args {
    /// Parse command-line arguments from an iterator.
    ///
    /// Accepts any iterator of strings, not just `std::env::args()`.
    #[must_use]
    pub fn parse_from<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::parse_from_vec(&args)
    }

    /// Parse command-line arguments from the environment.
    #[must_use]
    pub fn parse() -> Self {
        Self::parse_from(std::env::args())
    }

    fn parse_from_vec(args: &[String]) -> Self {
        let log_level = option_value(args, "--log-level")
            .or_else(|| option_value(args, "-l"))
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string();

        let command = match args.get(1).map(String::as_str) {
            None => Command::Help,
            Some("run") => Self::parse_run_command(args),
            Some("validate") => Self::parse_validate_command(args),
            Some("-h" | "--help" | "help") => Command::Help,
            Some("-V" | "--version" | "version") => Command::Version,
            Some(unknown) => {
                eprintln!("Unknown command: {unknown}");
                Command::Help
            }
        };

        Self { command, log_level }
    }

    /// Parse the 'run' command arguments.
    fn parse_run_command(args: &[String]) -> Command {
        let Some(path) = args.get(2).filter(|a| !a.starts_with('-')) else {
            eprintln!("Error: 'run' command requires a configuration path");
            return Command::Help;
        };

        let samples = option_value(args, "--samples")
            .or_else(|| option_value(args, "-n"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SAMPLES);
        let seed = option_value(args, "--seed")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SEED);
        let workers = option_value(args, "--workers")
            .or_else(|| option_value(args, "-w"))
            .and_then(|v| v.parse().ok());

        Command::Run {
            config_path: PathBuf::from(path),
            samples,
            seed,
            workers,
        }
    }

    /// Parse the 'validate' command arguments.
    fn parse_validate_command(args: &[String]) -> Command {
        let Some(path) = args.get(2).filter(|a| !a.starts_with('-')) else {
            eprintln!("Error: 'validate' command requires a configuration path");
            return Command::Help;
        };

        Command::Validate {
            config_path: PathBuf::from(path),
        }
    }
}

/// Value following `flag`, if any.
fn option_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}
