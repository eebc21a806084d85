//! CLI module for mlmc-wrapper.
//!
//! All CLI logic lives here so it can be tested; `main.rs` only parses the
//! arguments, installs the log subscriber and calls [`run_cli`].

mod args;
mod commands;
mod output;

pub use args::{Args, Command, DEFAULT_LOG_LEVEL, DEFAULT_SAMPLES, DEFAULT_SEED};
pub use commands::{execute_run, parse_log_level, run_cli, run_samples, validate_config};
pub use output::{print_config_summary, print_help, print_run_summary, print_version, RunSummary};

#[cfg(test)]
mod tests;
