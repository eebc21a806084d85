//! mlmc-wrapper CLI
//!
//! Command-line interface for running wrapper instances over the benchmark
//! scenario.

use std::process::ExitCode;

use mlmc_wrapper::cli::{parse_log_level, run_cli, Args};
use tracing_subscriber::FmtSubscriber;

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_log_level(&args.log_level))
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: failed to install log subscriber: {e}");
    }

    run_cli(args)
}
