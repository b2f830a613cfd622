//! Binary entry point for kvbridge.
//!
//! This binary provides the operator CLI: legacy key migration and expiry
//! reaping.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

mod commands;

use clap::Parser;
use kvbridge::cli::{Cli, Commands, load_config};
use kvbridge::observability;
use std::process::ExitCode;

use commands::{cmd_migrate, cmd_reap};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = observability::init_from_env(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run_command(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
async fn run_command(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate(args) => cmd_migrate(args).await,
        Commands::Reap(args) => {
            let base = load_config(cli.config.as_deref())?;
            cmd_reap(args, base).await
        },
    }
}
