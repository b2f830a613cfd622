//! CLI definitions.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `migrate` | Move legacy `"ns:key"` prefixes into the namespace column |
//! | `reap` | Remove expired entries once, or on an interval |
//!
//! # Example Usage
//!
//! ```bash
//! # Preview a SQLite migration
//! kvbridge migrate sqlite --uri sqlite://cache.db --dry-run
//!
//! # Reap a PostgreSQL table every 60 seconds, exposing Prometheus metrics
//! kvbridge reap --uri postgres://localhost/app --watch 60 --metrics-addr 127.0.0.1:9464
//! ```

mod migrate;
mod reap;

pub use migrate::{MigrateArgs, MigrateBackend, run_migration};
pub use reap::{ReapArgs, ReapSummary, run_reap};

use crate::Result;
use crate::config::StoreConfig;
use clap::{Parser, Subcommand};
use std::path::Path;

/// kvbridge - namespaced, TTL-aware key-value store adapters.
#[derive(Debug, Parser)]
#[command(name = "kvbridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Migrate legacy prefixed keys into the namespace column.
    Migrate(MigrateArgs),

    /// Remove expired entries.
    Reap(ReapArgs),
}

/// Loads the store configuration for a CLI run.
///
/// An explicit path must exist; otherwise the default locations are tried.
/// Environment overrides apply either way.
///
/// # Errors
///
/// Returns an error if a config file exists but cannot be loaded.
pub fn load_config(path: Option<&str>) -> Result<Option<StoreConfig>> {
    let config = match path {
        Some(path) => Some(StoreConfig::load_from_file(Path::new(path))?),
        None => StoreConfig::load_default()?,
    };
    Ok(config.map(StoreConfig::with_env_overrides))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_migrate() {
        let cli = Cli::try_parse_from([
            "kvbridge",
            "--verbose",
            "migrate",
            "sqlite",
            "--uri",
            "sqlite://cache.db",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Migrate(args) = cli.command else {
            panic!("expected migrate");
        };
        assert_eq!(args.backend, MigrateBackend::Sqlite);
        assert!(args.dry_run);
        assert_eq!(args.table, "keyv");
    }

    #[test]
    fn test_parse_reap_watch() {
        let cli = Cli::try_parse_from([
            "kvbridge",
            "reap",
            "--uri",
            "file:///tmp/kv",
            "--namespace",
            "users",
            "--watch",
            "30",
        ])
        .unwrap();
        let Commands::Reap(args) = cli.command else {
            panic!("expected reap");
        };
        assert_eq!(args.watch, Some(30));
        assert_eq!(args.namespace.as_deref(), Some("users"));
    }

    #[test]
    fn test_load_config_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "uri = \"sqlite://x.db\"\ntable = \"cache\"\n").unwrap();

        let config = load_config(path.to_str()).unwrap().unwrap();
        assert_eq!(config.table, "cache");
    }

    #[test]
    fn test_load_config_missing_explicit_path_fails() {
        assert!(load_config(Some("/nonexistent/kvbridge.toml")).is_err());
    }
}
