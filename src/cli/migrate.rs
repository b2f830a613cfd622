//! `kvbridge migrate`.

use crate::config::{DEFAULT_KEY_LENGTH, DEFAULT_NAMESPACE_LENGTH, DEFAULT_TABLE};
use crate::migration::{MigrationOptions, MigrationReport};
use crate::Result;
use clap::{Args, ValueEnum};

/// Backends the migration supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MigrateBackend {
    /// PostgreSQL (requires the `postgres` feature).
    Postgres,
    /// `SQLite`.
    Sqlite,
}

/// Arguments of `kvbridge migrate`.
#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Backend to migrate.
    #[arg(value_enum)]
    pub backend: MigrateBackend,

    /// Connection URI.
    #[arg(long, env = "KVBRIDGE_URI", hide_env_values = true)]
    pub uri: String,

    /// Table to migrate.
    #[arg(long, default_value = DEFAULT_TABLE)]
    pub table: String,

    /// PostgreSQL schema.
    #[arg(long)]
    pub schema: Option<String>,

    /// Maximum key length for created columns.
    #[arg(long, default_value_t = DEFAULT_KEY_LENGTH)]
    pub key_length: u32,

    /// Maximum namespace length for created columns.
    #[arg(long, default_value_t = DEFAULT_NAMESPACE_LENGTH)]
    pub namespace_length: u32,

    /// Print the preview and roll back.
    #[arg(long)]
    pub dry_run: bool,
}

impl MigrateArgs {
    /// Builds the migration options.
    #[must_use]
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            table: self.table.clone(),
            schema: self.schema.clone(),
            key_length: self.key_length,
            namespace_length: self.namespace_length,
            dry_run: self.dry_run,
        }
    }
}

/// Runs the migration selected by `args`.
///
/// `on_preview` is called with the preview and conflicts before the
/// rewrite is committed, including on runs that then fail on a conflict.
///
/// # Errors
///
/// Returns [`Error::FeatureNotEnabled`](crate::Error::FeatureNotEnabled) for PostgreSQL without the
/// `postgres` feature, or any migration error.
pub async fn run_migration<F>(args: &MigrateArgs, on_preview: F) -> Result<MigrationReport>
where
    F: FnOnce(&MigrationReport) + Send + 'static,
{
    let options = args.options();
    tracing::info!(
        backend = ?args.backend,
        table = %options.table,
        dry_run = options.dry_run,
        "Starting legacy key migration"
    );
    match args.backend {
        MigrateBackend::Sqlite => {
            crate::migration::sqlite::migrate(&args.uri, &options, on_preview).await
        },
        MigrateBackend::Postgres => {
            #[cfg(feature = "postgres")]
            {
                crate::migration::postgres::migrate(&args.uri, &options, on_preview).await
            }
            #[cfg(not(feature = "postgres"))]
            {
                drop(on_preview);
                Err(crate::Error::FeatureNotEnabled("postgres".to_string()))
            }
        },
    }
}
