//! Idempotent PostgreSQL schema bootstrap.

use crate::storage::escape::{TableName, quote_identifier};
use crate::{Error, Result};
use tokio_postgres::error::SqlState;

/// Column and index layout parameters.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    /// Target table (optionally schema-qualified).
    pub table: TableName,
    /// Maximum key length.
    pub key_length: u32,
    /// Maximum namespace length.
    pub namespace_length: u32,
    /// Create the table `UNLOGGED`.
    pub unlogged: bool,
}

/// SQLSTATE codes meaning "someone already applied this step".
const ALREADY_APPLIED: &[SqlState] = &[
    SqlState::DUPLICATE_COLUMN,
    SqlState::DUPLICATE_TABLE,
    SqlState::DUPLICATE_OBJECT,
    SqlState::DUPLICATE_SCHEMA,
    SqlState::UNDEFINED_OBJECT,
    // Concurrent CREATE ... IF NOT EXISTS can collide in the catalogs.
    SqlState::UNIQUE_VIOLATION,
];

/// Returns true for errors meaning "someone already applied this step".
#[must_use]
pub fn is_already_applied(err: &tokio_postgres::Error) -> bool {
    err.code().is_some_and(|code| ALREADY_APPLIED.contains(code))
}

async fn tolerate(client: &tokio_postgres::Client, sql: &str, step: &'static str) -> Result<()> {
    match client.batch_execute(sql).await {
        Ok(()) => Ok(()),
        Err(e) if is_already_applied(&e) => {
            tracing::debug!(step, code = ?e.code(), "Schema step already applied");
            Ok(())
        },
        Err(e) => Err(Error::operation(step, e)),
    }
}

/// Renders the ordered bootstrap statements.
#[must_use]
pub fn statements(spec: &SchemaSpec) -> Vec<(&'static str, String)> {
    let table = spec.table.qualified();
    let mut steps = Vec::with_capacity(8);

    if let Some(schema) = spec.table.schema() {
        steps.push((
            "postgres_create_schema",
            format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_identifier(schema)
            ),
        ));
    }

    steps.push((
        "postgres_create_table",
        format!(
            "CREATE {unlogged}TABLE IF NOT EXISTS {table} (\
             \"key\" VARCHAR({key_len}) NOT NULL, \
             \"value\" TEXT, \
             \"namespace\" VARCHAR({ns_len}) NOT NULL DEFAULT '', \
             \"expires\" BIGINT)",
            unlogged = if spec.unlogged { "UNLOGGED " } else { "" },
            key_len = spec.key_length,
            ns_len = spec.namespace_length,
        ),
    ));
    steps.push((
        "postgres_add_namespace",
        format!(
            "ALTER TABLE {table} ADD COLUMN \"namespace\" VARCHAR({}) NOT NULL DEFAULT ''",
            spec.namespace_length
        ),
    ));
    steps.push((
        "postgres_drop_primary_key",
        format!(
            "ALTER TABLE {table} DROP CONSTRAINT {}",
            spec.table.derived("pkey")
        ),
    ));
    steps.push((
        "postgres_drop_key_unique",
        format!(
            "ALTER TABLE {table} DROP CONSTRAINT {}",
            spec.table.derived("key_key")
        ),
    ));
    steps.push((
        "postgres_create_key_namespace_index",
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} (\"key\", \"namespace\")",
            spec.table.derived("key_namespace_idx")
        ),
    ));
    steps.push((
        "postgres_add_expires",
        format!("ALTER TABLE {table} ADD COLUMN \"expires\" BIGINT"),
    ));
    steps.push((
        "postgres_create_expires_index",
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} (\"expires\")",
            spec.table.derived("expires_idx")
        ),
    ));

    steps
}

/// Creates or upgrades the table to the current shape.
///
/// Each statement runs on its own so a tolerated failure in one step does
/// not abort the rest.
///
/// # Errors
///
/// Returns an error for any failure other than an already-applied step.
pub async fn bootstrap(client: &tokio_postgres::Client, spec: &SchemaSpec) -> Result<()> {
    for (step, sql) in statements(spec) {
        tolerate(client, &sql, step).await?;
    }
    Ok(())
}
