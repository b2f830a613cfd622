//! Legacy key migration for PostgreSQL.

use super::{KeyRewrite, MigrationOptions, MigrationReport, ensure_no_conflicts};
use crate::storage::escape::TableName;
use crate::storage::postgres::schema::{self, SchemaSpec};
use crate::{Error, Result};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Transaction};

/// Rows still carrying the legacy `"<namespace>:<key>"` shape.
const LEGACY_ROWS: &str =
    "(\"namespace\" IS NULL OR \"namespace\" = '') AND strpos(\"key\", ':') > 1";

fn query_error(operation: &'static str) -> impl Fn(tokio_postgres::Error) -> Error {
    move |e| {
        if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            Error::operation("migration_conflict", e)
        } else {
            Error::operation(operation, e)
        }
    }
}

/// Migrates legacy prefixed keys in the PostgreSQL database at `uri`.
///
/// `on_preview` receives the preview and conflicts while the transaction
/// is still open, before the rewrite is committed or rolled back.
///
/// # Errors
///
/// Returns an error if the connection fails, the bootstrap fails, any
/// rewrite collides with an existing row, or the update fails. Nothing is
/// committed in the error case.
pub async fn migrate<F>(uri: &str, options: &MigrationOptions, on_preview: F) -> Result<MigrationReport>
where
    F: FnOnce(&MigrationReport) + Send + 'static,
{
    let (mut client, connection) = tokio_postgres::connect(uri, NoTls)
        .await
        .map_err(|e| Error::operation("postgres_connect", e))?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "PostgreSQL migration connection closed with error");
        }
    });

    let result = migrate_client(&mut client, options, on_preview).await;
    drop(client);
    let _ = driver.await;
    result
}

/// Runs the migration protocol on a connected client.
///
/// # Errors
///
/// See [`migrate`].
pub async fn migrate_client<F>(
    client: &mut Client,
    options: &MigrationOptions,
    on_preview: F,
) -> Result<MigrationReport>
where
    F: FnOnce(&MigrationReport),
{
    let spec = SchemaSpec {
        table: TableName::new(options.schema.as_deref(), &options.table),
        key_length: options.key_length,
        namespace_length: options.namespace_length,
        unlogged: false,
    };
    schema::bootstrap(client, &spec).await?;

    let table = spec.table.qualified();
    let tx = client
        .transaction()
        .await
        .map_err(query_error("postgres_migrate_begin"))?;

    let mut report = MigrationReport {
        preview: select_keys(
            &tx,
            &format!("SELECT \"key\" FROM {table} WHERE {LEGACY_ROWS} ORDER BY \"key\""),
            "postgres_migrate_preview",
        )
        .await?,
        conflicts: select_keys(&tx, &conflicts_sql(&table), "postgres_migrate_conflicts").await?,
        ..MigrationReport::default()
    };
    for rewrite in &report.preview {
        tracing::debug!(%rewrite, "Legacy key");
    }
    on_preview(&report);

    if options.dry_run || report.preview.is_empty() {
        tx.rollback()
            .await
            .map_err(query_error("postgres_migrate_rollback"))?;
        report.log("postgres", &options.table);
        return Ok(report);
    }

    // Dropping the transaction on any early return rolls it back.
    ensure_no_conflicts(&report.conflicts)?;
    let updated = tx
        .execute(
            &format!(
                "UPDATE {table} SET \
                 \"namespace\" = split_part(\"key\", ':', 1), \
                 \"key\" = substr(\"key\", strpos(\"key\", ':') + 1) \
                 WHERE {LEGACY_ROWS}"
            ),
            &[],
        )
        .await
        .map_err(query_error("postgres_migrate_update"))?;
    tx.commit()
        .await
        .map_err(query_error("postgres_migrate_commit"))?;

    report.applied = true;
    report.rows_updated = updated;
    report.log("postgres", &options.table);
    Ok(report)
}

fn conflicts_sql(table: &str) -> String {
    format!(
        "SELECT m.\"key\" FROM {table} AS m \
         WHERE (m.\"namespace\" IS NULL OR m.\"namespace\" = '') \
         AND strpos(m.\"key\", ':') > 1 \
         AND EXISTS (\
           SELECT 1 FROM {table} AS e \
           WHERE e.\"namespace\" = split_part(m.\"key\", ':', 1) \
           AND e.\"key\" = substr(m.\"key\", strpos(m.\"key\", ':') + 1)) \
         ORDER BY m.\"key\""
    )
}

async fn select_keys(
    tx: &Transaction<'_>,
    sql: &str,
    operation: &'static str,
) -> Result<Vec<KeyRewrite>> {
    let rows = tx.query(sql, &[]).await.map_err(query_error(operation))?;
    Ok(rows
        .iter()
        .filter_map(|row| KeyRewrite::from_legacy(row.get::<_, &str>(0)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_sql_uses_first_separator() {
        let sql = conflicts_sql("\"keyv\"");
        assert!(sql.contains("split_part(m.\"key\", ':', 1)"));
        assert!(sql.contains("strpos(m.\"key\", ':') + 1"));
    }
}
