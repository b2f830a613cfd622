//! Legacy key migration for `SQLite`.

use super::{KeyRewrite, MigrationOptions, MigrationReport, ensure_no_conflicts};
use crate::storage::escape::TableName;
use crate::storage::sqlite::connection::{DatabaseLocation, configure_connection, parse_location};
use crate::storage::sqlite::schema::{self, SchemaSpec};
use crate::{Error, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeMap;

/// Rows still carrying the legacy `"<namespace>:<key>"` shape.
const LEGACY_ROWS: &str =
    "(\"namespace\" IS NULL OR \"namespace\" = '') AND instr(\"key\", ':') > 1";

fn query_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::operation(operation, e)
}

/// Migrates legacy prefixed keys in the `SQLite` database at `uri`.
///
/// `on_preview` receives the preview and conflicts while the transaction
/// is still open, before the rewrite is committed or rolled back.
///
/// # Errors
///
/// Returns an error if the database cannot be opened, the bootstrap fails,
/// any rewrite collides with an existing row, or the update fails. Nothing
/// is committed in the error case.
pub async fn migrate<F>(uri: &str, options: &MigrationOptions, on_preview: F) -> Result<MigrationReport>
where
    F: FnOnce(&MigrationReport) + Send + 'static,
{
    let location = parse_location(uri)?;
    let options = options.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = open(&location)?;
        migrate_connection(&mut conn, &options, on_preview)
    })
    .await
    .map_err(|e| Error::operation("sqlite_migrate", e))?
}

fn open(location: &DatabaseLocation) -> Result<Connection> {
    let conn = match location {
        DatabaseLocation::Memory => Connection::open_in_memory(),
        DatabaseLocation::File(path) => Connection::open(path),
    }
    .map_err(query_error("sqlite_open"))?;
    configure_connection(&conn, &BTreeMap::new())?;
    Ok(conn)
}

/// Runs the migration protocol on an open connection.
///
/// # Errors
///
/// See [`migrate`].
pub fn migrate_connection<F>(
    conn: &mut Connection,
    options: &MigrationOptions,
    on_preview: F,
) -> Result<MigrationReport>
where
    F: FnOnce(&MigrationReport),
{
    let spec = SchemaSpec {
        table: TableName::new(None, &options.table),
        key_length: options.key_length,
        namespace_length: options.namespace_length,
    };
    schema::bootstrap(conn, &spec)?;

    let table = spec.table.qualified();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(query_error("sqlite_migrate_begin"))?;

    let mut report = MigrationReport {
        preview: select_preview(&tx, &table)?,
        conflicts: select_conflicts(&tx, &table)?,
        ..MigrationReport::default()
    };
    for rewrite in &report.preview {
        tracing::debug!(%rewrite, "Legacy key");
    }
    on_preview(&report);

    if options.dry_run || report.preview.is_empty() {
        tx.rollback().map_err(query_error("sqlite_migrate_rollback"))?;
        report.log("sqlite", &options.table);
        return Ok(report);
    }

    // Dropping the transaction on any early return rolls it back.
    ensure_no_conflicts(&report.conflicts)?;
    let updated = tx
        .execute(
            &format!(
                "UPDATE {table} SET \
                 \"namespace\" = substr(\"key\", 1, instr(\"key\", ':') - 1), \
                 \"key\" = substr(\"key\", instr(\"key\", ':') + 1) \
                 WHERE {LEGACY_ROWS}"
            ),
            [],
        )
        .map_err(query_error("sqlite_migrate_update"))?;
    tx.commit().map_err(query_error("sqlite_migrate_commit"))?;

    report.applied = true;
    report.rows_updated = u64::try_from(updated).unwrap_or(u64::MAX);
    report.log("sqlite", &options.table);
    Ok(report)
}

fn select_preview(tx: &Transaction<'_>, table: &str) -> Result<Vec<KeyRewrite>> {
    let mut stmt = tx
        .prepare(&format!(
            "SELECT \"key\" FROM {table} WHERE {LEGACY_ROWS} ORDER BY \"key\""
        ))
        .map_err(query_error("sqlite_migrate_preview"))?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(query_error("sqlite_migrate_preview"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(query_error("sqlite_migrate_preview"))?;
    Ok(keys.iter().filter_map(|k| KeyRewrite::from_legacy(k)).collect())
}

fn select_conflicts(tx: &Transaction<'_>, table: &str) -> Result<Vec<KeyRewrite>> {
    let mut stmt = tx
        .prepare(&format!(
            "SELECT m.\"key\" FROM {table} AS m \
             WHERE (m.\"namespace\" IS NULL OR m.\"namespace\" = '') \
             AND instr(m.\"key\", ':') > 1 \
             AND EXISTS (\
               SELECT 1 FROM {table} AS e \
               WHERE e.\"namespace\" = substr(m.\"key\", 1, instr(m.\"key\", ':') - 1) \
               AND e.\"key\" = substr(m.\"key\", instr(m.\"key\", ':') + 1)) \
             ORDER BY m.\"key\""
        ))
        .map_err(query_error("sqlite_migrate_conflicts"))?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(query_error("sqlite_migrate_conflicts"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(query_error("sqlite_migrate_conflicts"))?;
    Ok(keys.iter().filter_map(|k| KeyRewrite::from_legacy(k)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_table(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE keyv (\"key\" VARCHAR(255) PRIMARY KEY, \"value\" TEXT);\
             INSERT INTO keyv VALUES ('users:1', 'a'), ('users:2', 'b'), \
             ('sessions:x:y', 'c'), ('plain', 'd'), (':odd', 'e');",
        )
        .unwrap();
    }

    fn rows(conn: &Connection) -> Vec<(String, String)> {
        let mut stmt = conn
            .prepare("SELECT \"namespace\", \"key\" FROM keyv ORDER BY \"namespace\", \"key\"")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_dry_run_keeps_data_but_applies_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        legacy_table(&conn);

        let options = MigrationOptions::default().with_dry_run(true);
        let report = migrate_connection(&mut conn, &options, |_| {}).unwrap();

        assert!(!report.applied);
        assert_eq!(report.preview.len(), 3);
        assert_eq!(report.preview[0].legacy_key, "sessions:x:y");
        assert_eq!(report.preview[0].key, "x:y");

        // Namespace column exists, data untouched.
        let namespaces: Vec<String> = rows(&conn).into_iter().map(|(ns, _)| ns).collect();
        assert!(namespaces.iter().all(String::is_empty));
    }

    #[test]
    fn test_preview_is_reported_before_commit() {
        let mut conn = Connection::open_in_memory().unwrap();
        legacy_table(&conn);

        let mut legacy_at_preview = None;
        let report = migrate_connection(&mut conn, &MigrationOptions::default(), |preview| {
            assert!(!preview.applied);
            legacy_at_preview = Some(preview.preview.len());
        })
        .unwrap();
        assert_eq!(legacy_at_preview, Some(3));
        assert!(report.applied);
    }

    #[test]
    fn test_apply_splits_on_first_separator() {
        let mut conn = Connection::open_in_memory().unwrap();
        legacy_table(&conn);

        let report = migrate_connection(&mut conn, &MigrationOptions::default(), |_| {}).unwrap();
        assert!(report.applied);
        assert_eq!(report.rows_updated, 3);
        assert_eq!(
            rows(&conn),
            vec![
                (String::new(), ":odd".to_string()),
                (String::new(), "plain".to_string()),
                ("sessions".to_string(), "x:y".to_string()),
                ("users".to_string(), "1".to_string()),
                ("users".to_string(), "2".to_string()),
            ]
        );

        // Re-running is a no-op.
        let again = migrate_connection(&mut conn, &MigrationOptions::default(), |_| {}).unwrap();
        assert!(again.preview.is_empty());
        assert_eq!(again.rows_updated, 0);
    }

    #[test]
    fn test_conflict_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        legacy_table(&conn);
        migrate_connection(&mut conn, &MigrationOptions::default().with_dry_run(true), |_| {}).unwrap();
        conn.execute(
            "INSERT INTO keyv (\"key\", \"value\", \"namespace\") VALUES ('1', 'new', 'users')",
            [],
        )
        .unwrap();

        let mut shown = None;
        let err = migrate_connection(&mut conn, &MigrationOptions::default(), |preview| {
            shown = Some(preview.clone());
        })
        .unwrap_err();
        assert!(err.to_string().contains("migration_conflict"));

        // The conflicting rows were reported before the run was refused.
        let shown = shown.unwrap();
        assert_eq!(shown.preview.len(), 3);
        assert_eq!(shown.conflicts.len(), 1);
        assert_eq!(shown.conflicts[0].legacy_key, "users:1");
        assert!(!shown.applied);

        let legacy: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM keyv WHERE \"namespace\" = '' AND instr(\"key\", ':') > 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(legacy, 3);
    }
}
