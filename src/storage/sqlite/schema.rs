//! Idempotent `SQLite` schema bootstrap.
//!
//! Every step can be re-run and can race with another process running the
//! same sequence; "already applied" failures are recognised and ignored.

use crate::storage::escape::{TableName, quote_identifier};
use crate::{Error, Result};
use rusqlite::{Connection, TransactionBehavior};

/// Column and index layout parameters.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    /// Target table.
    pub table: TableName,
    /// Maximum key length.
    pub key_length: u32,
    /// Maximum namespace length.
    pub namespace_length: u32,
}

impl SchemaSpec {
    fn create_table_sql(&self, target: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {target} (\
             \"key\" VARCHAR({key_len}) NOT NULL, \
             \"value\" TEXT, \
             \"namespace\" VARCHAR({ns_len}) NOT NULL DEFAULT '', \
             \"expires\" BIGINT)",
            key_len = self.key_length,
            ns_len = self.namespace_length,
        )
    }
}

/// Returns true for errors meaning "someone already applied this step".
#[must_use]
pub fn is_already_applied(err: &rusqlite::Error) -> bool {
    let message = err.to_string();
    message.contains("duplicate column name")
        || message.contains("already exists")
        || message.contains("no such index")
}

fn tolerate(conn: &Connection, sql: &str, step: &'static str) -> Result<()> {
    match conn.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if is_already_applied(&e) => {
            tracing::debug!(step, "Schema step already applied");
            Ok(())
        },
        Err(e) => Err(Error::operation(step, e)),
    }
}

/// Creates or upgrades the table to the current shape.
///
/// # Errors
///
/// Returns an error for any failure other than an already-applied step.
pub fn bootstrap(conn: &mut Connection, spec: &SchemaSpec) -> Result<()> {
    let table = spec.table.qualified();

    // 1. Current shape.
    tolerate(
        conn,
        &spec.create_table_sql(&table),
        "sqlite_create_table",
    )?;

    // 2. Namespace column on tables created before namespaces existed.
    tolerate(
        conn,
        &format!(
            "ALTER TABLE {table} ADD COLUMN \"namespace\" VARCHAR({}) NOT NULL DEFAULT ''",
            spec.namespace_length
        ),
        "sqlite_add_namespace",
    )?;

    // 3. Uniqueness on key alone.
    drop_key_only_uniqueness(conn, spec)?;

    // 4. Composite uniqueness.
    tolerate(
        conn,
        &format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} (\"key\", \"namespace\")",
            spec.table.derived("key_namespace_idx")
        ),
        "sqlite_create_key_namespace_index",
    )?;

    // 5. Expiry projection.
    tolerate(
        conn,
        &format!("ALTER TABLE {table} ADD COLUMN \"expires\" BIGINT"),
        "sqlite_add_expires",
    )?;

    // 6. Expiry index.
    tolerate(
        conn,
        &format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} (\"expires\")",
            spec.table.derived("expires_idx")
        ),
        "sqlite_create_expires_index",
    )?;

    Ok(())
}

/// Uniqueness enforced on `key` alone, by kind.
#[derive(Debug, Default, PartialEq, Eq)]
struct KeyOnlyUniqueness {
    /// Droppable `CREATE UNIQUE INDEX` indexes.
    indexes: Vec<String>,
    /// A primary key or table constraint; needs a table rebuild.
    needs_rebuild: bool,
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| Error::operation("sqlite_table_info", e))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))
        .map_err(|e| Error::operation("sqlite_table_info", e))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::operation("sqlite_table_info", e))
}

fn inspect_key_uniqueness(conn: &Connection, table: &str) -> Result<KeyOnlyUniqueness> {
    let mut found = KeyOnlyUniqueness::default();

    let pk: Vec<String> = table_columns(conn, table)?
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, _)| name)
        .collect();
    if pk == ["key"] {
        found.needs_rebuild = true;
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table})"))
        .map_err(|e| Error::operation("sqlite_index_list", e))?;
    let indexes = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(|e| Error::operation("sqlite_index_list", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::operation("sqlite_index_list", e))?;

    for (name, unique, origin) in indexes {
        if unique == 0 {
            continue;
        }
        let mut info = conn
            .prepare(&format!(
                "PRAGMA index_info({})",
                quote_identifier(&name)
            ))
            .map_err(|e| Error::operation("sqlite_index_info", e))?;
        let columns = info
            .query_map([], |row| row.get::<_, String>(2))
            .map_err(|e| Error::operation("sqlite_index_info", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::operation("sqlite_index_info", e))?;
        if columns != ["key"] {
            continue;
        }
        if origin == "c" {
            found.indexes.push(name);
        } else {
            found.needs_rebuild = true;
        }
    }

    Ok(found)
}

fn drop_key_only_uniqueness(conn: &mut Connection, spec: &SchemaSpec) -> Result<()> {
    let table = spec.table.qualified();
    let found = inspect_key_uniqueness(conn, &table)?;

    for index in &found.indexes {
        tracing::info!(index = %index, "Dropping key-only unique index");
        tolerate(
            conn,
            &format!(
                "DROP INDEX IF EXISTS {}",
                quote_identifier(index)
            ),
            "sqlite_drop_key_index",
        )?;
    }

    if found.needs_rebuild {
        rebuild_table(conn, spec)?;
    }
    Ok(())
}

/// Rebuilds a table whose primary key (or inline unique constraint) is
/// `key` alone, which `SQLite` cannot drop in place.
fn rebuild_table(conn: &mut Connection, spec: &SchemaSpec) -> Result<()> {
    let table = spec.table.qualified();
    let staging = spec.table.derived("rebuild");

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| Error::operation("sqlite_rebuild_begin", e))?;

    // Another process may have finished the rebuild while we waited.
    if !inspect_key_uniqueness(&tx, &table)?.needs_rebuild {
        return Ok(());
    }

    let has_expires = table_columns(&tx, &table)?
        .iter()
        .any(|(name, _)| name == "expires");
    let expires = if has_expires { "\"expires\"" } else { "NULL" };

    tracing::info!(table = spec.table.name(), "Rebuilding table with key-only primary key");
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {staging};\
         {create};\
         INSERT INTO {staging} (\"key\", \"value\", \"namespace\", \"expires\") \
         SELECT \"key\", \"value\", COALESCE(\"namespace\", ''), {expires} FROM {table};\
         DROP TABLE {table};\
         ALTER TABLE {staging} RENAME TO {name};",
        create = spec.create_table_sql(&staging),
        name = quote_identifier(spec.table.name()),
    ))
    .map_err(|e| Error::operation("sqlite_rebuild_table", e))?;

    tx.commit()
        .map_err(|e| Error::operation("sqlite_rebuild_commit", e))
}
