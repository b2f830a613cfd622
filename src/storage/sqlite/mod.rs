//! `SQLite` backend.
//!
//! One table per store with columns `key`, `value`, `namespace`, `expires`
//! and a unique index on `(key, namespace)`. All statements are prepared
//! and cached; identifiers are quoted, values are always bound.

pub mod connection;
pub mod schema;

use self::connection::{SharedConnection, run_blocking};
use self::schema::SchemaSpec;
use super::escape::TableName;
use super::payload::StoredEntry;
use super::pool::{PoolConnection, PoolHandle, global_pools};
use super::store::Store;
use super::traits::{Page, StorageBackend};
use crate::config::StoreConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::params_from_iter;
use std::sync::Arc;

/// Maximum bound parameters per `IN (...)` list.
const IN_CHUNK: usize = 500;

/// A [`Store`] backed by `SQLite`.
pub type SqliteStore = Store<SqliteBackend>;

/// `SQLite` implementation of [`StorageBackend`].
#[derive(Debug)]
pub struct SqliteBackend {
    pool: PoolHandle,
    shared: SharedConnection,
    spec: Arc<SchemaSpec>,
    table: String,
}

impl SqliteBackend {
    /// Opens (or joins) the shared connection for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is not a `SQLite` URI or the database
    /// cannot be opened.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let pool = global_pools().acquire(config).await?;
        Self::with_pool(pool, config)
    }

    /// Builds a backend over an already acquired pool handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the handle is not a `SQLite` pool.
    pub fn with_pool(pool: PoolHandle, config: &StoreConfig) -> Result<Self> {
        let PoolConnection::Sqlite(shared) = pool.connection() else {
            return Err(Error::InvalidInput(
                "pool handle is not a SQLite connection".to_string(),
            ));
        };
        let shared = Arc::clone(shared);
        Ok(Self {
            pool,
            shared,
            spec: Arc::new(SchemaSpec {
                table: TableName::new(None, &config.table),
                key_length: config.key_length,
                namespace_length: config.namespace_length,
            }),
            table: config.table.clone(),
        })
    }

    /// Returns the shared connection.
    #[must_use]
    pub fn connection(&self) -> &SharedConnection {
        &self.shared
    }

    fn qualified(&self) -> String {
        self.spec.table.qualified()
    }
}

impl Store<SqliteBackend> {
    /// Opens a `SQLite` store. Bootstrap runs on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let backend = SqliteBackend::open(&config).await?;
        Ok(Self::new(backend, config))
    }
}

/// Renders `?{start}, ?{start+1}, ...` for `count` parameters.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn query_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::operation(operation, e)
}

/// Runs a `SELECT "key"[, "value"]` over chunks of `keys`.
fn select_in<T>(
    conn: &rusqlite::Connection,
    table: &str,
    columns: &str,
    namespace: &str,
    keys: &[String],
    operation: &'static str,
    map: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE \"namespace\" = ?1 AND \"key\" IN ({})",
            placeholders(2, chunk.len())
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(query_error(operation))?;
        let params = std::iter::once(namespace).chain(chunk.iter().map(String::as_str));
        let rows = stmt
            .query_map(params_from_iter(params), &map)
            .map_err(query_error(operation))?;
        for row in rows {
            out.push(row.map_err(query_error(operation))?);
        }
    }
    Ok(out)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<()> {
        let spec = Arc::clone(&self.spec);
        run_blocking(&self.shared, "sqlite_bootstrap", move |conn| {
            schema::bootstrap(conn, &spec)
        })
        .await
    }

    async fn get_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<(String, String)>> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        let keys = keys.to_vec();
        run_blocking(&self.shared, "sqlite_get_many", move |conn| {
            select_in(
                conn,
                &table,
                "\"key\", \"value\"",
                &namespace,
                &keys,
                "sqlite_get_many",
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    ))
                },
            )
        })
        .await
    }

    async fn upsert_many(&self, namespace: &str, entries: &[StoredEntry]) -> Result<()> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        let entries = entries.to_vec();
        run_blocking(&self.shared, "sqlite_upsert", move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(query_error("sqlite_upsert"))?;
            {
                let mut stmt = tx
                    .prepare_cached(&format!(
                        "INSERT INTO {table} (\"key\", \"value\", \"namespace\", \"expires\") \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT(\"key\", \"namespace\") DO UPDATE SET \
                         \"value\" = excluded.\"value\", \"expires\" = excluded.\"expires\""
                    ))
                    .map_err(query_error("sqlite_upsert"))?;
                for entry in &entries {
                    stmt.execute(rusqlite::params![
                        entry.key,
                        entry.value,
                        namespace,
                        entry.expires
                    ])
                    .map_err(query_error("sqlite_upsert"))?;
                }
            }
            tx.commit().map_err(query_error("sqlite_upsert"))
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        let key = key.to_string();
        run_blocking(&self.shared, "sqlite_delete", move |conn| {
            let removed = conn
                .prepare_cached(&format!(
                    "DELETE FROM {table} WHERE \"key\" = ?1 AND \"namespace\" = ?2"
                ))
                .and_then(|mut stmt| stmt.execute([&key, &namespace]))
                .map_err(query_error("sqlite_delete"))?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_many(&self, namespace: &str, keys: &[String]) -> Result<u64> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        let keys = keys.to_vec();
        run_blocking(&self.shared, "sqlite_delete_many", move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(query_error("sqlite_delete_many"))?;
            let mut removed = 0_u64;
            for chunk in keys.chunks(IN_CHUNK) {
                let sql = format!(
                    "DELETE FROM {table} WHERE \"namespace\" = ?1 AND \"key\" IN ({})",
                    placeholders(2, chunk.len())
                );
                let params =
                    std::iter::once(namespace.as_str()).chain(chunk.iter().map(String::as_str));
                let count = tx
                    .execute(&sql, params_from_iter(params))
                    .map_err(query_error("sqlite_delete_many"))?;
                removed += count as u64;
            }
            tx.commit().map_err(query_error("sqlite_delete_many"))?;
            Ok(removed)
        })
        .await
    }

    async fn has_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        let keys = keys.to_vec();
        run_blocking(&self.shared, "sqlite_has_many", move |conn| {
            select_in(
                conn,
                &table,
                "\"key\"",
                &namespace,
                &keys,
                "sqlite_has_many",
                |row| row.get::<_, String>(0),
            )
        })
        .await
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        run_blocking(&self.shared, "sqlite_clear", move |conn| {
            let removed = conn
                .execute(
                    &format!("DELETE FROM {table} WHERE \"namespace\" = ?1"),
                    [&namespace],
                )
                .map_err(query_error("sqlite_clear"))?;
            Ok(removed as u64)
        })
        .await
    }

    async fn clear_expired(&self, now: i64) -> Result<u64> {
        let table = self.qualified();
        run_blocking(&self.shared, "sqlite_clear_expired", move |conn| {
            let removed = conn
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE \"expires\" IS NOT NULL AND \"expires\" < ?1"
                    ),
                    [now],
                )
                .map_err(query_error("sqlite_clear_expired"))?;
            Ok(removed as u64)
        })
        .await
    }

    async fn page(&self, namespace: &str, cursor: Option<&str>, limit: usize) -> Result<Page> {
        let table = self.qualified();
        let namespace = namespace.to_string();
        let cursor = cursor.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        run_blocking(&self.shared, "sqlite_page", move |conn| {
            let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String)> {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                ))
            };
            let entries = match &cursor {
                None => {
                    let mut stmt = conn
                        .prepare_cached(&format!(
                            "SELECT \"key\", \"value\" FROM {table} \
                             WHERE \"namespace\" = ?1 ORDER BY \"key\" LIMIT ?2"
                        ))
                        .map_err(query_error("sqlite_page"))?;
                    stmt.query_map(rusqlite::params![namespace, limit], map)
                        .map_err(query_error("sqlite_page"))?
                        .collect::<rusqlite::Result<Vec<_>>>()
                },
                Some(cursor) => {
                    let mut stmt = conn
                        .prepare_cached(&format!(
                            "SELECT \"key\", \"value\" FROM {table} \
                             WHERE \"namespace\" = ?1 AND \"key\" > ?2 ORDER BY \"key\" LIMIT ?3"
                        ))
                        .map_err(query_error("sqlite_page"))?;
                    stmt.query_map(rusqlite::params![namespace, cursor, limit], map)
                        .map_err(query_error("sqlite_page"))?
                        .collect::<rusqlite::Result<Vec<_>>>()
                },
            }
            .map_err(query_error("sqlite_page"))?;
            Ok(Page::from_entries(entries))
        })
        .await
    }
}
