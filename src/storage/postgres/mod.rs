//! PostgreSQL backend.
//!
//! Uses a `deadpool-postgres` pool. Multi-row writes go through `UNNEST`
//! so a batch is one statement; multi-key reads use `= ANY($n)`.

pub mod schema;

use self::schema::SchemaSpec;
use super::escape::TableName;
use super::payload::StoredEntry;
use super::pool::{PoolConnection, PoolHandle, global_pools};
use super::store::Store;
use super::traits::{Page, StorageBackend};
use crate::config::StoreConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime, TargetSessionAttrs};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_postgres::NoTls;

/// Default maximum connections in pool.
const DEFAULT_POOL_MAX_SIZE: usize = 10;

/// A [`Store`] backed by PostgreSQL.
pub type PostgresStore = Store<PostgresBackend>;

/// Helper to map pool errors.
fn pool_error(e: impl std::fmt::Display) -> Error {
    Error::operation("postgres_get_client", e)
}

/// Helper to map query errors.
fn query_error(operation: &'static str) -> impl Fn(tokio_postgres::Error) -> Error {
    move |e| Error::operation(operation, e)
}

#[cfg(unix)]
fn host_to_string(h: &tokio_postgres::config::Host) -> String {
    match h {
        tokio_postgres::config::Host::Tcp(s) => s.clone(),
        tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
    }
}

#[cfg(not(unix))]
fn host_to_string(h: &tokio_postgres::config::Host) -> String {
    let tokio_postgres::config::Host::Tcp(s) = h;
    s.clone()
}

/// Builds a deadpool config from a parsed connection URI.
fn build_pool_config(config: &tokio_postgres::Config, pool_max_size: Option<usize>) -> Config {
    let mut cfg = Config::new();
    cfg.host = config.get_hosts().first().map(host_to_string);
    cfg.port = config.get_ports().first().copied();
    cfg.user = config.get_user().map(String::from);
    cfg.password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string());
    cfg.dbname = config.get_dbname().map(String::from);
    cfg.application_name = config.get_application_name().map(String::from);
    cfg.options = config.get_options().map(String::from);
    cfg.connect_timeout = config.get_connect_timeout().copied();

    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: pool_max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE),
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(Duration::from_secs(5)),
            create: Some(Duration::from_secs(5)),
            recycle: Some(Duration::from_secs(5)),
        },
        ..Default::default()
    });
    cfg.manager = Some(deadpool_postgres::ManagerConfig {
        recycling_method: deadpool_postgres::RecyclingMethod::Fast,
    });
    cfg
}

fn parse_seconds(name: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::InvalidInput(format!("{name} must be whole seconds, got '{raw}'")))
}

/// Applies allow-listed driver options on top of the URI settings.
fn apply_driver_options(cfg: &mut Config, options: &BTreeMap<String, String>) -> Result<()> {
    for (name, raw) in options {
        match name.as_str() {
            "application_name" => cfg.application_name = Some(raw.clone()),
            "options" => cfg.options = Some(raw.clone()),
            "connect_timeout" => cfg.connect_timeout = Some(parse_seconds(name, raw)?),
            "keepalives_idle" => cfg.keepalives_idle = Some(parse_seconds(name, raw)?),
            "keepalives" => {
                cfg.keepalives = Some(match raw.trim() {
                    "1" | "true" | "on" => true,
                    "0" | "false" | "off" => false,
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "keepalives must be a boolean, got '{other}'"
                        )));
                    },
                });
            },
            "target_session_attrs" => {
                cfg.target_session_attrs = Some(match raw.trim() {
                    "any" => TargetSessionAttrs::Any,
                    "read-write" => TargetSessionAttrs::ReadWrite,
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "unsupported target_session_attrs '{other}'"
                        )));
                    },
                });
            },
            other => {
                return Err(Error::InvalidInput(format!(
                    "driver option '{other}' is not supported by the postgres backend"
                )));
            },
        }
    }
    Ok(())
}

/// Opens a connection pool for `config`. No connection is made until the
/// first checkout.
///
/// # Errors
///
/// Returns an error if the URI or driver options are invalid.
pub fn open_pool(config: &StoreConfig) -> Result<Pool> {
    let pg: tokio_postgres::Config = config
        .uri()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid postgres URI: {e}")))?;
    let mut cfg = build_pool_config(&pg, config.pool.max_size);
    apply_driver_options(&mut cfg, &config.pool.driver_options)?;
    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| Error::operation("postgres_create_pool", e))
}

/// PostgreSQL implementation of [`StorageBackend`].
pub struct PostgresBackend {
    handle: PoolHandle,
    pool: Pool,
    spec: SchemaSpec,
    table: String,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("handle", &self.handle)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Opens (or joins) the shared pool for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let handle = global_pools().acquire(config).await?;
        Self::with_pool(handle, config)
    }

    /// Builds a backend over an already acquired pool handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the handle is not a PostgreSQL pool.
    pub fn with_pool(handle: PoolHandle, config: &StoreConfig) -> Result<Self> {
        let PoolConnection::Postgres(pool) = handle.connection() else {
            return Err(Error::InvalidInput(
                "pool handle is not a PostgreSQL pool".to_string(),
            ));
        };
        let pool = pool.clone();
        Ok(Self {
            handle,
            pool,
            spec: schema_spec(config),
            table: config.table.clone(),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.handle.ensure_open()?;
        self.pool.get().await.map_err(pool_error)
    }

    fn qualified(&self) -> String {
        self.spec.table.qualified()
    }
}

/// Builds the schema layout for a store configuration.
#[must_use]
pub fn schema_spec(config: &StoreConfig) -> SchemaSpec {
    SchemaSpec {
        table: TableName::new(config.schema.as_deref(), &config.table),
        key_length: config.key_length,
        namespace_length: config.namespace_length,
        unlogged: config.unlogged,
    }
}

impl Store<PostgresBackend> {
    /// Opens a PostgreSQL store. Bootstrap runs on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let backend = PostgresBackend::open(&config).await?;
        Ok(Self::new(backend, config))
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn pool(&self) -> &PoolHandle {
        &self.handle
    }

    async fn bootstrap(&self) -> Result<()> {
        let client = self.client().await?;
        schema::bootstrap(&client, &self.spec).await
    }

    async fn get_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<(String, String)>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT \"key\", \"value\" FROM {} WHERE \"namespace\" = $1 AND \"key\" = ANY($2)",
            self.qualified()
        );
        let rows = client
            .query(&sql, &[&namespace, &keys])
            .await
            .map_err(query_error("postgres_get_many"))?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<_, String>(0),
                    row.get::<_, Option<String>>(1).unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn upsert_many(&self, namespace: &str, entries: &[StoredEntry]) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO {} (\"key\", \"value\", \"namespace\", \"expires\") \
             SELECT k, v, $3::varchar, e \
             FROM UNNEST($1::varchar[], $2::text[], $4::int8[]) AS u(k, v, e) \
             ON CONFLICT (\"key\", \"namespace\") DO UPDATE SET \
             \"value\" = EXCLUDED.\"value\", \"expires\" = EXCLUDED.\"expires\"",
            self.qualified()
        );
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        let values: Vec<&str> = entries.iter().map(|e| e.value.as_str()).collect();
        let expires: Vec<Option<i64>> = entries.iter().map(|e| e.expires).collect();
        client
            .execute(&sql, &[&keys, &values, &namespace, &expires])
            .await
            .map_err(query_error("postgres_upsert"))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let client = self.client().await?;
        let sql = format!(
            "DELETE FROM {} WHERE \"key\" = $1 AND \"namespace\" = $2",
            self.qualified()
        );
        let removed = client
            .execute(&sql, &[&key, &namespace])
            .await
            .map_err(query_error("postgres_delete"))?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, namespace: &str, keys: &[String]) -> Result<u64> {
        let client = self.client().await?;
        let sql = format!(
            "DELETE FROM {} WHERE \"namespace\" = $1 AND \"key\" = ANY($2)",
            self.qualified()
        );
        client
            .execute(&sql, &[&namespace, &keys])
            .await
            .map_err(query_error("postgres_delete_many"))
    }

    async fn has_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT \"key\" FROM {} WHERE \"namespace\" = $1 AND \"key\" = ANY($2)",
            self.qualified()
        );
        let rows = client
            .query(&sql, &[&namespace, &keys])
            .await
            .map_err(query_error("postgres_has_many"))?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let client = self.client().await?;
        let sql = format!("DELETE FROM {} WHERE \"namespace\" = $1", self.qualified());
        client
            .execute(&sql, &[&namespace])
            .await
            .map_err(query_error("postgres_clear"))
    }

    async fn clear_expired(&self, now: i64) -> Result<u64> {
        let client = self.client().await?;
        let sql = format!(
            "DELETE FROM {} WHERE \"expires\" IS NOT NULL AND \"expires\" < $1",
            self.qualified()
        );
        client
            .execute(&sql, &[&now])
            .await
            .map_err(query_error("postgres_clear_expired"))
    }

    async fn page(&self, namespace: &str, cursor: Option<&str>, limit: usize) -> Result<Page> {
        let client = self.client().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let table = self.qualified();
        let rows = match cursor {
            None => {
                let sql = format!(
                    "SELECT \"key\", \"value\" FROM {table} \
                     WHERE \"namespace\" = $1 ORDER BY \"key\" LIMIT $2"
                );
                client.query(&sql, &[&namespace, &limit]).await
            },
            Some(cursor) => {
                let sql = format!(
                    "SELECT \"key\", \"value\" FROM {table} \
                     WHERE \"namespace\" = $1 AND \"key\" > $2 ORDER BY \"key\" LIMIT $3"
                );
                client.query(&sql, &[&namespace, &cursor, &limit]).await
            },
        }
        .map_err(query_error("postgres_page"))?;

        Ok(Page::from_entries(
            rows.iter()
                .map(|row| {
                    (
                        row.get::<_, String>(0),
                        row.get::<_, Option<String>>(1).unwrap_or_default(),
                    )
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_pool_config_from_uri() {
        let pg: tokio_postgres::Config = "postgres://svc:pw@db.internal:6543/cache?application_name=web"
            .parse()
            .unwrap();
        let cfg = build_pool_config(&pg, Some(4));
        assert_eq!(cfg.host.as_deref(), Some("db.internal"));
        assert_eq!(cfg.port, Some(6543));
        assert_eq!(cfg.dbname.as_deref(), Some("cache"));
        assert_eq!(cfg.application_name.as_deref(), Some("web"));
        assert_eq!(cfg.pool.map(|p| p.max_size), Some(4));
    }

    #[test]
    fn test_apply_driver_options() {
        let mut cfg = Config::new();
        let mut options = BTreeMap::new();
        options.insert("connect_timeout".to_string(), "3".to_string());
        options.insert("keepalives".to_string(), "on".to_string());
        options.insert("target_session_attrs".to_string(), "read-write".to_string());
        apply_driver_options(&mut cfg, &options).unwrap();
        assert_eq!(cfg.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(cfg.keepalives, Some(true));
    }

    #[test]
    fn test_apply_driver_options_rejects_bad_values() {
        let mut cfg = Config::new();
        let mut options = BTreeMap::new();
        options.insert("keepalives".to_string(), "maybe".to_string());
        assert!(apply_driver_options(&mut cfg, &options).is_err());
    }

    #[tokio::test]
    async fn test_open_pool_is_lazy() {
        // Nothing listens here; creating the pool must still succeed.
        let config = StoreConfig::new("postgres://nobody@127.0.0.1:1/none");
        assert!(open_pool(&config).is_ok());
    }
}
