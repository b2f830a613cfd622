//! Configuration management.
//!
//! Every backend is configured through one explicit [`StoreConfig`]. Options
//! forwarded to the database driver live in a single
//! [`PoolOptions::driver_options`] bag that is checked against a per-backend
//! allow-list, so nothing reaches the driver by accident.

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default table / collection / bucket name.
pub const DEFAULT_TABLE: &str = "keyv";

/// Default maximum key length for relational schemas.
pub const DEFAULT_KEY_LENGTH: u32 = 255;

/// Default maximum namespace length for relational schemas.
pub const DEFAULT_NAMESPACE_LENGTH: u32 = 255;

/// Default page size for keyset iteration.
pub const DEFAULT_ITERATION_LIMIT: usize = 10;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "KVBRIDGE_CONFIG_PATH";

/// Backend family selected by the connection URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// PostgreSQL (`postgres://`, `postgresql://`).
    Postgres,
    /// `SQLite` (`sqlite://path`, `sqlite::memory:`).
    Sqlite,
    /// Document collection layout on Redis (`redis://`, `rediss://`).
    Collection,
    /// Document bucket layout on a local object directory (`file://`).
    Bucket,
}

impl BackendKind {
    /// Detects the backend from a connection URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown scheme.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let scheme = uri
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();

        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            "redis" | "rediss" => Ok(Self::Collection),
            "file" => Ok(Self::Bucket),
            _ => Err(Error::InvalidInput(format!(
                "unsupported connection scheme '{scheme}'"
            ))),
        }
    }

    /// Returns the backend name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::Collection => "collection",
            Self::Bucket => "bucket",
        }
    }

    /// Driver options this backend accepts in [`PoolOptions::driver_options`].
    #[must_use]
    pub const fn allowed_driver_options(self) -> &'static [&'static str] {
        match self {
            Self::Postgres => &[
                "application_name",
                "connect_timeout",
                "keepalives",
                "keepalives_idle",
                "options",
                "target_session_attrs",
            ],
            Self::Sqlite => &["busy_timeout", "journal_mode", "synchronous"],
            Self::Collection | Self::Bucket => &[],
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection pool options.
///
/// Together with the URI these identify a shared pool: two stores built with
/// equal `PoolOptions` against the same URI share one pooled connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in the pool (PostgreSQL only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    /// Extra options forwarded to the driver, checked against an allow-list.
    #[serde(default)]
    pub driver_options: BTreeMap<String, String>,
}

impl PoolOptions {
    /// Adds a driver option.
    #[must_use]
    pub fn with_driver_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver_options.insert(key.into(), value.into());
        self
    }

    /// Rejects driver options the backend does not know.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first unknown option.
    pub fn validate(&self, kind: BackendKind) -> Result<()> {
        let allowed = kind.allowed_driver_options();
        if let Some(unknown) = self
            .driver_options
            .keys()
            .find(|key| !allowed.contains(&key.as_str()))
        {
            return Err(Error::InvalidInput(format!(
                "driver option '{unknown}' is not supported by the {kind} backend"
            )));
        }
        Ok(())
    }

    /// Deterministic serialization used as part of the pool cache key.
    ///
    /// `driver_options` is a `BTreeMap`, so equal option sets serialize
    /// identically regardless of insertion order.
    #[must_use]
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Configuration for one store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URI (may carry credentials).
    uri: SecretString,
    /// Table, collection or bucket name.
    pub table: String,
    /// PostgreSQL schema holding the table.
    pub schema: Option<String>,
    /// Namespace scoping every operation. `None` is the default namespace.
    pub namespace: Option<String>,
    /// Maximum key length for relational schemas.
    pub key_length: u32,
    /// Maximum namespace length for relational schemas.
    pub namespace_length: u32,
    /// Page size for keyset iteration (0 means the default).
    pub iteration_limit: usize,
    /// Interval of the background expiry reaper.
    pub clear_expired_interval: Option<Duration>,
    /// Create PostgreSQL tables as `UNLOGGED`.
    pub unlogged: bool,
    /// Pool options.
    pub pool: PoolOptions,
}

impl StoreConfig {
    /// Creates a configuration with default values for the given URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: SecretString::from(uri.into()),
            table: DEFAULT_TABLE.to_string(),
            schema: None,
            namespace: None,
            key_length: DEFAULT_KEY_LENGTH,
            namespace_length: DEFAULT_NAMESPACE_LENGTH,
            iteration_limit: DEFAULT_ITERATION_LIMIT,
            clear_expired_interval: None,
            unlogged: false,
            pool: PoolOptions::default(),
        }
    }

    /// Returns the connection URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        self.uri.expose_secret()
    }

    /// Returns the backend selected by the URI scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown scheme.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        BackendKind::from_uri(self.uri())
    }

    /// Returns the effective iteration page size.
    #[must_use]
    pub const fn effective_iteration_limit(&self) -> usize {
        if self.iteration_limit == 0 {
            DEFAULT_ITERATION_LIMIT
        } else {
            self.iteration_limit
        }
    }

    /// Replaces the connection URI, keeping every other setting.
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = SecretString::from(uri.into());
        self
    }

    /// Sets the table / collection / bucket name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Sets the PostgreSQL schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the maximum key and namespace lengths.
    #[must_use]
    pub const fn with_lengths(mut self, key_length: u32, namespace_length: u32) -> Self {
        self.key_length = key_length;
        self.namespace_length = namespace_length;
        self
    }

    /// Sets the iteration page size.
    #[must_use]
    pub const fn with_iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = limit;
        self
    }

    /// Sets the background reaper interval.
    #[must_use]
    pub const fn with_clear_expired_interval(mut self, interval: Duration) -> Self {
        self.clear_expired_interval = Some(interval);
        self
    }

    /// Requests `UNLOGGED` PostgreSQL tables.
    #[must_use]
    pub const fn with_unlogged(mut self, unlogged: bool) -> Self {
        self.unlogged = unlogged;
        self
    }

    /// Sets the pool options.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Projects the configuration into a loosely-typed option map.
    ///
    /// Kept for callers that expect the historical `opts` bag. The map is
    /// derived on every call and is never written back. The URI is omitted
    /// because it may carry credentials.
    #[must_use]
    pub fn options(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        let dialect = self
            .backend_kind()
            .map_or_else(|_| "unknown", BackendKind::as_str);
        map.insert("dialect".into(), dialect.into());
        map.insert("table".into(), self.table.clone().into());
        if let Some(schema) = &self.schema {
            map.insert("schema".into(), schema.clone().into());
        }
        if let Some(namespace) = &self.namespace {
            map.insert("namespace".into(), namespace.clone().into());
        }
        map.insert("keyLength".into(), self.key_length.into());
        map.insert("namespaceLength".into(), self.namespace_length.into());
        map.insert(
            "iterationLimit".into(),
            self.effective_iteration_limit().into(),
        );
        if let Some(interval) = self.clear_expired_interval {
            let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            map.insert("clearExpiredInterval".into(), millis.into());
        }
        if let Some(max) = self.pool.max_size {
            map.insert("max".into(), max.into());
        }
        for (key, value) in &self.pool.driver_options {
            map.insert(key.clone(), value.clone().into());
        }
        map
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or has no URI.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let file: ConfigFile = toml::from_str(&contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;

        file.into_config()
    }

    /// Loads configuration from the default location.
    ///
    /// Checks, in order, `KVBRIDGE_CONFIG_PATH` and the platform config dir
    /// (`<config_dir>/kvbridge/config.toml`). Returns `None` when no file
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be loaded.
    pub fn load_default() -> Result<Option<Self>> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
            && !path.trim().is_empty()
        {
            return Self::load_from_file(Path::new(&path)).map(Some);
        }

        let Some(path) = default_config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    /// Applies `KVBRIDGE_URI`, `KVBRIDGE_NAMESPACE` and `KVBRIDGE_TABLE`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(uri) = non_empty_env("KVBRIDGE_URI") {
            self.uri = SecretString::from(uri);
        }
        if let Some(namespace) = non_empty_env("KVBRIDGE_NAMESPACE") {
            self.namespace = Some(namespace);
        }
        if let Some(table) = non_empty_env("KVBRIDGE_TABLE") {
            self.table = table;
        }
        self
    }
}

/// Returns the platform config file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("kvbridge").join("config.toml"))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Connection URI.
    pub uri: Option<String>,
    /// Table / collection / bucket name.
    pub table: Option<String>,
    /// PostgreSQL schema.
    pub schema: Option<String>,
    /// Namespace.
    pub namespace: Option<String>,
    /// Maximum key length.
    pub key_length: Option<u32>,
    /// Maximum namespace length.
    pub namespace_length: Option<u32>,
    /// Iteration page size.
    pub iteration_limit: Option<usize>,
    /// Reaper interval in seconds.
    pub clear_expired_interval_secs: Option<u64>,
    /// `UNLOGGED` PostgreSQL tables.
    pub unlogged: Option<bool>,
    /// Pool section.
    pub pool: Option<PoolOptions>,
}

impl ConfigFile {
    /// Converts the parsed file into a [`StoreConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `uri` is missing.
    pub fn into_config(self) -> Result<StoreConfig> {
        let uri = self
            .uri
            .ok_or_else(|| Error::InvalidInput("config file has no 'uri'".to_string()))?;
        let mut config = StoreConfig::new(uri);

        if let Some(table) = self.table {
            config.table = table;
        }
        config.schema = self.schema;
        config.namespace = self.namespace;
        if let Some(key_length) = self.key_length {
            config.key_length = key_length;
        }
        if let Some(namespace_length) = self.namespace_length {
            config.namespace_length = namespace_length;
        }
        if let Some(limit) = self.iteration_limit {
            config.iteration_limit = limit;
        }
        config.clear_expired_interval = self
            .clear_expired_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(unlogged) = self.unlogged {
            config.unlogged = unlogged;
        }
        if let Some(pool) = self.pool {
            config.pool = pool;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("postgres://u:p@localhost/db", BackendKind::Postgres)]
    #[test_case("postgresql://localhost/db", BackendKind::Postgres)]
    #[test_case("sqlite://cache.db", BackendKind::Sqlite)]
    #[test_case("sqlite::memory:", BackendKind::Sqlite)]
    #[test_case("redis://localhost:6379", BackendKind::Collection)]
    #[test_case("file:///var/cache/kv", BackendKind::Bucket)]
    fn test_backend_kind_from_uri(uri: &str, expected: BackendKind) {
        assert_eq!(BackendKind::from_uri(uri).unwrap(), expected);
    }

    #[test]
    fn test_backend_kind_rejects_unknown_scheme() {
        let err = BackendKind::from_uri("mysql://localhost/db").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("mysql")));
    }

    #[test]
    fn test_cache_key_ignores_insertion_order() {
        let a = PoolOptions::default()
            .with_driver_option("application_name", "svc")
            .with_driver_option("connect_timeout", "5");
        let b = PoolOptions::default()
            .with_driver_option("connect_timeout", "5")
            .with_driver_option("application_name", "svc");
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_validate_rejects_unknown_driver_option() {
        let pool = PoolOptions::default().with_driver_option("sslrootcert", "/tmp/ca");
        assert!(pool.validate(BackendKind::Postgres).is_err());

        let pool = PoolOptions::default().with_driver_option("busy_timeout", "1000");
        assert!(pool.validate(BackendKind::Sqlite).is_ok());
        assert!(pool.validate(BackendKind::Postgres).is_err());
    }

    #[test]
    fn test_options_projection_omits_uri() {
        let config = StoreConfig::new("postgres://user:secret@db/cache")
            .with_namespace("users")
            .with_iteration_limit(0);
        let opts = config.options();

        assert_eq!(opts["dialect"], "postgres");
        assert_eq!(opts["namespace"], "users");
        assert_eq!(opts["iterationLimit"], 10);
        assert!(!serde_json::Value::Object(opts).to_string().contains("secret"));
    }

    #[test]
    fn test_debug_redacts_uri() {
        let config = StoreConfig::new("postgres://user:hunter2@db/cache");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_config_file_into_config() {
        let file: ConfigFile = toml::from_str(
            r#"
            uri = "sqlite://cache.db"
            table = "cache"
            namespace = "sessions"
            clear_expired_interval_secs = 30

            [pool.driver_options]
            busy_timeout = "2000"
            "#,
        )
        .unwrap();

        let config = file.into_config().unwrap();
        assert_eq!(config.table, "cache");
        assert_eq!(config.namespace.as_deref(), Some("sessions"));
        assert_eq!(config.clear_expired_interval, Some(Duration::from_secs(30)));
        assert_eq!(
            config.pool.driver_options.get("busy_timeout").map(String::as_str),
            Some("2000")
        );
    }

    #[test]
    fn test_config_file_requires_uri() {
        let file: ConfigFile = toml::from_str("table = \"cache\"").unwrap();
        assert!(file.into_config().is_err());
    }
}
