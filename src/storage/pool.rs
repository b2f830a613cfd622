//! Process-wide connection pool registry.
//!
//! Pools are keyed by `(uri, pool options)`. Every store built from an equal
//! pair shares one [`PoolHandle`]; releasing the pair closes it for all of
//! them.

use crate::config::{BackendKind, StoreConfig};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::OnceCell;

use super::sqlite::connection::SharedConnection;

/// Identity of a pooled connection: the URI plus the serialized options.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    uri: String,
    options: String,
}

impl PoolKey {
    /// Builds the key for a store configuration.
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            uri: config.uri().to_string(),
            options: config.pool.cache_key(),
        }
    }
}

impl std::fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URI may carry credentials.
        f.debug_struct("PoolKey")
            .field("uri", &"<redacted>")
            .field("options", &self.options)
            .finish()
    }
}

/// The live connection behind a pool handle.
pub enum PoolConnection {
    /// PostgreSQL connection pool.
    #[cfg(feature = "postgres")]
    Postgres(deadpool_postgres::Pool),
    /// Shared `SQLite` connection.
    Sqlite(SharedConnection),
    /// Multiplexed Redis connection.
    #[cfg(feature = "redis")]
    Redis(redis::aio::ConnectionManager),
    /// Root directory of the object store.
    Bucket(PathBuf),
}

impl PoolConnection {
    const fn kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => BackendKind::Postgres,
            Self::Sqlite(_) => BackendKind::Sqlite,
            #[cfg(feature = "redis")]
            Self::Redis(_) => BackendKind::Collection,
            Self::Bucket(_) => BackendKind::Bucket,
        }
    }
}

struct PoolInner {
    key: PoolKey,
    connection: PoolConnection,
    closed: AtomicBool,
}

/// Shared handle to one pooled connection.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("key", &self.inner.key)
            .field("kind", &self.inner.connection.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PoolHandle {
    /// Wraps a freshly opened connection.
    #[must_use]
    pub fn new(key: PoolKey, connection: PoolConnection) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                key,
                connection,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the registry key of this handle.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// Returns the underlying connection.
    #[must_use]
    pub fn connection(&self) -> &PoolConnection {
        &self.inner.connection
    }

    /// Returns true once the handle has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fails with [`Error::Disconnected`] once the handle has been released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the handle is closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Closes the connection. Only the first call has any effect.
    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.inner.connection {
            #[cfg(feature = "postgres")]
            PoolConnection::Postgres(pool) => pool.close(),
            PoolConnection::Sqlite(shared) => {
                let connection = super::acquire_lock(shared).take();
                if let Some(connection) = connection
                    && let Err((_, e)) = connection.close()
                {
                    tracing::warn!(error = %e, "Failed to close SQLite connection");
                }
            },
            // Dropping the last clone closes the multiplexed connection.
            #[cfg(feature = "redis")]
            PoolConnection::Redis(_) => {},
            PoolConnection::Bucket(_) => {},
        }
        metrics::counter!("storage_pools_closed_total", "backend" => self.inner.connection.kind().as_str())
            .increment(1);
    }
}

type PoolCell = Arc<OnceCell<PoolHandle>>;

/// Registry of shared pools.
#[derive(Default)]
pub struct PoolManager {
    pools: Mutex<HashMap<PoolKey, PoolCell>>,
}

static GLOBAL_POOLS: OnceLock<PoolManager> = OnceLock::new();

/// Returns the process-wide pool registry.
#[must_use]
pub fn global_pools() -> &'static PoolManager {
    GLOBAL_POOLS.get_or_init(PoolManager::default)
}

impl PoolManager {
    /// Returns the shared handle for a configuration, opening it on first use.
    ///
    /// Concurrent first calls for the same key open exactly one connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the connection
    /// cannot be opened. A failed open is not cached.
    pub async fn acquire(&self, config: &StoreConfig) -> Result<PoolHandle> {
        let kind = config.backend_kind()?;
        config.pool.validate(kind)?;
        let key = PoolKey::from_config(config);

        let cell = {
            let mut pools = self.lock();
            Arc::clone(pools.entry(key.clone()).or_default())
        };

        let opened = cell
            .get_or_try_init(|| {
                let key = key.clone();
                async move {
                    let connection = open_connection(kind, config).await?;
                    tracing::debug!(backend = kind.as_str(), "Opened pooled connection");
                    metrics::counter!("storage_pools_opened_total", "backend" => kind.as_str())
                        .increment(1);
                    Ok::<_, Error>(PoolHandle::new(key, connection))
                }
            })
            .await;

        match opened {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                let mut pools = self.lock();
                let stale = pools
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell) && current.get().is_none());
                if stale {
                    pools.remove(&key);
                }
                Err(e)
            },
        }
    }

    /// Closes and evicts the handle for `key`, if present.
    pub fn release(&self, key: &PoolKey) {
        let removed = self.lock().remove(key);
        if let Some(handle) = removed.as_ref().and_then(|cell| cell.get()) {
            handle.close();
        }
    }

    /// Closes and evicts every cached handle.
    pub fn release_all(&self) {
        let drained: Vec<PoolCell> = self.lock().drain().map(|(_, cell)| cell).collect();
        for cell in drained {
            if let Some(handle) = cell.get() {
                handle.close();
            }
        }
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true when no pools are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, PoolCell>> {
        super::acquire_lock(&self.pools)
    }
}

async fn open_connection(kind: BackendKind, config: &StoreConfig) -> Result<PoolConnection> {
    match kind {
        BackendKind::Postgres => {
            #[cfg(feature = "postgres")]
            {
                super::postgres::open_pool(config).map(PoolConnection::Postgres)
            }
            #[cfg(not(feature = "postgres"))]
            {
                Err(Error::FeatureNotEnabled("postgres".to_string()))
            }
        },
        BackendKind::Sqlite => super::sqlite::connection::open_shared(config)
            .await
            .map(PoolConnection::Sqlite),
        BackendKind::Collection => {
            #[cfg(feature = "redis")]
            {
                super::document::collection::open_manager(config)
                    .await
                    .map(PoolConnection::Redis)
            }
            #[cfg(not(feature = "redis"))]
            {
                Err(Error::FeatureNotEnabled("redis".to_string()))
            }
        },
        BackendKind::Bucket => {
            super::document::bucket::root_from_uri(config.uri()).map(PoolConnection::Bucket)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config(app: &str) -> StoreConfig {
        StoreConfig::new("sqlite::memory:")
            .with_pool(crate::PoolOptions::default().with_driver_option("busy_timeout", app))
    }

    #[tokio::test]
    async fn test_acquire_shares_handle_for_equal_config() {
        let manager = PoolManager::default();
        let a = manager.acquire(&memory_config("1001")).await.unwrap();
        let b = manager.acquire(&memory_config("1001")).await.unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(manager.len(), 1);

        let c = manager.acquire(&memory_config("1002")).await.unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_opens_one_pool() {
        let manager = Arc::new(PoolManager::default());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                manager.acquire(&memory_config("1003")).await.unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0].inner, &w[1].inner)));
    }

    #[tokio::test]
    async fn test_release_closes_for_every_sharer() {
        let manager = PoolManager::default();
        let config = memory_config("1004");
        let a = manager.acquire(&config).await.unwrap();
        let b = manager.acquire(&config).await.unwrap();

        manager.release(a.key());
        assert!(a.is_closed());
        assert!(matches!(b.ensure_open(), Err(Error::Disconnected)));
        assert!(manager.is_empty());

        // Second release is a no-op.
        manager.release(b.key());

        // A fresh acquire opens a new pool.
        let c = manager.acquire(&config).await.unwrap();
        assert!(!c.is_closed());
    }

    #[tokio::test]
    async fn test_release_all() {
        let manager = PoolManager::default();
        let a = manager.acquire(&memory_config("1005")).await.unwrap();
        let b = manager.acquire(&memory_config("1006")).await.unwrap();
        manager.release_all();
        assert!(a.is_closed() && b.is_closed());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_rejects_unknown_driver_option() {
        let manager = PoolManager::default();
        let config = StoreConfig::new("sqlite::memory:")
            .with_pool(crate::PoolOptions::default().with_driver_option("application_name", "x"));
        assert!(matches!(
            manager.acquire(&config).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let manager = PoolManager::default();
        let config = memory_config("soon");
        assert!(matches!(
            manager.acquire(&config).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);

        let healthy = manager.acquire(&memory_config("1007")).await.unwrap();
        assert!(!healthy.is_closed());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_pool_key_debug_redacts_uri() {
        let key = PoolKey::from_config(&StoreConfig::new("postgres://u:hunter2@db/x"));
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}
