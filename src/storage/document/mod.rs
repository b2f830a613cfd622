//! Document-store backends.
//!
//! Two layouts share one [`StorageBackend`] implementation:
//!
//! - **Collection**: Redis hashes with sorted-set indexes (`redis://`)
//! - **Bucket**: one JSON object per entry under a local directory (`file://`)

pub mod bucket;
#[cfg(feature = "redis")]
pub mod collection;

pub use bucket::{BucketLayout, ObjectMetadata, StoredObject};
#[cfg(feature = "redis")]
pub use collection::CollectionLayout;

use super::payload::StoredEntry;
use super::pool::{PoolHandle, global_pools};
use super::store::Store;
use super::traits::{Page, StorageBackend};
use crate::config::{BackendKind, StoreConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A [`Store`] backed by a document layout.
pub type DocumentStore = Store<DocumentBackend>;

/// Document-store implementation of [`StorageBackend`].
#[derive(Debug)]
pub enum DocumentBackend {
    /// Redis collection layout.
    #[cfg(feature = "redis")]
    Collection(CollectionLayout),
    /// Local object bucket layout.
    Bucket(BucketLayout),
}

impl DocumentBackend {
    /// Opens (or joins) the shared connection for `config` and picks the
    /// layout from the URI scheme. The table name is the collection or
    /// bucket name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a non-document URI, or
    /// [`Error::FeatureNotEnabled`] for Redis without the `redis` feature.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        match config.backend_kind()? {
            BackendKind::Bucket => {
                let handle = global_pools().acquire(config).await?;
                BucketLayout::with_pool(handle, &config.table).map(Self::Bucket)
            },
            #[cfg(feature = "redis")]
            BackendKind::Collection => {
                let handle = global_pools().acquire(config).await?;
                CollectionLayout::with_pool(handle, &config.table).map(Self::Collection)
            },
            #[cfg(not(feature = "redis"))]
            BackendKind::Collection => Err(Error::FeatureNotEnabled("redis".to_string())),
            kind => Err(Error::InvalidInput(format!(
                "'{kind}' is not a document store URI"
            ))),
        }
    }
}

#[async_trait]
impl StorageBackend for DocumentBackend {
    fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(_) => BackendKind::Collection.as_str(),
            Self::Bucket(_) => BackendKind::Bucket.as_str(),
        }
    }

    fn table(&self) -> &str {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.collection(),
            Self::Bucket(layout) => layout.bucket(),
        }
    }

    fn pool(&self) -> &PoolHandle {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.handle(),
            Self::Bucket(layout) => layout.handle(),
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.bootstrap().await,
            Self::Bucket(layout) => layout.bootstrap().await,
        }
    }

    async fn get_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<(String, String)>> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.get_many(namespace, keys).await,
            Self::Bucket(layout) => layout.get_many(namespace, keys).await,
        }
    }

    async fn upsert_many(&self, namespace: &str, entries: &[StoredEntry]) -> Result<()> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.upsert_many(namespace, entries).await,
            Self::Bucket(layout) => layout.upsert_many(namespace, entries).await,
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.delete(namespace, key).await,
            Self::Bucket(layout) => layout.delete(namespace, key).await,
        }
    }

    async fn delete_many(&self, namespace: &str, keys: &[String]) -> Result<u64> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.delete_many(namespace, keys).await,
            Self::Bucket(layout) => layout.delete_many(namespace, keys).await,
        }
    }

    async fn has_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.has_many(namespace, keys).await,
            Self::Bucket(layout) => layout.has_many(namespace, keys).await,
        }
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.clear_namespace(namespace).await,
            Self::Bucket(layout) => layout.clear_namespace(namespace).await,
        }
    }

    async fn clear_expired(&self, now: i64) -> Result<u64> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.clear_expired(now).await,
            Self::Bucket(layout) => layout.clear_expired(now).await,
        }
    }

    async fn page(&self, namespace: &str, cursor: Option<&str>, limit: usize) -> Result<Page> {
        match self {
            #[cfg(feature = "redis")]
            Self::Collection(layout) => layout.page(namespace, cursor, limit).await,
            Self::Bucket(layout) => layout.page(namespace, cursor, limit).await,
        }
    }
}

impl Store<DocumentBackend> {
    /// Opens a document store. Bootstrap runs on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is not a document URI or the connection
    /// cannot be opened.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let backend = DocumentBackend::open(&config).await?;
        Ok(Self::new(backend, config))
    }

    /// Deletes every object, in any namespace, not read or written for at
    /// least `max_age`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for the collection layout, which
    /// does not track access times.
    pub async fn clear_unused_for(&self, max_age: Duration) -> Result<u64> {
        self.run("clear_unused", || async {
            match self.backend() {
                #[cfg(feature = "redis")]
                DocumentBackend::Collection(_) => Err(Error::InvalidInput(
                    "clear_unused_for requires the bucket layout".to_string(),
                )),
                DocumentBackend::Bucket(layout) => layout.clear_unused_for(max_age).await,
            }
        })
        .await
    }
}
