//! Store factory.
//!
//! Picks the backend family from the URI scheme:
//!
//! | Scheme | Backend |
//! |--------|---------|
//! | `postgres://`, `postgresql://` | [`PostgresBackend`](super::postgres::PostgresBackend) (feature `postgres`) |
//! | `sqlite:` | [`SqliteBackend`] |
//! | `redis://` | [`DocumentBackend::Collection`] (feature `redis`) |
//! | `file://` | [`DocumentBackend::Bucket`] |

use super::document::DocumentBackend;
use super::sqlite::SqliteBackend;
use super::store::Store;
use super::traits::KeyValueStore;
use crate::config::{BackendKind, StoreConfig};
use crate::{Error, Result};

/// Opens a store for `config`, dispatching on the URI scheme.
///
/// The store joins the shared connection pool for its `(uri, pool options)`
/// pair. Schema bootstrap runs on the first operation.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an unknown scheme or an unsupported
/// driver option, [`Error::FeatureNotEnabled`] when the backend was not
/// compiled in, or an operation error if the connection cannot be opened.
pub async fn open_store(config: StoreConfig) -> Result<Box<dyn KeyValueStore>> {
    let kind = config.backend_kind()?;
    tracing::debug!(backend = kind.as_str(), table = %config.table, "Opening store");

    match kind {
        BackendKind::Postgres => open_postgres(config).await,
        BackendKind::Sqlite => Ok(Box::new(Store::<SqliteBackend>::open(config).await?)),
        BackendKind::Collection | BackendKind::Bucket => {
            Ok(Box::new(Store::<DocumentBackend>::open(config).await?))
        },
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres(config: StoreConfig) -> Result<Box<dyn KeyValueStore>> {
    use super::postgres::PostgresBackend;
    Ok(Box::new(Store::<PostgresBackend>::open(config).await?))
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)]
async fn open_postgres(_config: StoreConfig) -> Result<Box<dyn KeyValueStore>> {
    Err(Error::FeatureNotEnabled("postgres".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Payload;

    #[tokio::test]
    async fn test_open_store_rejects_unknown_scheme() {
        let err = open_store(StoreConfig::new("mysql://localhost/db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_open_store_postgres_requires_feature() {
        let err = open_store(StoreConfig::new("postgres://localhost/db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::FeatureNotEnabled(_)));
    }

    #[tokio::test]
    async fn test_open_store_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite://{}", dir.path().join("factory.db").display());
        let store = open_store(StoreConfig::new(uri)).await.unwrap();
        assert_eq!(store.backend_name(), "sqlite");

        store.set("a", Payload::from("1")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        store.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_store_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().display());
        let store = open_store(StoreConfig::new(uri)).await.unwrap();
        assert_eq!(store.backend_name(), "bucket");
        store.disconnect().await.unwrap();
    }
}
