//! # kvbridge
//!
//! Namespaced, TTL-aware key-value store adapters.
//!
//! kvbridge lets a generic cache facade (expiring `key -> serialized value`
//! mapping, scoped by namespace) run on top of storage engines that do not
//! natively offer that shape: relational tables, document collections and
//! object buckets.
//!
//! ## Features
//!
//! - One async contract ([`KeyValueStore`]) for every backend
//! - `(key, namespace)` composite addressing with a unique index
//! - Idempotent schema bootstrap, safe to race across processes
//! - Keyset iteration that stays correct under concurrent deletes
//! - `expires` projection extracted from the stored payload, reaped on
//!   demand or on a timer
//! - Shared connection pools keyed by `(uri, options)`
//! - Offline migration of legacy `"ns:key"` rows into the namespace column
//!
//! ## Example
//!
//! ```rust,ignore
//! use kvbridge::{KeyValueStore, StoreConfig, open_store};
//!
//! let store = open_store(StoreConfig::new("sqlite::memory:").with_namespace("users")).await?;
//! store.set("users:42", r#"{"value":"ada","expires":null}"#.into()).await?;
//! let raw = store.get("users:42").await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod cli;
pub mod config;
pub mod migration;
pub mod observability;
pub mod storage;

// Re-exports for convenience
pub use config::{BackendKind, PoolOptions, StoreConfig};
pub use observability::{EventBus, StoreEvent};
pub use storage::{
    DocumentBackend, KeyValueStore, KeysetIterator, Payload, SqliteBackend, StorageBackend, Store,
    open_store,
};

/// Error type for kvbridge operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Unknown URI scheme, unsupported driver option, malformed config |
/// | `OperationFailed` | A query, command or filesystem call fails |
/// | `Bootstrap` | Schema bootstrap failed for this store instance |
/// | `Disconnected` | The store (or its shared pool) was disconnected |
/// | `FeatureNotEnabled` | A backend requires a compile-time feature |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - The connection URI scheme is not recognised
    /// - A driver option is not on the backend's allow-list
    /// - The config file contains invalid values
    /// - An operation is not available for the selected layout
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - A backend query or command fails (connectivity, constraint, I/O)
    /// - A pooled connection cannot be acquired
    /// - A migration transaction is rolled back
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Schema bootstrap failed; the store instance is unusable.
    ///
    /// The failure is cached, so every later operation on the same instance
    /// reports it without re-running DDL.
    #[error("schema bootstrap failed: {0}")]
    Bootstrap(String),

    /// The store was disconnected.
    ///
    /// Raised for every operation issued after `disconnect()` on this store
    /// or on any store sharing its pooled connection.
    #[error("store is disconnected")]
    Disconnected,

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

impl Error {
    /// Builds an [`Error::OperationFailed`] from an operation label and a cause.
    pub fn operation(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for kvbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in milliseconds.
///
/// Expiry values stored in payloads and in the `expires` column are epoch
/// milliseconds, so every comparison against "now" goes through this
/// function.
///
/// # Examples
///
/// ```rust
/// use kvbridge::current_timestamp_millis;
///
/// let ts = current_timestamp_millis();
/// assert!(ts > 1_600_000_000_000);
/// ```
#[must_use]
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
