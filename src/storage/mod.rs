//! Storage layer.
//!
//! Every backend family implements the primitive [`StorageBackend`]
//! contract; the shared [`Store`] adapter turns it into the uniform
//! [`KeyValueStore`] surface:
//!
//! - **Relational**: PostgreSQL (feature `postgres`) and `SQLite`
//! - **Document**: Redis collection (feature `redis`) and a local object bucket

// Allow significant_drop_tightening - dropping connection guards slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod document;
pub mod escape;
pub mod factory;
pub mod iterator;
pub mod namespace;
pub mod payload;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
mod reaper;
pub mod sqlite;
pub mod store;
pub mod traits;

pub use document::{BucketLayout, DocumentBackend, DocumentStore};
#[cfg(feature = "redis")]
pub use document::CollectionLayout;
pub use factory::open_store;
pub use iterator::KeysetIterator;
pub use namespace::Namespace;
pub use payload::{Payload, StoredEntry};
pub use pool::{PoolHandle, PoolKey, PoolManager, global_pools};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresBackend, PostgresStore};
pub use sqlite::{SqliteBackend, SqliteStore};
pub use store::Store;
pub use traits::{KeyValueStore, Page, PageSource, StorageBackend};

use std::sync::{Mutex, MutexGuard};

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. This prevents cascading
/// failures when one operation panics.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Mutex was poisoned, recovering");
            metrics::counter!("storage_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*acquire_lock(&mutex), 1);
    }
}
