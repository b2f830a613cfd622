//! Store contracts.
//!
//! [`KeyValueStore`] is the uniform surface callers use. [`StorageBackend`]
//! is the smaller primitive surface each backend family implements; the
//! shared [`Store`](super::Store) adapter turns one into the other.

use super::iterator::KeysetIterator;
use super::payload::{Payload, StoredEntry};
use super::pool::PoolHandle;
use crate::Result;
use async_trait::async_trait;

/// Namespaced, TTL-aware key-value store.
///
/// Keys may carry the caller-side `"<namespace>:"` prefix; it is stripped
/// before storage and re-attached on iteration. Reads return the stored
/// payload text unmodified.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the backend name (`postgres`, `sqlite`, `collection`, `bucket`).
    fn backend_name(&self) -> &'static str;

    /// Returns the namespace this store is scoped to (`""` when unset).
    fn namespace(&self) -> &str;

    /// Reads one entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Reads several entries; the result is aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Inserts or replaces one entry.
    async fn set(&self, key: &str, value: Payload) -> Result<()>;

    /// Inserts or replaces several entries. Later duplicates win.
    async fn set_many(&self, entries: Vec<(String, Payload)>) -> Result<()>;

    /// Deletes one entry, reporting whether this call removed it.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes several entries, reporting whether any was removed.
    async fn delete_many(&self, keys: &[String]) -> Result<bool>;

    /// Checks whether an entry exists.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Checks several entries; the result is aligned with `keys`.
    async fn has_many(&self, keys: &[String]) -> Result<Vec<bool>>;

    /// Removes every entry in this store's namespace.
    async fn clear(&self) -> Result<()>;

    /// Removes every entry whose expiry has passed, returning the count.
    async fn clear_expired(&self) -> Result<u64>;

    /// Starts a fresh keyset iteration over this namespace.
    fn iterator(&self) -> KeysetIterator<'_>;

    /// Releases the shared connection. Later calls fail with
    /// [`Error::Disconnected`](crate::Error::Disconnected).
    async fn disconnect(&self) -> Result<()>;
}

/// One page of a keyset scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Live `(key, value)` rows in ascending key order.
    pub entries: Vec<(String, String)>,
    /// Number of index entries scanned, including stale ones that were
    /// skipped. Compared against the limit to detect the last page.
    pub fetched: usize,
    /// Last key scanned; the cursor for the next page.
    pub last_key: Option<String>,
}

impl Page {
    /// Builds a page where every scanned row was live.
    #[must_use]
    pub fn from_entries(entries: Vec<(String, String)>) -> Self {
        let fetched = entries.len();
        let last_key = entries.last().map(|(key, _)| key.clone());
        Self {
            entries,
            fetched,
            last_key,
        }
    }
}

/// Source of pages for a [`KeysetIterator`].
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches up to `limit` rows with keys strictly greater than `cursor`.
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page>;
}

/// Primitive operations a backend family provides.
///
/// Keys passed here are already stripped of the namespace prefix and the
/// namespace is already normalized. Input slices are never empty.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Backend name used in logs, metrics and events.
    fn name(&self) -> &'static str;

    /// Table, collection or bucket name.
    fn table(&self) -> &str;

    /// The pooled connection this backend uses.
    fn pool(&self) -> &PoolHandle;

    /// Creates or upgrades the backing schema. Must be safe to re-run and
    /// to race with other processes doing the same.
    async fn bootstrap(&self) -> Result<()>;

    /// Returns the `(key, value)` pairs that exist, in any order.
    async fn get_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<(String, String)>>;

    /// Upserts entries atomically per entry. Keys are unique within `entries`.
    async fn upsert_many(&self, namespace: &str, entries: &[StoredEntry]) -> Result<()>;

    /// Deletes one entry, returning true iff this call removed a row.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Deletes entries, returning the number removed by this call.
    async fn delete_many(&self, namespace: &str, keys: &[String]) -> Result<u64>;

    /// Returns the subset of `keys` that exist, in any order.
    async fn has_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>>;

    /// Deletes every entry in `namespace`.
    async fn clear_namespace(&self, namespace: &str) -> Result<u64>;

    /// Deletes every entry (any namespace) whose expiry is before `now`.
    async fn clear_expired(&self, now: i64) -> Result<u64>;

    /// Fetches one keyset page of `namespace`.
    async fn page(
        &self,
        namespace: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page>;
}
