//! The shared adapter core.
//!
//! [`Store`] wraps one [`StorageBackend`] and provides everything the
//! backends have in common: namespace scoping, key-prefix handling,
//! `expires` extraction, result alignment, the bootstrap gate, the
//! disconnected state, metrics, spans and events.

use super::iterator::KeysetIterator;
use super::namespace::Namespace;
use super::payload::{Payload, StoredEntry};
use super::pool::global_pools;
use super::reaper;
use super::acquire_lock;
use super::traits::{KeyValueStore, Page, PageSource, StorageBackend};
use crate::config::StoreConfig;
use crate::observability::{EventBus, StoreEvent, record_operation_metrics, record_reaped};
use crate::{Error, Result, current_timestamp_millis};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, broadcast};
use tokio::task::JoinHandle;
use tracing::Instrument;

pub(super) struct StoreInner<B: StorageBackend> {
    backend: B,
    config: StoreConfig,
    namespace: Namespace,
    iteration_limit: usize,
    events: EventBus,
    bootstrap: OnceCell<std::result::Result<(), String>>,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<B: StorageBackend> Drop for StoreInner<B> {
    fn drop(&mut self) {
        if let Some(handle) = acquire_lock(&self.reaper).take() {
            handle.abort();
        }
    }
}

/// A namespaced key-value store over one backend.
///
/// Cloning is cheap; clones share the bootstrap state, the event bus and
/// the connection.
pub struct Store<B: StorageBackend> {
    inner: Arc<StoreInner<B>>,
}

impl<B: StorageBackend> Clone for Store<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: StorageBackend> std::fmt::Debug for Store<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.inner.backend.name())
            .field("table", &self.inner.backend.table())
            .field("namespace", &self.inner.namespace.as_str())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> Store<B> {
    /// Wraps a backend. No I/O happens until the first operation.
    #[must_use]
    pub fn new(backend: B, config: StoreConfig) -> Self {
        let namespace = Namespace::new(config.namespace.as_deref());
        let iteration_limit = config.effective_iteration_limit();
        Self {
            inner: Arc::new(StoreInner {
                backend,
                config,
                namespace,
                iteration_limit,
                events: EventBus::default(),
                bootstrap: OnceCell::new(),
                closed: AtomicBool::new(false),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Wraps a backend and runs the schema bootstrap immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bootstrap`] if the bootstrap fails.
    pub async fn connect(backend: B, config: StoreConfig) -> Result<Self> {
        let store = Self::new(backend, config);
        store.ready().await?;
        Ok(store)
    }

    pub(super) fn from_inner(inner: Arc<StoreInner<B>>) -> Self {
        Self { inner }
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Returns the configuration this store was built from.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns the loosely-typed option map projected from the configuration.
    #[must_use]
    pub fn options(&self) -> serde_json::Map<String, serde_json::Value> {
        self.inner.config.options()
    }

    /// Returns the event bus of this store.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribes to this store's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Returns true once this store or its shared connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.backend.pool().is_closed()
    }

    /// Waits for the schema bootstrap, running it if nobody has yet.
    ///
    /// The outcome is cached: after a failure every call reports the same
    /// [`Error::Bootstrap`] without re-running DDL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bootstrap`] if the bootstrap failed.
    pub async fn ready(&self) -> Result<()> {
        let outcome = self
            .inner
            .bootstrap
            .get_or_init(|| self.run_bootstrap())
            .await;
        outcome.clone().map_err(Error::Bootstrap)
    }

    async fn run_bootstrap(&self) -> std::result::Result<(), String> {
        let backend = self.inner.backend.name();
        let start = Instant::now();
        let result = self.inner.backend.bootstrap().await;
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics(backend, "bootstrap", start, status);

        match result {
            Ok(()) => {
                tracing::info!(
                    backend,
                    table = self.inner.backend.table(),
                    "Schema bootstrap complete"
                );
                self.inner.events.publish(StoreEvent::Bootstrapped {
                    backend,
                    table: self.inner.backend.table().to_string(),
                });
                if let Some(interval) = self.inner.config.clear_expired_interval
                    && let Err(e) = self.set_clear_expired_interval(Some(interval))
                {
                    tracing::warn!(backend, error = %e, "Failed to start expiry reaper");
                }
                Ok(())
            },
            Err(e) => {
                tracing::error!(backend, error = %e, "Schema bootstrap failed");
                self.inner.events.publish(StoreEvent::Error {
                    backend,
                    operation: "bootstrap",
                    message: e.to_string(),
                });
                Err(e.to_string())
            },
        }
    }

    /// Starts, replaces or stops the background expiry reaper.
    ///
    /// `None` or a zero interval stops it. The task holds only a weak
    /// reference, so it never keeps the store alive, and it also stops on
    /// `disconnect()`. Failures are published as [`StoreEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when enabling on a closed store, or
    /// [`Error::InvalidInput`] outside a tokio runtime.
    pub fn set_clear_expired_interval(&self, interval: Option<Duration>) -> Result<()> {
        let mut slot = acquire_lock(&self.inner.reaper);
        if let Some(handle) = slot.take() {
            handle.abort();
        }

        let Some(interval) = interval.filter(|d| !d.is_zero()) else {
            return Ok(());
        };
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidInput("the expiry reaper requires a tokio runtime".to_string())
        })?;

        let weak = Arc::downgrade(&self.inner);
        *slot = Some(runtime.spawn(reaper::run(weak, interval)));
        tracing::debug!(
            backend = self.inner.backend.name(),
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Expiry reaper scheduled"
        );
        Ok(())
    }

    /// Returns true while a background reaper task is scheduled.
    #[must_use]
    pub fn has_reaper(&self) -> bool {
        acquire_lock(&self.inner.reaper)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(super) fn publish_error(&self, operation: &'static str, error: &Error) {
        self.inner.events.publish(StoreEvent::Error {
            backend: self.inner.backend.name(),
            operation,
            message: error.to_string(),
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Runs one backend call behind the open check and the bootstrap gate,
    /// inside a span, recording metrics.
    pub(super) async fn run<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let backend = self.inner.backend.name();
        let span = tracing::debug_span!(
            "kvbridge.store",
            backend,
            operation,
            namespace = self.inner.namespace.as_str()
        );

        async move {
            self.ensure_open()?;
            self.ready().await?;
            self.ensure_open()?;

            let start = Instant::now();
            let result = call().await;
            let status = if result.is_ok() { "success" } else { "error" };
            record_operation_metrics(backend, operation, start, status);
            if let Err(e) = &result {
                tracing::debug!(error = %e, "Store operation failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    fn strip_all(&self, keys: &[String]) -> Vec<String> {
        let mut seen = HashSet::with_capacity(keys.len());
        keys.iter()
            .map(|key| self.inner.namespace.strip(key))
            .filter(|key| seen.insert(*key))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl<B: StorageBackend> KeyValueStore for Store<B> {
    fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    fn namespace(&self) -> &str {
        self.inner.namespace.as_str()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.inner.namespace.strip(key).to_string();
        let ns = self.inner.namespace.as_str();
        let rows = self
            .run("get", || {
                self.inner.backend.get_many(ns, std::slice::from_ref(&key))
            })
            .await?;
        Ok(rows
            .into_iter()
            .find_map(|(found, value)| (found == key).then_some(value)))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ns = self.inner.namespace.as_str();
        let lookup = self.strip_all(keys);
        let rows: HashMap<String, String> = self
            .run("get_many", || self.inner.backend.get_many(ns, &lookup))
            .await?
            .into_iter()
            .collect();
        Ok(keys
            .iter()
            .map(|key| rows.get(self.inner.namespace.strip(key)).cloned())
            .collect())
    }

    async fn set(&self, key: &str, value: Payload) -> Result<()> {
        let entry = StoredEntry::new(self.inner.namespace.strip(key), value);
        let ns = self.inner.namespace.as_str();
        self.run("set", || {
            self.inner
                .backend
                .upsert_many(ns, std::slice::from_ref(&entry))
        })
        .await
    }

    async fn set_many(&self, entries: Vec<(String, Payload)>) -> Result<()> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut positions: HashMap<String, usize> = HashMap::with_capacity(entries.len());
        let mut collapsed: Vec<StoredEntry> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let entry = StoredEntry::new(self.inner.namespace.strip(&key), value);
            if let Some(&index) = positions.get(&entry.key) {
                collapsed[index] = entry;
            } else {
                positions.insert(entry.key.clone(), collapsed.len());
                collapsed.push(entry);
            }
        }

        let ns = self.inner.namespace.as_str();
        self.run("set_many", || self.inner.backend.upsert_many(ns, &collapsed))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.inner.namespace.strip(key).to_string();
        let ns = self.inner.namespace.as_str();
        self.run("delete", || self.inner.backend.delete(ns, &key))
            .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<bool> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(false);
        }
        let ns = self.inner.namespace.as_str();
        let lookup = self.strip_all(keys);
        let removed = self
            .run("delete_many", || self.inner.backend.delete_many(ns, &lookup))
            .await?;
        Ok(removed > 0)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let key = self.inner.namespace.strip(key).to_string();
        let ns = self.inner.namespace.as_str();
        let found = self
            .run("has", || {
                self.inner.backend.has_many(ns, std::slice::from_ref(&key))
            })
            .await?;
        Ok(found.iter().any(|k| *k == key))
    }

    async fn has_many(&self, keys: &[String]) -> Result<Vec<bool>> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ns = self.inner.namespace.as_str();
        let lookup = self.strip_all(keys);
        let found: HashSet<String> = self
            .run("has_many", || self.inner.backend.has_many(ns, &lookup))
            .await?
            .into_iter()
            .collect();
        Ok(keys
            .iter()
            .map(|key| found.contains(self.inner.namespace.strip(key)))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let ns = self.inner.namespace.as_str();
        let removed = self
            .run("clear", || self.inner.backend.clear_namespace(ns))
            .await?;
        tracing::debug!(
            backend = self.inner.backend.name(),
            namespace = ns,
            removed,
            "Cleared namespace"
        );
        Ok(())
    }

    async fn clear_expired(&self) -> Result<u64> {
        let now = current_timestamp_millis();
        let removed = self
            .run("clear_expired", || self.inner.backend.clear_expired(now))
            .await?;
        let backend = self.inner.backend.name();
        record_reaped(backend, removed);
        if removed > 0 {
            tracing::info!(backend, removed, "Removed expired entries");
            self.inner
                .events
                .publish(StoreEvent::Reaped { backend, removed });
        }
        Ok(removed)
    }

    fn iterator(&self) -> KeysetIterator<'_> {
        KeysetIterator::new(self, self.inner.iteration_limit)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = acquire_lock(&self.inner.reaper).take() {
            handle.abort();
        }
        global_pools().release(self.inner.backend.pool().key());

        let backend = self.inner.backend.name();
        tracing::debug!(backend, "Store disconnected");
        self.inner
            .events
            .publish(StoreEvent::Disconnected { backend });
        Ok(())
    }
}

#[async_trait]
impl<B: StorageBackend> PageSource for Store<B> {
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page> {
        let ns = self.inner.namespace.as_str();
        let page = self
            .run("iterate", || self.inner.backend.page(ns, cursor, limit))
            .await?;
        Ok(Page {
            entries: page
                .entries
                .into_iter()
                .map(|(key, value)| (self.inner.namespace.attach(&key), value))
                .collect(),
            fetched: page.fetched,
            last_key: page.last_key,
        })
    }
}
