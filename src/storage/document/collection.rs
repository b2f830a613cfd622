//! Collection layout on Redis.
//!
//! Each entry is a hash `{collection}:doc:{id}` with fields `key`, `value`,
//! `namespace` and `expiresAt`, where `id` is `{ns_len}:{ns}:{key}` so that
//! namespaces containing `:` never collide. Two sorted sets make up the
//! indexes:
//!
//! - `{collection}:keys:{ns_len}:{ns}`: every key of a namespace, score 0,
//!   read with `ZRANGEBYLEX` for keyset pages in byte order
//! - `{collection}:expires`: entry ids scored by `expiresAt`
//!
//! Documents with a future expiry also get `PEXPIREAT`, so Redis drops them
//! on its own; index members left behind are skipped and pruned lazily.

use crate::config::StoreConfig;
use crate::storage::payload::StoredEntry;
use crate::storage::pool::{PoolConnection, PoolHandle};
use crate::storage::traits::Page;
use crate::{Error, Result, current_timestamp_millis};
use redis::aio::ConnectionManager;

/// Schema version recorded in `{collection}:meta`.
pub const LAYOUT_VERSION: u32 = 1;

/// Members handled per command when scanning an index.
const SCAN_CHUNK: isize = 500;

/// Reaps one chunk of the expiry index.
///
/// `KEYS[1]` is the expiry index; `ARGV` holds the exclusive cutoff, the
/// chunk size and the collection name. Returns `{scanned, removed}` where
/// `removed` counts only documents that still existed.
const REAP_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local removed = 0
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  removed = removed + redis.call('DEL', ARGV[3] .. ':doc:' .. id)
  local sep = string.find(id, ':', 1, true)
  if sep then
    local len = tonumber(string.sub(id, 1, sep - 1))
    if len then
      local namespace = string.sub(id, sep + 1, sep + len)
      local key = string.sub(id, sep + len + 2)
      redis.call('ZREM', ARGV[3] .. ':keys:' .. len .. ':' .. namespace, key)
    end
  end
end
return {#ids, removed}
";

fn redis_error(operation: &'static str) -> impl Fn(redis::RedisError) -> Error {
    move |e| Error::operation(operation, e)
}

/// Opens the multiplexed connection for `config`.
///
/// # Errors
///
/// Returns an error if the URI is invalid or the server is unreachable.
pub async fn open_manager(config: &StoreConfig) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.uri())
        .map_err(|e| Error::InvalidInput(format!("invalid redis URI: {e}")))?;
    ConnectionManager::new(client)
        .await
        .map_err(redis_error("redis_connect"))
}

/// Builds the entry id for `(namespace, key)`.
#[must_use]
pub fn entry_id(namespace: &str, key: &str) -> String {
    format!("{}:{namespace}:{key}", namespace.len())
}

/// Redis collection layout.
pub struct CollectionLayout {
    handle: PoolHandle,
    manager: ConnectionManager,
    collection: String,
}

impl std::fmt::Debug for CollectionLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionLayout")
            .field("handle", &self.handle)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl CollectionLayout {
    /// Builds the layout over an acquired pool handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the handle is not a Redis connection.
    pub fn with_pool(handle: PoolHandle, collection: &str) -> Result<Self> {
        let PoolConnection::Redis(manager) = handle.connection() else {
            return Err(Error::InvalidInput(
                "pool handle is not a Redis connection".to_string(),
            ));
        };
        let manager = manager.clone();
        Ok(Self {
            handle,
            manager,
            collection: collection.to_string(),
        })
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the pool handle.
    #[must_use]
    pub const fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    fn conn(&self) -> Result<ConnectionManager> {
        self.handle.ensure_open()?;
        Ok(self.manager.clone())
    }

    fn meta_key(&self) -> String {
        format!("{}:meta", self.collection)
    }

    /// Returns the hash key of an entry.
    #[must_use]
    pub fn doc_key(&self, namespace: &str, key: &str) -> String {
        format!("{}:doc:{}", self.collection, entry_id(namespace, key))
    }

    fn index_key(&self, namespace: &str) -> String {
        format!("{}:keys:{}:{namespace}", self.collection, namespace.len())
    }

    fn expires_key(&self) -> String {
        format!("{}:expires", self.collection)
    }

    /// Checks connectivity and records the layout version.
    pub(super) async fn bootstrap(&self) -> Result<()> {
        let mut conn = self.conn()?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(redis_error("redis_ping"))?;
        redis::cmd("HSETNX")
            .arg(self.meta_key())
            .arg("version")
            .arg(LAYOUT_VERSION)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(redis_error("redis_bootstrap"))?;
        Ok(())
    }

    pub(super) async fn get_many(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HGET").arg(self.doc_key(namespace, key)).arg("value");
        }
        let values: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_error("redis_get_many"))?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    pub(super) async fn upsert_many(&self, namespace: &str, entries: &[StoredEntry]) -> Result<()> {
        let mut conn = self.conn()?;
        let index = self.index_key(namespace);
        let expires_index = self.expires_key();
        let now = current_timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            let doc = self.doc_key(namespace, &entry.key);
            let id = entry_id(namespace, &entry.key);
            pipe.cmd("HSET")
                .arg(&doc)
                .arg("key")
                .arg(&entry.key)
                .arg("value")
                .arg(&entry.value)
                .arg("namespace")
                .arg(namespace)
                .ignore();
            match entry.expires {
                Some(expires) => {
                    pipe.cmd("HSET")
                        .arg(&doc)
                        .arg("expiresAt")
                        .arg(expires)
                        .ignore();
                    // Already-expired documents wait for the sweep.
                    if expires > now {
                        pipe.cmd("PEXPIREAT").arg(&doc).arg(expires).ignore();
                    } else {
                        pipe.cmd("PERSIST").arg(&doc).ignore();
                    }
                    pipe.cmd("ZADD")
                        .arg(&expires_index)
                        .arg(expires)
                        .arg(&id)
                        .ignore();
                },
                None => {
                    pipe.cmd("HDEL").arg(&doc).arg("expiresAt").ignore();
                    pipe.cmd("PERSIST").arg(&doc).ignore();
                    pipe.cmd("ZREM").arg(&expires_index).arg(&id).ignore();
                },
            }
            pipe.cmd("ZADD").arg(&index).arg(0).arg(&entry.key).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(redis_error("redis_upsert"))
    }

    pub(super) async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let keys = [key.to_string()];
        let removed = self.remove(namespace, &keys, "redis_delete").await?;
        Ok(removed > 0)
    }

    pub(super) async fn delete_many(&self, namespace: &str, keys: &[String]) -> Result<u64> {
        self.remove(namespace, keys, "redis_delete_many").await
    }

    /// Deletes documents and their index members in one transaction,
    /// returning how many documents this call removed.
    async fn remove(&self, namespace: &str, keys: &[String], operation: &'static str) -> Result<u64> {
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut del = redis::cmd("DEL");
        for key in keys {
            del.arg(self.doc_key(namespace, key));
        }
        pipe.add_command(del);
        pipe.cmd("ZREM").arg(self.index_key(namespace)).arg(keys).ignore();
        let ids: Vec<String> = keys.iter().map(|k| entry_id(namespace, k)).collect();
        pipe.cmd("ZREM").arg(self.expires_key()).arg(&ids).ignore();

        let (removed,): (u64,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_error(operation))?;
        Ok(removed)
    }

    pub(super) async fn has_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("EXISTS").arg(self.doc_key(namespace, key));
        }
        let found: Vec<bool> = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_error("redis_has_many"))?;
        Ok(keys
            .iter()
            .zip(found)
            .filter_map(|(key, exists)| exists.then(|| key.clone()))
            .collect())
    }

    pub(super) async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let index = self.index_key(namespace);
        let mut removed = 0;
        loop {
            let mut conn = self.conn()?;
            let keys: Vec<String> = redis::cmd("ZRANGE")
                .arg(&index)
                .arg(0)
                .arg(SCAN_CHUNK - 1)
                .query_async(&mut conn)
                .await
                .map_err(redis_error("redis_clear"))?;
            if keys.is_empty() {
                return Ok(removed);
            }
            removed += self.remove(namespace, &keys, "redis_clear").await?;
        }
    }

    /// Removes entries whose expiry is before `now`.
    ///
    /// Selection and deletion run in one server-side script per chunk, so a
    /// `set` that refreshes an entry can never land between them.
    pub(super) async fn clear_expired(&self, now: i64) -> Result<u64> {
        let script = redis::Script::new(REAP_SCRIPT);
        let mut removed = 0;
        loop {
            let mut conn = self.conn()?;
            let (scanned, reaped): (u64, u64) = script
                .key(self.expires_key())
                .arg(now)
                .arg(SCAN_CHUNK)
                .arg(&self.collection)
                .invoke_async(&mut conn)
                .await
                .map_err(redis_error("redis_clear_expired"))?;
            removed += reaped;
            if scanned == 0 {
                return Ok(removed);
            }
        }
    }

    pub(super) async fn page(
        &self,
        namespace: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        let mut conn = self.conn()?;
        let index = self.index_key(namespace);
        let min = cursor.map_or_else(|| "-".to_string(), |c| format!("({c}"));
        let members: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(&index)
            .arg(min)
            .arg("+")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(redis_error("redis_page"))?;
        if members.is_empty() {
            return Ok(Page::default());
        }

        let mut pipe = redis::pipe();
        for key in &members {
            pipe.cmd("HGET").arg(self.doc_key(namespace, key)).arg("value");
        }
        let values: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_error("redis_page"))?;

        let mut entries = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for (key, value) in members.iter().zip(values) {
            match value {
                Some(value) => entries.push((key.clone(), value)),
                None => stale.push(key.clone()),
            }
        }

        if !stale.is_empty() {
            // Natively expired documents; drop their index members.
            let pruned = redis::cmd("ZREM")
                .arg(&index)
                .arg(&stale)
                .query_async::<u64>(&mut conn)
                .await;
            if let Err(e) = pruned {
                tracing::debug!(error = %e, "Failed to prune stale index members");
            }
        }

        Ok(Page {
            entries,
            fetched: members.len(),
            last_key: members.last().cloned(),
        })
    }
}
