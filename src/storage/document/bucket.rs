//! Bucket layout on a local object directory.
//!
//! Objects live at `{root}/{bucket}/ns-{hex(namespace)}/{hex(key)}.json`.
//! Hex names keep arbitrary keys filesystem-safe and sort in the same order
//! as the keys' bytes. Keys whose hex name would not fit in a file name are
//! stored as `h-{sha256(key)}.json` instead; listing reads their key back
//! from the object. Writes go to a temporary file that is renamed into
//! place, so readers never see a partial object.
//!
//! The file's modification time is the object's `lastAccessed` marker:
//! writes set it and reads refresh it.
//!
//! Reaping moves a candidate to a hidden tombstone before re-checking it,
//! so a concurrent write is either left in place or linked back. The object
//! is briefly absent while a fresh write is restored.

use crate::storage::payload::StoredEntry;
use crate::storage::pool::{PoolConnection, PoolHandle};
use crate::storage::traits::Page;
use crate::{Error, Result, current_timestamp_millis};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Extension of object files.
const OBJECT_EXTENSION: &str = "json";

/// Prefix of namespace directories.
const NAMESPACE_DIR_PREFIX: &str = "ns-";

/// Longest object file name most filesystems accept.
const MAX_FILE_NAME: usize = 255;

/// Prefix of hashed object names. Hex names never contain it.
const HASHED_PREFIX: &str = "h-";

/// Resolves the root directory of a `file://` URI.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for a non-`file:` URI or an empty path.
pub fn root_from_uri(uri: &str) -> Result<PathBuf> {
    let path = uri
        .strip_prefix("file://")
        .or_else(|| uri.strip_prefix("file:"))
        .ok_or_else(|| Error::InvalidInput("expected a file:// URI".to_string()))?;
    if path.is_empty() {
        return Err(Error::InvalidInput("file URI has no path".to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Per-object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    /// Expiry in epoch milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Epoch milliseconds of the last write.
    pub last_accessed: i64,
    /// Namespace of the object.
    pub namespace: String,
}

/// Object file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Storage key.
    pub key: String,
    /// Stored payload text.
    pub value: String,
    /// Metadata.
    pub metadata: ObjectMetadata,
}

fn io_error(operation: &'static str) -> impl Fn(std::io::Error) -> Error {
    move |e| Error::operation(operation, e)
}

/// Bucket layout over a directory tree.
#[derive(Debug)]
pub struct BucketLayout {
    handle: PoolHandle,
    bucket_dir: PathBuf,
    bucket: String,
}

impl BucketLayout {
    /// Builds the layout over an acquired pool handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the handle is not a bucket root or
    /// the bucket name is not a plain directory name.
    pub fn with_pool(handle: PoolHandle, bucket: &str) -> Result<Self> {
        let PoolConnection::Bucket(root) = handle.connection() else {
            return Err(Error::InvalidInput(
                "pool handle is not a bucket root".to_string(),
            ));
        };
        if !is_safe_dir_name(bucket) {
            return Err(Error::InvalidInput(format!(
                "bucket name '{bucket}' must be a plain directory name"
            )));
        }
        let bucket_dir = root.join(bucket);
        Ok(Self {
            handle,
            bucket_dir,
            bucket: bucket.to_string(),
        })
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the pool handle.
    #[must_use]
    pub const fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Returns the directory holding this bucket's namespaces.
    #[must_use]
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.bucket_dir
            .join(format!("{NAMESPACE_DIR_PREFIX}{}", hex::encode(namespace)))
    }

    /// Returns the object path for `(namespace, key)`.
    #[must_use]
    pub fn object_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace).join(object_file_name(key))
    }

    pub(super) async fn bootstrap(&self) -> Result<()> {
        self.handle.ensure_open()?;
        tokio::fs::create_dir_all(&self.bucket_dir)
            .await
            .map_err(io_error("bucket_bootstrap"))
    }

    /// Reads one object. Missing objects are `None`.
    async fn read_object(&self, path: &Path) -> Result<Option<StoredObject>> {
        self.handle.ensure_open()?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::operation("bucket_read", e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::operation("bucket_decode", format!("{}: {e}", path.display())))
    }

    pub(super) async fn get_many(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<Vec<(String, String)>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.object_path(namespace, key);
            // A hashed name may hold a colliding key.
            if let Some(object) = self.read_object(&path).await?
                && object.key == *key
            {
                touch(path).await;
                found.push((key.clone(), object.value));
            }
        }
        Ok(found)
    }

    pub(super) async fn upsert_many(&self, namespace: &str, entries: &[StoredEntry]) -> Result<()> {
        self.handle.ensure_open()?;
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error("bucket_create_namespace"))?;

        let now = current_timestamp_millis();
        for entry in entries {
            let target = self.object_path(namespace, &entry.key);
            let object = StoredObject {
                key: entry.key.clone(),
                value: entry.value.clone(),
                metadata: ObjectMetadata {
                    expires_at: entry.expires,
                    last_accessed: now,
                    namespace: namespace.to_string(),
                },
            };
            let bytes =
                serde_json::to_vec(&object).map_err(|e| Error::operation("bucket_encode", e))?;

            let temp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
            if let Err(e) = tokio::fs::write(&temp, &bytes).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(Error::operation("bucket_write", e));
            }
            if let Err(e) = tokio::fs::rename(&temp, &target).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(Error::operation("bucket_rename", e));
            }
        }
        Ok(())
    }

    /// Removes one object file, reporting whether this call removed it.
    async fn remove(&self, path: &Path) -> Result<bool> {
        self.handle.ensure_open()?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::operation("bucket_delete", e)),
        }
    }

    pub(super) async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.object_path(namespace, key);
        self.remove(&path).await
    }

    pub(super) async fn delete_many(&self, namespace: &str, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(namespace, key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub(super) async fn has_many(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        self.handle.ensure_open()?;
        let mut found = Vec::new();
        for key in keys {
            let path = self.object_path(namespace, key);
            if tokio::fs::try_exists(&path)
                .await
                .map_err(io_error("bucket_exists"))?
            {
                found.push(key.clone());
            }
        }
        Ok(found)
    }

    /// Lists the object files of one namespace as `(key, path)`, sorted by key.
    async fn list_namespace(&self, namespace: &str) -> Result<Vec<(String, PathBuf)>> {
        self.handle.ensure_open()?;
        let mut objects = self.list_objects(&self.namespace_dir(namespace)).await?;
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    /// Lists every namespace directory of the bucket.
    async fn namespace_dirs(&self) -> Result<Vec<PathBuf>> {
        self.handle.ensure_open()?;
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.bucket_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(Error::operation("bucket_list", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("bucket_list"))?
        {
            let is_namespace = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(NAMESPACE_DIR_PREFIX));
            if is_namespace {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    pub(super) async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let mut removed = 0;
        for (_, path) in self.list_namespace(namespace).await? {
            if self.remove(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub(super) async fn clear_expired(&self, now: i64) -> Result<u64> {
        let is_expired = |object: &StoredObject, _: SystemTime| {
            object.metadata.expires_at.is_some_and(|expires| expires < now)
        };
        let mut removed = 0;
        for dir in self.namespace_dirs().await? {
            for (_, path) in self.list_objects(&dir).await? {
                let candidate = self
                    .read_object(&path)
                    .await?
                    .is_some_and(|object| is_expired(&object, SystemTime::now()));
                if candidate && self.reap(&path, is_expired).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Deletes objects not read or written for at least `max_age`.
    pub(super) async fn clear_unused_for(&self, max_age: Duration) -> Result<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let is_unused = |_: &StoredObject, modified: SystemTime| modified < cutoff;
        let mut removed = 0;
        for dir in self.namespace_dirs().await? {
            for (_, path) in self.list_objects(&dir).await? {
                let modified = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.modified().map_err(io_error("bucket_metadata"))?,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(Error::operation("bucket_metadata", e)),
                };
                if modified < cutoff && self.reap(&path, is_unused).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Deletes the object at `path` if `stale` still holds for it.
    ///
    /// The object is renamed to a tombstone first, so the check sees exactly
    /// what gets deleted. A fresh object caught by the rename is linked back
    /// unless a newer write already took its path.
    async fn reap<F>(&self, path: &Path, stale: F) -> Result<bool>
    where
        F: Fn(&StoredObject, SystemTime) -> bool,
    {
        self.handle.ensure_open()?;
        let Some(dir) = path.parent() else {
            return Ok(false);
        };
        let tombstone = dir.join(format!(".{}.reap", uuid::Uuid::new_v4()));
        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::operation("bucket_reap", e)),
        }

        let verdict = match tokio::fs::metadata(&tombstone).await.and_then(|m| m.modified()) {
            Ok(modified) => self
                .read_object(&tombstone)
                .await
                .map(|object| object.is_some_and(|object| stale(&object, modified))),
            Err(e) => Err(Error::operation("bucket_metadata", e)),
        };

        match verdict {
            Ok(true) => {
                tokio::fs::remove_file(&tombstone)
                    .await
                    .map_err(io_error("bucket_reap"))?;
                Ok(true)
            },
            Ok(false) => {
                restore(&tombstone, path).await?;
                Ok(false)
            },
            Err(e) => {
                if let Err(restore_err) = restore(&tombstone, path).await {
                    tracing::warn!(error = %restore_err, "Failed to restore reaped object");
                }
                Err(e)
            },
        }
    }

    /// Lists `(key, path)` for every object file in `dir`, unsorted.
    async fn list_objects(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut objects = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(objects),
            Err(e) => return Err(Error::operation("bucket_list", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("bucket_list"))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Temporary files and tombstones start with '.' and never match.
            if let Some(key) = key_from_file_name(name) {
                objects.push((key, entry.path()));
            } else if is_hashed_name(name) {
                match self.read_object(&entry.path()).await {
                    Ok(Some(object)) => objects.push((object.key, entry.path())),
                    Ok(None) => {},
                    Err(e) => {
                        tracing::debug!(error = %e, file = name, "Skipping unreadable object");
                    },
                }
            }
        }
        Ok(objects)
    }

    pub(super) async fn page(
        &self,
        namespace: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        let objects: Vec<_> = self
            .list_namespace(namespace)
            .await?
            .into_iter()
            .filter(|(key, _)| cursor.is_none_or(|c| key.as_str() > c))
            .take(limit)
            .collect();

        let mut entries = Vec::with_capacity(objects.len());
        for (key, path) in &objects {
            // Deleted since listing.
            if let Some(object) = self.read_object(path).await? {
                entries.push((key.clone(), object.value));
            }
        }

        Ok(Page {
            entries,
            fetched: objects.len(),
            last_key: objects.last().map(|(key, _)| key.clone()),
        })
    }
}

/// Returns true for a single, non-special path component.
fn is_safe_dir_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.')
}

/// Decodes an object file name back into its key.
fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(&format!(".{OBJECT_EXTENSION}"))?;
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

/// Returns the object file name for `key`.
fn object_file_name(key: &str) -> String {
    let name = format!("{}.{OBJECT_EXTENSION}", hex::encode(key));
    if name.len() <= MAX_FILE_NAME {
        name
    } else {
        let digest = Sha256::digest(key.as_bytes());
        format!("{HASHED_PREFIX}{}.{OBJECT_EXTENSION}", hex::encode(digest))
    }
}

/// Returns true for a hashed object file name.
fn is_hashed_name(name: &str) -> bool {
    name.strip_prefix(HASHED_PREFIX)
        .and_then(|rest| rest.strip_suffix(&format!(".{OBJECT_EXTENSION}")))
        .is_some_and(|digest| digest.len() == 64 && hex::decode(digest).is_ok())
}

/// Puts a tombstoned object back at `path` without clobbering a newer write.
async fn restore(tombstone: &Path, path: &Path) -> Result<()> {
    match tokio::fs::hard_link(tombstone, path).await {
        Ok(()) => {},
        // A newer write owns the path.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {},
        Err(_) => {
            return tokio::fs::rename(tombstone, path)
                .await
                .map_err(io_error("bucket_restore"));
        },
    }
    tokio::fs::remove_file(tombstone)
        .await
        .map_err(io_error("bucket_restore"))
}

/// Refreshes an object's modification time, best effort.
///
/// Opens without `create`, so an object deleted concurrently is never
/// recreated.
async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()))
    })
    .await;
    if let Ok(Err(e)) = result
        && e.kind() != ErrorKind::NotFound
    {
        tracing::debug!(error = %e, "Failed to refresh lastAccessed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("file:///var/cache/kv", "/var/cache/kv")]
    #[test_case("file://relative/dir", "relative/dir")]
    #[test_case("file:data", "data")]
    fn test_root_from_uri(uri: &str, expected: &str) {
        assert_eq!(root_from_uri(uri).unwrap(), PathBuf::from(expected));
    }

    #[test]
    fn test_root_from_uri_rejects_other_schemes() {
        assert!(root_from_uri("s3://bucket").is_err());
        assert!(root_from_uri("file://").is_err());
    }

    #[test]
    fn test_key_file_names_sort_like_keys() {
        let mut keys = vec!["b", "a", "ab", "a\u{e9}", "B", ""];
        let mut names: Vec<String> = keys
            .iter()
            .map(|k| format!("{}.json", hex::encode(k)))
            .collect();
        keys.sort_unstable();
        names.sort_unstable();
        let decoded: Vec<String> = names
            .iter()
            .filter_map(|n| key_from_file_name(n))
            .collect();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn test_long_keys_get_hashed_names() {
        let short = object_file_name("42");
        assert_eq!(short, "3432.json");
        assert!(!is_hashed_name(&short));

        let long = object_file_name(&"k".repeat(126));
        assert!(long.starts_with(HASHED_PREFIX));
        assert!(long.len() <= MAX_FILE_NAME);
        assert!(is_hashed_name(&long));
        assert_eq!(key_from_file_name(&long), None);
        assert_ne!(long, object_file_name(&"k".repeat(127)));
    }

    fn layout(root: &Path) -> BucketLayout {
        let config = crate::StoreConfig::new(format!("file://{}", root.display()));
        let handle = PoolHandle::new(
            crate::storage::PoolKey::from_config(&config),
            PoolConnection::Bucket(root.to_path_buf()),
        );
        BucketLayout::with_pool(handle, "keyv").unwrap()
    }

    fn entry(key: &str, value: &str, expires: Option<i64>) -> StoredEntry {
        StoredEntry {
            key: key.to_string(),
            value: value.to_string(),
            expires,
        }
    }

    fn hidden_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count()
    }

    #[tokio::test]
    async fn test_reap_restores_refreshed_object() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.bootstrap().await.unwrap();

        // The sweep saw an expired object, but a refresh replaced it first.
        let now = current_timestamp_millis();
        layout
            .upsert_many("", &[entry("k", "fresh", Some(now + 3_600_000))])
            .await
            .unwrap();
        let path = layout.object_path("", "k");
        let expired = |object: &StoredObject, _: SystemTime| {
            object.metadata.expires_at.is_some_and(|e| e < now)
        };

        assert!(!layout.reap(&path, expired).await.unwrap());
        let object = layout.read_object(&path).await.unwrap().unwrap();
        assert_eq!(object.value, "fresh");
        assert_eq!(hidden_files(path.parent().unwrap()), 0);
    }

    #[tokio::test]
    async fn test_reap_removes_stale_object() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.bootstrap().await.unwrap();
        layout
            .upsert_many("", &[entry("k", "old", Some(1))])
            .await
            .unwrap();
        let path = layout.object_path("", "k");

        let expired = |object: &StoredObject, _: SystemTime| {
            object.metadata.expires_at.is_some_and(|e| e < 2)
        };
        assert!(layout.reap(&path, expired).await.unwrap());
        assert!(layout.read_object(&path).await.unwrap().is_none());
        assert!(!layout.reap(&path, expired).await.unwrap());
        assert_eq!(hidden_files(path.parent().unwrap()), 0);
    }

    #[tokio::test]
    async fn test_restore_never_clobbers_newer_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("6b.json");
        let tombstone = dir.path().join(".t.reap");
        std::fs::write(&tombstone, b"older").unwrap();
        std::fs::write(&path, b"newer").unwrap();

        restore(&tombstone, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"newer");
        assert!(!tombstone.exists());

        std::fs::write(&tombstone, b"older").unwrap();
        std::fs::remove_file(&path).unwrap();
        restore(&tombstone, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"older");
        assert!(!tombstone.exists());
    }

    #[test]
    fn test_temp_files_are_not_objects() {
        assert_eq!(key_from_file_name(".0b5c1e.tmp"), None);
        assert_eq!(key_from_file_name(".0b5c1e.reap"), None);
        assert!(!is_hashed_name(".0b5c1e.reap"));
        assert_eq!(key_from_file_name("zz.json"), None);
    }

    #[test_case("keyv", true)]
    #[test_case("", false)]
    #[test_case("..", false)]
    #[test_case("a/b", false)]
    #[test_case(".hidden", false)]
    fn test_is_safe_dir_name(name: &str, expected: bool) {
        assert_eq!(is_safe_dir_name(name), expected);
    }

    #[test]
    fn test_object_metadata_is_camel_case() {
        let object = StoredObject {
            key: "k".into(),
            value: "v".into(),
            metadata: ObjectMetadata {
                expires_at: Some(5),
                last_accessed: 1,
                namespace: String::new(),
            },
        };
        let json = serde_json::to_string(&object).unwrap();
        assert!(json.contains("\"expiresAt\":5"));
        assert!(json.contains("\"lastAccessed\":1"));
    }
}
