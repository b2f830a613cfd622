//! One-time migration of legacy prefixed keys.
//!
//! Older deployments stored entries as `key = "<namespace>:<key>"` with an
//! empty namespace column. The migration splits each such key on the
//! **first** separator and moves the prefix into the namespace column.
//!
//! # Protocol
//!
//! 1. Schema DDL (the regular bootstrap) runs outside any transaction, so
//!    columns and indexes persist even on a dry run.
//! 2. A transaction is opened and the preview and conflicts are selected
//!    inside it, then handed to the caller's `on_preview` callback before
//!    anything is decided.
//! 3. On a dry run the transaction is rolled back.
//! 4. Otherwise one set-based `UPDATE` rewrites every matching row and the
//!    transaction commits. Any failure, including a `(key, namespace)`
//!    collision, rolls back everything.
//!
//! # Limitations
//!
//! Namespaces that themselves contain `:` cannot be recovered: the split
//! always happens at the first separator. Keys that start with the
//! separator (empty prefix) are left untouched.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kvbridge::migration::{MigrationOptions, sqlite};
//!
//! let report = sqlite::migrate("sqlite://cache.db", &MigrationOptions::default(), |preview| {
//!     for rewrite in &preview.preview {
//!         println!("{rewrite}");
//!     }
//! })
//! .await?;
//! println!("{} rows rewritten", report.rows_updated);
//! ```

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use crate::config::{DEFAULT_KEY_LENGTH, DEFAULT_NAMESPACE_LENGTH, DEFAULT_TABLE, StoreConfig};

/// Separator between namespace and key in legacy keys.
pub const LEGACY_SEPARATOR: char = ':';

/// Splits a legacy key into `(namespace, key)` at the first separator.
///
/// Returns `None` when the key has no separator or the prefix is empty.
///
/// # Examples
///
/// ```rust
/// use kvbridge::migration::split_legacy_key;
///
/// assert_eq!(split_legacy_key("users:42"), Some(("users", "42")));
/// assert_eq!(split_legacy_key("a:b:c"), Some(("a", "b:c")));
/// assert_eq!(split_legacy_key("plain"), None);
/// ```
#[must_use]
pub fn split_legacy_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(LEGACY_SEPARATOR)
        .filter(|(namespace, _)| !namespace.is_empty())
}

/// One row rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRewrite {
    /// Stored key before the migration.
    pub legacy_key: String,
    /// Namespace after the migration.
    pub namespace: String,
    /// Key after the migration.
    pub key: String,
}

impl KeyRewrite {
    /// Builds the rewrite for a legacy key, if it has a namespace prefix.
    #[must_use]
    pub fn from_legacy(legacy_key: &str) -> Option<Self> {
        split_legacy_key(legacy_key).map(|(namespace, key)| Self {
            legacy_key: legacy_key.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
        })
    }
}

impl std::fmt::Display for KeyRewrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> namespace={} key={}",
            self.legacy_key, self.namespace, self.key
        )
    }
}

/// Target table and layout of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Table to migrate.
    pub table: String,
    /// Schema (PostgreSQL only).
    pub schema: Option<String>,
    /// Maximum key length used when the bootstrap creates columns.
    pub key_length: u32,
    /// Maximum namespace length used when the bootstrap creates columns.
    pub namespace_length: u32,
    /// Select the preview, then roll back.
    pub dry_run: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            schema: None,
            key_length: DEFAULT_KEY_LENGTH,
            namespace_length: DEFAULT_NAMESPACE_LENGTH,
            dry_run: false,
        }
    }
}

impl MigrationOptions {
    /// Takes the table layout from a store configuration.
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            table: config.table.clone(),
            schema: config.schema.clone(),
            key_length: config.key_length,
            namespace_length: config.namespace_length,
            dry_run: false,
        }
    }

    /// Sets the dry-run flag.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Rows matching the legacy shape, in key order.
    pub preview: Vec<KeyRewrite>,
    /// Rewrites whose target `(key, namespace)` already exists.
    pub conflicts: Vec<KeyRewrite>,
    /// True when the rewrite was committed.
    pub applied: bool,
    /// Rows changed by the committed rewrite.
    pub rows_updated: u64,
}

impl MigrationReport {
    fn log(&self, backend: &'static str, table: &str) {
        tracing::info!(
            backend,
            table,
            preview = self.preview.len(),
            conflicts = self.conflicts.len(),
            applied = self.applied,
            rows_updated = self.rows_updated,
            "Legacy key migration finished"
        );
    }
}

/// Fails the run when any rewrite would collide.
fn ensure_no_conflicts(conflicts: &[KeyRewrite]) -> crate::Result<()> {
    match conflicts.first() {
        None => Ok(()),
        Some(first) => Err(crate::Error::operation(
            "migration_conflict",
            format!(
                "{} rewrite(s) collide with existing rows, first: {first}",
                conflicts.len()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("users:42", Some(("users", "42")))]
    #[test_case("a:b:c", Some(("a", "b:c")))]
    #[test_case("trailing:", Some(("trailing", "")))]
    #[test_case(":leading", None)]
    #[test_case("plain", None)]
    #[test_case("", None)]
    fn test_split_legacy_key(key: &str, expected: Option<(&str, &str)>) {
        assert_eq!(split_legacy_key(key), expected);
    }

    #[test]
    fn test_key_rewrite_display() {
        let rewrite = KeyRewrite::from_legacy("users:42").unwrap();
        assert_eq!(rewrite.to_string(), "users:42 -> namespace=users key=42");
    }

    #[test]
    fn test_options_from_config() {
        let config = StoreConfig::new("sqlite::memory:")
            .with_table("cache")
            .with_schema("kv");
        let options = MigrationOptions::from_config(&config).with_dry_run(true);
        assert_eq!(options.table, "cache");
        assert_eq!(options.schema.as_deref(), Some("kv"));
        assert!(options.dry_run);
    }

    #[test]
    fn test_ensure_no_conflicts() {
        assert!(ensure_no_conflicts(&[]).is_ok());
        let conflict = KeyRewrite::from_legacy("a:b").unwrap();
        assert!(ensure_no_conflicts(&[conflict]).is_err());
    }
}
