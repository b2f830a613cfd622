//! Namespace normalization and key-prefix handling.
//!
//! Callers conventionally prepend `"<namespace>:"` to keys. Storage keys on
//! the bare key plus a namespace column, so the prefix is stripped on the
//! way in and re-attached when keys are yielded back out.

/// Separator between a namespace and a key in prefixed keys.
pub const NAMESPACE_SEPARATOR: char = ':';

/// The namespace a store operates in.
///
/// An unset namespace is the empty string, so every comparison against
/// stored rows is a plain equality check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    name: String,
    prefix: String,
}

impl Namespace {
    /// Normalizes an optional namespace.
    #[must_use]
    pub fn new(namespace: Option<&str>) -> Self {
        let name = namespace.unwrap_or_default().to_string();
        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{name}{NAMESPACE_SEPARATOR}")
        };
        Self { name, prefix }
    }

    /// Returns the stored namespace value (`""` when unset).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns true for the default (empty) namespace.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Removes this namespace's prefix from a caller key, if present.
    ///
    /// Only the exact `"<namespace>:"` prefix is removed; keys prefixed with
    /// another namespace are left intact.
    #[must_use]
    pub fn strip<'k>(&self, key: &'k str) -> &'k str {
        if self.prefix.is_empty() {
            return key;
        }
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    /// Re-attaches this namespace's prefix to a storage key.
    #[must_use]
    pub fn attach(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
