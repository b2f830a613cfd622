//! Stored values and `expires` extraction.

use serde_json::Value;

/// Name of the JSON field carrying the expiry timestamp inside a payload.
pub const EXPIRES_FIELD: &str = "expires";

/// A value handed to `set`.
///
/// The adapter never interprets a payload beyond reading its `expires`
/// field; the stored form is always text.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Serialized text, usually JSON produced by the caller.
    Text(String),
    /// A structured value, stored as compact JSON text.
    Structured(Value),
}

impl Payload {
    /// Extracts the expiry timestamp (epoch milliseconds).
    ///
    /// Text is parsed as JSON first. A payload that is not JSON, not an
    /// object, or has no numeric `expires` field yields `None`.
    #[must_use]
    pub fn expires(&self) -> Option<i64> {
        match self {
            Self::Text(text) => serde_json::from_str::<Value>(text)
                .ok()
                .as_ref()
                .and_then(expires_of),
            Self::Structured(value) => expires_of(value),
        }
    }

    /// Converts the payload into its stored text form.
    #[must_use]
    pub fn into_stored(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Structured(value) => value.to_string(),
        }
    }
}

/// Reads a numeric `expires` field from a JSON object.
#[allow(clippy::cast_possible_truncation)]
fn expires_of(value: &Value) -> Option<i64> {
    let field = value.as_object()?.get(EXPIRES_FIELD)?;
    if let Some(millis) = field.as_i64() {
        return Some(millis);
    }
    field
        .as_f64()
        .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
        .map(|f| f.trunc() as i64)
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

/// A row ready to be upserted: stripped key, stored text, extracted expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Storage key (namespace prefix already removed).
    pub key: String,
    /// Stored payload text.
    pub value: String,
    /// Expiry in epoch milliseconds.
    pub expires: Option<i64>,
}

impl StoredEntry {
    /// Builds an entry from a key and payload, extracting `expires`.
    #[must_use]
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        let expires = payload.expires();
        Self {
            key: key.into(),
            value: payload.into_stored(),
            expires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(r#"{"value":"x","expires":1700000000000}"#, Some(1_700_000_000_000); "integer")]
    #[test_case(r#"{"value":"x","expires":1700000000000.7}"#, Some(1_700_000_000_000); "float truncated")]
    #[test_case(r#"{"value":"x"}"#, None; "missing field")]
    #[test_case(r#"{"value":"x","expires":null}"#, None; "null field")]
    #[test_case(r#"{"value":"x","expires":"soon"}"#, None; "string field")]
    #[test_case("not json at all", None; "not json")]
    #[test_case("[1,2,3]", None; "array")]
    #[test_case("", None; "empty")]
    fn test_text_expires(raw: &str, expected: Option<i64>) {
        assert_eq!(Payload::from(raw).expires(), expected);
    }

    #[test]
    fn test_structured_expires() {
        let payload = Payload::from(json!({"value": {"n": 1}, "expires": 42}));
        assert_eq!(payload.expires(), Some(42));

        let payload = Payload::from(json!({"value": 1}));
        assert_eq!(payload.expires(), None);
    }

    #[test]
    fn test_structured_is_stored_as_compact_json() {
        let entry = StoredEntry::new("k", Payload::from(json!({"expires": 5, "value": "v"})));
        assert_eq!(entry.value, r#"{"expires":5,"value":"v"}"#);
        assert_eq!(entry.expires, Some(5));
    }

    #[test]
    fn test_text_is_stored_unmodified() {
        let raw = "{ \"value\" : \"spaced\" }";
        let entry = StoredEntry::new("k", Payload::from(raw));
        assert_eq!(entry.value, raw);
        assert_eq!(entry.expires, None);
    }
}
