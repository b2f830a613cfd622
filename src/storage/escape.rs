//! Identifier quoting for generated SQL.
//!
//! Table, schema and index names cannot be bound as parameters, so they are
//! interpolated after quoting. Values always go through parameter binding.

/// Quotes one identifier with ANSI double quotes, doubling any embedded
/// quote. Dots are not treated as separators.
#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quotes a possibly qualified identifier (`schema.table`).
///
/// Each dot-separated segment is quoted on its own.
#[must_use]
pub fn escape_identifier(identifier: &str) -> String {
    join_quoted(identifier.split('.'))
}

fn join_quoted<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

/// A table name with an optional schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    /// Creates a table name. An empty schema counts as none.
    #[must_use]
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.filter(|s| !s.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Returns the unquoted table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the unquoted schema name.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Returns the quoted, schema-qualified table reference.
    #[must_use]
    pub fn qualified(&self) -> String {
        join_quoted(self.schema.as_deref().into_iter().chain([self.name.as_str()]))
    }

    /// Returns the quoted name of an index or constraint derived from the
    /// table name (`<table>_<suffix>`), unqualified.
    #[must_use]
    pub fn derived(&self, suffix: &str) -> String {
        quote_identifier(&self.derived_raw(suffix))
    }

    /// Returns the unquoted derived name.
    #[must_use]
    pub fn derived_raw(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("keyv", r#""keyv""#)]
    #[test_case("public.keyv", r#""public.keyv""#)]
    #[test_case(r#"we"ird"#, r#""we""ird""#)]
    fn test_quote_identifier(input: &str, expected: &str) {
        assert_eq!(quote_identifier(input), expected);
    }

    #[test_case("keyv", r#""keyv""#)]
    #[test_case("public.keyv", r#""public"."keyv""#)]
    #[test_case(r#"s.we"ird"#, r#""s"."we""ird""#)]
    fn test_escape_identifier(input: &str, expected: &str) {
        assert_eq!(escape_identifier(input), expected);
    }

    #[test]
    fn test_injection_attempt_stays_one_identifier() {
        let escaped = escape_identifier(r#"keyv"; DROP TABLE users; --"#);
        assert_eq!(escaped, r#""keyv""; DROP TABLE users; --""#);
    }

    #[test]
    fn test_table_name_rendering() {
        let table = TableName::new(Some("cache"), "keyv");
        assert_eq!(table.qualified(), r#""cache"."keyv""#);
        assert_eq!(table.qualified(), escape_identifier("cache.keyv"));

        // A dot inside the name stays part of one identifier.
        let dotted = TableName::new(None, "a.b");
        assert_eq!(dotted.qualified(), r#""a.b""#);
        assert_eq!(table.derived("key_namespace_idx"), r#""keyv_key_namespace_idx""#);
        assert_eq!(table.derived_raw("pkey"), "keyv_pkey");

        let bare = TableName::new(Some(""), "keyv");
        assert_eq!(bare.qualified(), r#""keyv""#);
        assert_eq!(bare.schema(), None);
    }
}
