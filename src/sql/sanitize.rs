//! SQL Identifier Sanitization Utilities
//!
//! Every schema, table and column name that ends up in generated SQL goes
//! through this module. Identifiers are whitelisted against
//! `[A-Za-z_][A-Za-z0-9_]*` and then double-quoted; anything else is rejected.

use std::sync::LazyLock;

use regex::Regex;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Check whether a name is a safe SQL identifier
///
/// Accepts only `[A-Za-z_][A-Za-z0-9_]*`. The empty string, spaces, quotes,
/// semicolons, dashes and dots are all rejected.
///
/// # Example
/// ```
/// use runtara_data_api::sql::is_valid_identifier;
///
/// assert!(is_valid_identifier("user_id"));
/// assert!(!is_valid_identifier("id; DROP TABLE users"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name)
}

/// Quote a SQL identifier to make it safe for use in queries
///
/// Returns the identifier wrapped in double quotes when it is valid, and the
/// empty string otherwise. Callers must treat the empty string as "drop this
/// identifier", never as SQL text.
///
/// # Example
/// ```
/// use runtara_data_api::sql::quote_identifier;
///
/// assert_eq!(quote_identifier("my_table"), "\"my_table\"");
/// assert_eq!(quote_identifier("my-table"), "");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    if is_valid_identifier(identifier) {
        format!("\"{}\"", identifier)
    } else {
        String::new()
    }
}

/// Quote an identifier, mapping the empty-string sentinel to `None`
pub(crate) fn quoted(identifier: &str) -> Option<String> {
    let quoted = quote_identifier(identifier);
    if quoted.is_empty() { None } else { Some(quoted) }
}

/// Quote a `schema.table` pair as `"schema"."table"`
///
/// Returns `None` when either part fails validation.
pub fn qualified_table(schema: &str, table: &str) -> Option<String> {
    Some(format!("{}.{}", quoted(schema)?, quoted(table)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // is_valid_identifier Tests
    // =========================================================================

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("UserAccounts"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("a1b2c3"));
        assert!(is_valid_identifier("x"));
        assert!(is_valid_identifier("created_at"));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1products"));
        assert!(!is_valid_identifier("my table"));
        assert!(!is_valid_identifier("my-table"));
        assert!(!is_valid_identifier("my.table"));
        assert!(!is_valid_identifier("name\""));
        assert!(!is_valid_identifier("id;"));
        assert!(!is_valid_identifier("tëst"));
        assert!(!is_valid_identifier("data->>key"));
    }

    #[test]
    fn test_rejects_injection_attempts() {
        assert!(!is_valid_identifier("id; DROP TABLE users; --"));
        assert!(!is_valid_identifier("\" OR 1=1 --"));
        assert!(!is_valid_identifier("name' OR '1'='1"));
        assert!(!is_valid_identifier("id\n"));
    }

    // =========================================================================
    // quote_identifier Tests
    // =========================================================================

    #[test]
    fn test_quote_identifier_simple() {
        assert_eq!(quote_identifier("my_table"), "\"my_table\"");
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("a"), "\"a\"");
    }

    #[test]
    fn test_quote_identifier_reserved_keyword() {
        // Reserved words are safe once quoted
        assert_eq!(quote_identifier("select"), "\"select\"");
        assert_eq!(quote_identifier("table"), "\"table\"");
    }

    #[test]
    fn test_quote_identifier_rejects_invalid() {
        assert_eq!(quote_identifier(""), "");
        assert_eq!(quote_identifier("table\"with\"quotes"), "");
        assert_eq!(quote_identifier("my table"), "");
        assert_eq!(quote_identifier("semi;colon"), "");
        assert_eq!(quote_identifier("日本語"), "");
    }

    #[test]
    fn test_quoted_sentinel() {
        assert_eq!(quoted("id"), Some("\"id\"".to_string()));
        assert_eq!(quoted("i d"), None);
    }

    #[test]
    fn test_qualified_table() {
        assert_eq!(
            qualified_table("public", "users"),
            Some("\"public\".\"users\"".to_string())
        );
        assert_eq!(qualified_table("public", "users;"), None);
        assert_eq!(qualified_table("", "users"), None);
    }
}
