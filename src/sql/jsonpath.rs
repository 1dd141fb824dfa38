//! JSONB path compilation
//!
//! Rewrites arrow column references such as `data->items->0->>name` into
//! `"data"->'items'->0->>'name'`. The first segment is a real column and goes
//! through identifier quoting; every following segment is a JSON key (quoted
//! string literal) or an array index (bare integer).

use std::sync::LazyLock;

use regex::Regex;

use crate::sql::sanitize::quoted;
use crate::types::FilterValue;

static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(\d+\.?\d*|\.\d+)([eE][-+]?\d+)?$").expect("numeric regex"));

static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+$").expect("index regex"));

/// JSON traversal operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrow {
    /// `->`, yields jsonb
    Json,
    /// `->>`, yields text
    Text,
}

impl Arrow {
    fn as_sql(self) -> &'static str {
        match self {
            Arrow::Json => "->",
            Arrow::Text => "->>",
        }
    }
}

/// A column reference with an optional chain of JSON key/index steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    pub column: String,
    pub steps: Vec<(Arrow, String)>,
}

impl JsonPath {
    /// Split a column reference into its base column and JSON steps.
    ///
    /// `->>` is matched before `->`. Returns `None` when a key segment is empty.
    pub fn parse(reference: &str) -> Option<Self> {
        let mut column = None;
        let mut steps = Vec::new();
        let mut pending: Option<Arrow> = None;
        let mut current = String::new();
        let mut rest = reference;

        loop {
            let (arrow, len) = if rest.starts_with("->>") {
                (Some(Arrow::Text), 3)
            } else if rest.starts_with("->") {
                (Some(Arrow::Json), 2)
            } else {
                (None, 0)
            };

            match arrow {
                Some(next) => {
                    let segment = std::mem::take(&mut current);
                    match pending {
                        None if column.is_none() => column = Some(segment),
                        Some(prev) if !segment.is_empty() => steps.push((prev, segment)),
                        _ => return None,
                    }
                    pending = Some(next);
                    rest = &rest[len..];
                }
                None => {
                    let mut chars = rest.chars();
                    match chars.next() {
                        Some(c) => {
                            current.push(c);
                            rest = chars.as_str();
                        }
                        None => break,
                    }
                }
            }
        }

        match pending {
            None => column = Some(current),
            Some(_) if current.is_empty() => return None,
            Some(prev) => steps.push((prev, current)),
        }

        Some(Self {
            column: column?,
            steps,
        })
    }

    /// Whether the final step extracts text (`->>`)
    pub fn ends_with_text(&self) -> bool {
        matches!(self.steps.last(), Some((Arrow::Text, _)))
    }

    /// Name of the last key in the path, or the column itself
    pub fn last_key(&self) -> &str {
        self.steps
            .last()
            .map(|(_, key)| key.as_str())
            .unwrap_or(&self.column)
    }

    /// Render the path as SQL. Returns `None` if the base column is not a
    /// valid identifier.
    pub fn to_sql(&self) -> Option<String> {
        let mut sql = quoted(&self.column)?;
        for (arrow, key) in &self.steps {
            sql.push_str(arrow.as_sql());
            if INDEX_RE.is_match(key) {
                sql.push_str(key);
            } else {
                sql.push('\'');
                sql.push_str(&key.replace('\'', "''"));
                sql.push('\'');
            }
        }
        Some(sql)
    }
}

/// Compile a column reference into a SQL expression
///
/// A plain column is quoted; an arrow chain is rewritten into operator form.
/// Returns `None` when the reference cannot be rendered safely.
///
/// # Example
/// ```
/// use runtara_data_api::sql::compile_path;
///
/// assert_eq!(compile_path("name").as_deref(), Some("\"name\""));
/// assert_eq!(
///     compile_path("data->tags->>0").as_deref(),
///     Some("\"data\"->'tags'->>0")
/// );
/// ```
pub fn compile_path(column: &str) -> Option<String> {
    if !column.contains("->") {
        return quoted(column);
    }
    JsonPath::parse(column)?.to_sql()
}

/// Whether a comparison on `column` must be cast to `numeric`
///
/// True when the path ends in `->>` (text extraction) and the value is a
/// number or a numeric-looking string. Comparing the extracted text directly
/// would order `"10"` before `"9"`.
pub fn needs_numeric_cast(column: &str, value: &FilterValue) -> bool {
    if !column.contains("->>") {
        return false;
    }
    let ends_with_text = JsonPath::parse(column)
        .map(|path| path.ends_with_text())
        .unwrap_or(false);
    ends_with_text && is_numeric_value(value)
}

/// Whether a value is a number or a string holding a numeric literal
pub fn is_numeric_value(value: &FilterValue) -> bool {
    match value {
        FilterValue::Number(_) => true,
        FilterValue::String(s) => is_numeric_literal(s),
        _ => false,
    }
}

pub(crate) fn is_numeric_literal(s: &str) -> bool {
    NUMERIC_RE.is_match(s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_column_is_quoted() {
        assert_eq!(compile_path("name"), Some("\"name\"".to_string()));
        assert_eq!(compile_path("bad name"), None);
    }

    #[test]
    fn test_single_arrow() {
        assert_eq!(
            compile_path("data->key"),
            Some("\"data\"->'key'".to_string())
        );
        assert_eq!(
            compile_path("data->>key"),
            Some("\"data\"->>'key'".to_string())
        );
    }

    #[test]
    fn test_chain_with_array_index() {
        assert_eq!(
            compile_path("data->items->0->>name"),
            Some("\"data\"->'items'->0->>'name'".to_string())
        );
        assert_eq!(
            compile_path("data->key->>0"),
            Some("\"data\"->'key'->>0".to_string())
        );
    }

    #[test]
    fn test_key_quotes_are_escaped() {
        assert_eq!(
            compile_path("data->>it's"),
            Some("\"data\"->>'it''s'".to_string())
        );
        assert_eq!(
            compile_path("data->>x'; DROP TABLE t; --"),
            Some("\"data\"->>'x''; DROP TABLE t; --'".to_string())
        );
    }

    #[test]
    fn test_invalid_base_column_rejected() {
        assert_eq!(compile_path("da ta->>key"), None);
        assert_eq!(compile_path("->>key"), None);
    }

    #[test]
    fn test_empty_segments_rejected() {
        assert_eq!(compile_path("data->"), None);
        assert_eq!(compile_path("data->->key"), None);
        assert_eq!(compile_path("data->>"), None);
    }

    #[test]
    fn test_json_path_parse() {
        let path = JsonPath::parse("data->a->>b").unwrap();
        assert_eq!(path.column, "data");
        assert_eq!(
            path.steps,
            vec![
                (Arrow::Json, "a".to_string()),
                (Arrow::Text, "b".to_string())
            ]
        );
        assert!(path.ends_with_text());
        assert_eq!(path.last_key(), "b");

        let plain = JsonPath::parse("id").unwrap();
        assert!(plain.steps.is_empty());
        assert_eq!(plain.last_key(), "id");
    }

    #[test]
    fn test_needs_numeric_cast() {
        let ten = FilterValue::String("10".to_string());
        assert!(needs_numeric_cast("data->>price", &ten));
        assert!(needs_numeric_cast("data->x->>price", &FilterValue::from(9.5)));
        assert!(needs_numeric_cast("data->>price", &FilterValue::String("-3.25".into())));

        assert!(!needs_numeric_cast("data->price", &ten));
        assert!(!needs_numeric_cast("data->>price->x", &ten));
        assert!(!needs_numeric_cast("price", &ten));
        assert!(!needs_numeric_cast("data->>name", &FilterValue::String("bob".into())));
        assert!(!needs_numeric_cast("data->>flag", &FilterValue::Bool(true)));
    }

    #[test]
    fn test_numeric_literal() {
        assert!(is_numeric_literal("0"));
        assert!(is_numeric_literal("12.5"));
        assert!(is_numeric_literal("-7"));
        assert!(is_numeric_literal("1e10"));
        assert!(!is_numeric_literal("12abc"));
        assert!(!is_numeric_literal(""));
        assert!(!is_numeric_literal("1.2.3"));
    }
}
