//! Keyset pagination cursors
//!
//! A cursor is the standard-alphabet base64 encoding of
//! `{"column": ..., "value": ..., "desc": ...}`. It is created when a page is
//! emitted, round-tripped opaquely by the client and decoded into a `>`/`<`
//! filter on the next request. Nothing is kept server-side.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Filter, FilterValue, Operator};

/// Decoded pagination cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Sort column of the last row seen
    pub column: String,
    /// Sort value of the last row seen
    #[serde(default)]
    pub value: serde_json::Value,
    /// Whether the page was sorted descending
    #[serde(default)]
    pub desc: bool,
}

/// Cursor decoding failures, one stable category per cause
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor is not valid base64")]
    InvalidEncoding,

    #[error("cursor does not contain valid JSON")]
    InvalidJson,

    #[error("cursor is missing the column field")]
    MissingColumn,

    #[error("cursor has no value to continue from")]
    NullValue,
}

impl CursorError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            CursorError::InvalidEncoding => "invalid_cursor_encoding",
            CursorError::InvalidJson => "invalid_cursor_json",
            CursorError::MissingColumn => "cursor_missing_column",
            CursorError::NullValue => "cursor_null_value",
        }
    }
}

impl Cursor {
    pub fn new(column: impl Into<String>, value: serde_json::Value, desc: bool) -> Self {
        Self {
            column: column.into(),
            value,
            desc,
        }
    }

    /// Keyset filter that selects rows strictly after this cursor
    ///
    /// `>` for ascending pages, `<` for descending ones.
    pub fn to_filter(&self) -> Filter {
        let operator = if self.desc { Operator::LT } else { Operator::GT };
        Filter::new(
            self.column.clone(),
            operator,
            FilterValue::from_json(self.value.clone()),
        )
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of String/Value/bool cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }
}

/// Encode a cursor token
///
/// # Example
/// ```
/// use runtara_data_api::cursor::{decode_cursor, encode_cursor};
///
/// let token = encode_cursor("id", serde_json::json!(42), false);
/// let cursor = decode_cursor(&token).unwrap();
/// assert_eq!(cursor.column, "id");
/// assert_eq!(cursor.value, serde_json::json!(42));
/// ```
pub fn encode_cursor(column: &str, value: serde_json::Value, desc: bool) -> String {
    Cursor::new(column, value, desc).encode()
}

/// Decode a cursor token
///
/// Unknown JSON fields are ignored. A missing or empty `column` is an error.
pub fn decode_cursor(token: &str) -> Result<Cursor, CursorError> {
    let bytes = BASE64
        .decode(token.trim())
        .map_err(|_| CursorError::InvalidEncoding)?;

    let json: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| CursorError::InvalidJson)?;

    let object = json.as_object().ok_or(CursorError::InvalidJson)?;
    let column = match object.get("column") {
        Some(serde_json::Value::String(column)) if !column.is_empty() => column.clone(),
        _ => return Err(CursorError::MissingColumn),
    };

    Ok(Cursor {
        column,
        value: object.get("value").cloned().unwrap_or_default(),
        desc: object
            .get("desc")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    })
}

/// Token for the page following `row`, sorted on `column`
///
/// Returns `None` when the row does not carry the sort column or its value
/// is null, since no keyset filter can continue after a null.
pub fn next_cursor(
    row: &serde_json::Map<String, serde_json::Value>,
    column: &str,
    desc: bool,
) -> Option<String> {
    row.get(column)
        .filter(|value| !value.is_null())
        .map(|value| encode_cursor(column, value.clone(), desc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        for (column, value, desc) in [
            ("id", json!("last123"), false),
            ("created_at", json!("2024-01-01T00:00:00Z"), true),
            ("score", json!(9.75), true),
            ("rank", json!(null), false),
            ("meta", json!({"a": [1, 2]}), false),
        ] {
            let token = encode_cursor(column, value.clone(), desc);
            let cursor = decode_cursor(&token).unwrap();
            assert_eq!(cursor, Cursor::new(column, value, desc));
        }
    }

    #[test]
    fn test_encoding_is_base64_json() {
        let token = encode_cursor("id", json!(5), true);
        let decoded = BASE64.decode(&token).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value, json!({"column": "id", "value": 5, "desc": true}));
    }

    #[test]
    fn test_invalid_base64() {
        let err = decode_cursor("not base64!!").unwrap_err();
        assert_eq!(err, CursorError::InvalidEncoding);
        assert_eq!(err.code(), "invalid_cursor_encoding");
    }

    #[test]
    fn test_invalid_json() {
        let token = BASE64.encode("{not json");
        assert_eq!(decode_cursor(&token).unwrap_err(), CursorError::InvalidJson);

        let token = BASE64.encode("[1,2,3]");
        assert_eq!(decode_cursor(&token).unwrap_err(), CursorError::InvalidJson);
    }

    #[test]
    fn test_missing_column() {
        let token = BASE64.encode(r#"{"value": 1, "desc": false}"#);
        let err = decode_cursor(&token).unwrap_err();
        assert_eq!(err, CursorError::MissingColumn);
        assert_eq!(err.code(), "cursor_missing_column");

        let token = BASE64.encode(r#"{"column": "", "value": 1}"#);
        assert_eq!(decode_cursor(&token).unwrap_err(), CursorError::MissingColumn);

        let token = BASE64.encode(r#"{"column": 7}"#);
        assert_eq!(decode_cursor(&token).unwrap_err(), CursorError::MissingColumn);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let token = BASE64.encode(r#"{"column": "id", "value": 3, "desc": false, "v": 2}"#);
        let cursor = decode_cursor(&token).unwrap();
        assert_eq!(cursor, Cursor::new("id", json!(3), false));
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let codes = [
            CursorError::InvalidEncoding.code(),
            CursorError::InvalidJson.code(),
            CursorError::MissingColumn.code(),
            CursorError::NullValue.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(CursorError::NullValue.code(), "cursor_null_value");
    }

    #[test]
    fn test_to_filter_direction() {
        let asc = Cursor::new("id", json!("abc"), false).to_filter();
        assert_eq!(asc.operator, Operator::GT);
        assert_eq!(asc.value, FilterValue::String("abc".into()));

        let desc = Cursor::new("id", json!(10), true).to_filter();
        assert_eq!(desc.operator, Operator::LT);
        assert_eq!(desc.or_group_id, 0);
    }

    #[test]
    fn test_next_cursor_from_row() {
        let row = json!({"id": 42, "name": "x"});
        let row = row.as_object().unwrap();
        let token = next_cursor(row, "id", false).unwrap();
        assert_eq!(decode_cursor(&token).unwrap(), Cursor::new("id", json!(42), false));
        assert!(next_cursor(row, "missing", false).is_none());
    }

    #[test]
    fn test_next_cursor_skips_null_value() {
        let row = json!({"id": 7, "score": null});
        let row = row.as_object().unwrap();
        assert_eq!(next_cursor(row, "score", false), None);
        assert_eq!(next_cursor(row, "score", true), None);
    }
}
