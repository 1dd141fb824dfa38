//! Type-aware argument binding
//!
//! Builders emit untyped JSON arguments. Before execution the statement is
//! described so every argument can be converted into the Rust type matching
//! the parameter type PostgreSQL inferred for it (`INT4`, `NUMERIC`,
//! `TEXT[]`, ...).
//!
//! Every other parameter type (booleans, dates and timestamps, ranges, enums,
//! `time`, `inet`, arrays of those) is sent as text and its placeholder is
//! rewritten to `$n::text::<type>`, so PostgreSQL parses the literal with its
//! own input rules.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArguments, PgTypeInfo};
use sqlx::{Arguments, Either, Encode, Executor, PgConnection, Postgres, Type, TypeInfo};
use tracing::debug;

use crate::error::{DataApiError, Result};
use crate::params::parse_list;

/// Statement text and the arguments bound for it
pub(crate) struct Prepared {
    pub sql: String,
    pub arguments: PgArguments,
}

/// Describe `sql` and bind every argument to its parameter type
pub(crate) async fn prepare(
    conn: &mut PgConnection,
    sql: &str,
    args: &[Value],
) -> Result<Prepared> {
    let mut arguments = PgArguments::default();
    if args.is_empty() {
        return Ok(Prepared {
            sql: sql.to_string(),
            arguments,
        });
    }

    let described = (&mut *conn).describe(sql).await?;
    let types: Vec<PgTypeInfo> = match described.parameters() {
        Some(Either::Left(types)) => types.to_vec(),
        _ => Vec::new(),
    };

    let cast_oids: Vec<Oid> = types
        .iter()
        .filter(|t| !is_native(t.name()))
        .filter_map(PgTypeInfo::oid)
        .collect();
    let type_names = sql_type_names(conn, cast_oids).await?;

    let mut casts = HashMap::new();
    for (i, value) in args.iter().enumerate() {
        let Some(type_info) = types.get(i) else {
            bind_by_shape(&mut arguments, value)?;
            continue;
        };

        let name = type_info.name();
        if is_native(name) {
            bind_native(&mut arguments, name, value)?;
            continue;
        }

        let cast = type_info
            .oid()
            .and_then(|oid| type_names.get(&oid).cloned())
            .unwrap_or_else(|| name.to_string());
        let text = if cast.ends_with("[]") {
            array_literal(value)
        } else {
            text_argument(value)
        };
        add(&mut arguments, text)?;
        casts.insert(i + 1, cast);
    }

    if !casts.is_empty() {
        debug!(casts = casts.len(), "binding parameters as text");
    }

    Ok(Prepared {
        sql: cast_placeholders(sql, &casts),
        arguments,
    })
}

/// SQL spelling of each type, e.g. `int4range`, `date[]` or `"Mood"`
async fn sql_type_names(
    conn: &mut PgConnection,
    oids: Vec<Oid>,
) -> Result<HashMap<Oid, String>> {
    if oids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Oid, String)> = sqlx::query_as(
        "SELECT t.oid, format_type(t.oid, NULL) FROM unnest($1::oid[]) AS t(oid)",
    )
    .bind(oids)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Types with a binary encoder on the Rust side
fn is_native(type_name: &str) -> bool {
    matches!(
        type_name,
        "INT2"
            | "INT4"
            | "INT8"
            | "FLOAT4"
            | "FLOAT8"
            | "NUMERIC"
            | "UUID"
            | "JSON"
            | "JSONB"
            | "TEXT"
            | "VARCHAR"
            | "BPCHAR"
            | "NAME"
            | "INT2[]"
            | "INT4[]"
            | "INT8[]"
            | "FLOAT4[]"
            | "FLOAT8[]"
            | "NUMERIC[]"
            | "UUID[]"
            | "TEXT[]"
            | "VARCHAR[]"
            | "BPCHAR[]"
            | "NAME[]"
    )
}

fn bind_native(arguments: &mut PgArguments, type_name: &str, value: &Value) -> Result<()> {
    match type_name {
        "INT2" => add(arguments, scalar::<i16>(type_name, value)?),
        "INT4" => add(arguments, scalar::<i32>(type_name, value)?),
        "INT8" => add(arguments, scalar::<i64>(type_name, value)?),
        "FLOAT4" => add(arguments, scalar::<f32>(type_name, value)?),
        "FLOAT8" => add(arguments, scalar::<f64>(type_name, value)?),
        "NUMERIC" => add(arguments, scalar::<Decimal>(type_name, value)?),
        "UUID" => add(arguments, scalar::<uuid::Uuid>(type_name, value)?),
        "JSON" | "JSONB" => add(arguments, json_argument(value)),
        "INT2[]" => add(arguments, array::<i16>(type_name, value)?),
        "INT4[]" => add(arguments, array::<i32>(type_name, value)?),
        "INT8[]" => add(arguments, array::<i64>(type_name, value)?),
        "FLOAT4[]" => add(arguments, array::<f32>(type_name, value)?),
        "FLOAT8[]" => add(arguments, array::<f64>(type_name, value)?),
        "NUMERIC[]" => add(arguments, array::<Decimal>(type_name, value)?),
        "UUID[]" => add(arguments, array::<uuid::Uuid>(type_name, value)?),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => {
            add(arguments, array::<String>(type_name, value)?)
        }
        _ => add(arguments, text_argument(value)),
    }
}

/// Fallback when no parameter types are available
fn bind_by_shape(arguments: &mut PgArguments, value: &Value) -> Result<()> {
    match value {
        Value::Null => add(arguments, None::<String>),
        Value::Bool(b) => add(arguments, *b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => add(arguments, i),
            None => match Decimal::from_str(&n.to_string()) {
                Ok(d) => add(arguments, d),
                Err(_) => add(arguments, n.as_f64()),
            },
        },
        Value::String(s) => add(arguments, s.clone()),
        Value::Array(items) if items.iter().all(Value::is_string) => add(
            arguments,
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect::<Vec<_>>(),
        ),
        other => add(arguments, other.clone()),
    }
}

fn add<T>(arguments: &mut PgArguments, value: T) -> Result<()>
where
    T: Send + 'static,
    for<'q> T: Encode<'q, Postgres> + Type<Postgres>,
{
    arguments
        .add(value)
        .map_err(|e| DataApiError::Sql(sqlx::Error::Encode(e)))
}

/// Rewrite the listed `$n` placeholders to `$n::text::<type>`
///
/// Quoted literals and identifiers are copied untouched, and `$1` never
/// matches the start of `$12`.
fn cast_placeholders(sql: &str, casts: &HashMap<usize, String>) -> String {
    if casts.is_empty() {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + casts.len() * 16);
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((start, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut end = start + 1;
                while let Some((i, d)) = chars.peek().copied() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                let token = &sql[start..end];
                out.push_str(token);
                if let Some(cast) = token[1..].parse::<usize>().ok().and_then(|n| casts.get(&n)) {
                    out.push_str("::text::");
                    out.push_str(cast);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Text form of a scalar JSON value
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn mismatch(type_name: &str, value: &Value) -> DataApiError {
    DataApiError::invalid_param(format!(
        "Value {} is not a valid {}",
        value,
        type_name.to_ascii_lowercase()
    ))
}

fn scalar<T: FromStr>(type_name: &str, value: &Value) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    text_of(value)
        .parse::<T>()
        .map(Some)
        .map_err(|_| mismatch(type_name, value))
}

fn list_items(value: &Value) -> Vec<Option<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| (!item.is_null()).then(|| text_of(item)))
            .collect(),
        Value::String(s) => parse_list(s).into_iter().map(Some).collect(),
        other => vec![Some(text_of(other))],
    }
}

/// Array argument from a JSON array or a `{a,b}` / `(a,b)` list literal
fn array<T: FromStr>(type_name: &str, value: &Value) -> Result<Option<Vec<T>>> {
    if value.is_null() {
        return Ok(None);
    }

    list_items(value)
        .into_iter()
        .map(|item| {
            item.and_then(|text| text.parse::<T>().ok())
                .ok_or_else(|| mismatch(type_name, value))
        })
        .collect::<Result<Vec<T>>>()
        .map(Some)
}

/// PostgreSQL array literal with every element quoted
fn array_literal(value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }

    let elements: Vec<String> = list_items(value)
        .into_iter()
        .map(|item| match item {
            Some(text) => format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\"")),
            None => "NULL".to_string(),
        })
        .collect();
    Some(format!("{{{}}}", elements.join(",")))
}

/// JSON argument; strings holding JSON documents are parsed
fn json_argument(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(serde_json::from_str(s).unwrap_or_else(|_| value.clone())),
        other => Some(other.clone()),
    }
}

fn text_argument(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
