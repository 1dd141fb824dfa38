//! Query-string parsing
//!
//! Turns the (multi-valued) query-string pairs of a request into a
//! [`QueryParams`]. Reserved keys are `select`, `order`, `limit`, `offset`,
//! `count`, `group_by` and `cursor`; `or`/`and` carry logical groups; every
//! other key is a filter in either `column.operator=value` or
//! `column=operator.value` form.

mod select;

pub use select::{SelectClause, parse_select};
pub(crate) use select::split_alias;

use crate::config::EngineConfig;
use crate::error::{DataApiError, Result};
use crate::types::{
    EmbeddedRelation, Filter, FilterValue, NullsOrder, Operator, OrderBy, QueryParams, SetOp,
};

/// Paging limits applied while parsing
///
/// A value of 0 or less disables the corresponding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_limit: i64,
    pub max_limit: i64,
    pub max_total_results: i64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: 0,
            max_limit: 0,
            max_total_results: 0,
        }
    }
}

impl From<&EngineConfig> for PageLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            max_total_results: config.max_total_results,
        }
    }
}

impl PageLimits {
    /// Resolve the effective limit for a request
    ///
    /// The requested limit (or the default) is clamped to `max_limit`, then
    /// reduced so that `offset + limit` stays within `max_total_results`.
    pub fn apply(&self, requested: Option<i64>, offset: Option<i64>) -> Option<i64> {
        let mut limit = requested.or((self.default_limit > 0).then_some(self.default_limit));

        if self.max_limit > 0 {
            limit = Some(limit.map_or(self.max_limit, |l| l.min(self.max_limit)));
        }

        if self.max_total_results > 0 {
            let remaining = (self.max_total_results - offset.unwrap_or(0)).max(0);
            limit = Some(limit.map_or(remaining, |l| l.min(remaining)));
        }

        limit
    }
}

impl QueryParams {
    /// Parse query-string pairs
    ///
    /// Pairs are processed in order; repeated keys are all honoured, so
    /// `age=gte.18&age=lte.65` yields two filters.
    ///
    /// # Example
    /// ```
    /// use runtara_data_api::params::PageLimits;
    /// use runtara_data_api::QueryParams;
    ///
    /// let params = QueryParams::parse(
    ///     [("select", "id,name"), ("status", "eq.active"), ("age.gte", "18")],
    ///     PageLimits::default(),
    /// )
    /// .unwrap();
    /// assert_eq!(params.select, vec!["id", "name"]);
    /// assert_eq!(params.filters.len(), 2);
    /// ```
    pub fn parse<I, K, V>(values: I, limits: PageLimits) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = QueryParams::default();
        let mut filters = Vec::new();
        let mut requested_limit = None;
        let mut next_group = 1u32;

        for (key, value) in values {
            let key = key.as_ref().trim();
            let value = value.as_ref();

            match key {
                "select" => {
                    let clause = parse_select(value);
                    params.select.extend(clause.columns);
                    params.embedded.extend(clause.embedded);
                    params.aggregations.extend(clause.aggregations);
                }
                "order" => params.order.extend(parse_order(value)?),
                "limit" => requested_limit = Some(parse_non_negative("limit", value)?),
                "offset" => params.offset = Some(parse_non_negative("offset", value)?),
                "count" => params.count = value.trim().parse()?,
                "group_by" => params.group_by.extend(split_list(value)),
                "cursor" => {
                    let token = value.trim();
                    params.cursor = (!token.is_empty()).then(|| token.to_string());
                }
                "or" => {
                    filters.extend(parse_logical_group(value, Some(next_group))?);
                    next_group += 1;
                }
                "and" => filters.extend(parse_logical_group(value, None)?),
                "" => continue,
                _ => filters.push(parse_filter(key, value)?),
            }
        }

        for filter in filters {
            if let Some(filter) = attach_to_embedded(&mut params.embedded, filter) {
                params.filters.push(filter);
            }
        }

        params.limit = limits.apply(requested_limit, params.offset);

        Ok(params)
    }
}

fn parse_non_negative(name: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| {
            DataApiError::invalid_param(format!(
                "'{}' must be a non-negative integer, got '{}'",
                name, value
            ))
        })
}

/// Comma list, ignoring empty items
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse one filter key/value pair
///
/// When the key contains a dot and the part after the last dot is a known
/// operator, the classic `column.operator=value` form wins. Otherwise the
/// value must be `operator.value`.
pub fn parse_filter(key: &str, value: &str) -> Result<Filter> {
    if let Some((column, op)) = key.rsplit_once('.') {
        if let Ok(operator) = op.parse::<Operator>() {
            let value = build_value(&operator, value)?;
            return Ok(Filter::new(non_empty_column(column)?, operator, value));
        }
    }

    let (operator, value) = parse_operator_value(value).map_err(|_| {
        DataApiError::invalid_filter(format!(
            "Malformed filter '{}={}': expected 'column=operator.value' or 'column.operator=value'",
            key, value
        ))
    })?;
    Ok(Filter::new(non_empty_column(key)?, operator, value))
}

fn non_empty_column(column: &str) -> Result<&str> {
    let column = column.trim();
    if column.is_empty() {
        Err(DataApiError::invalid_filter("Filter column cannot be empty"))
    } else {
        Ok(column)
    }
}

/// Parse `operator.value`, e.g. `gte.18` or `in.(a,b)`
pub fn parse_operator_value(input: &str) -> Result<(Operator, FilterValue)> {
    let (name, raw) = split_operator(input).ok_or_else(|| {
        DataApiError::invalid_filter(format!("Expected 'operator.value', got '{}'", input))
    })?;
    let operator: Operator = name.parse()?;
    let value = build_value(&operator, raw)?;
    Ok((operator, value))
}

/// Split at the first dot that is not inside a `(config)` suffix
fn split_operator(input: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            '.' if depth == 0 => return Some((&input[..i], &input[i + 1..])),
            _ => {}
        }
    }
    None
}

/// Coerce the raw string for an operator
fn build_value(operator: &Operator, raw: &str) -> Result<FilterValue> {
    match operator {
        Operator::Set(SetOp::In) => Ok(FilterValue::List(parse_list(raw))),
        Operator::Is => Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "null" => FilterValue::Null,
            "true" => FilterValue::Bool(true),
            "false" => FilterValue::Bool(false),
            _ => FilterValue::String(raw.to_string()),
        }),
        Operator::Spatial(op) if op.takes_distance() => {
            if split_distance(raw).is_none() {
                return Err(DataApiError::invalid_filter(format!(
                    "'{}' expects '<distance>,<geojson>', got '{}'",
                    Operator::Spatial(*op),
                    raw
                )));
            }
            Ok(FilterValue::String(raw.to_string()))
        }
        Operator::Not => {
            // validate the inner expression now so errors surface as 4xx
            parse_operator_value(raw)?;
            Ok(FilterValue::String(raw.to_string()))
        }
        _ => Ok(FilterValue::String(raw.to_string())),
    }
}

/// `<distance>,<geojson>` -> (distance, geojson)
pub fn split_distance(raw: &str) -> Option<(f64, &str)> {
    let (distance, geometry) = raw.split_once(',')?;
    let distance = distance.trim().parse::<f64>().ok().filter(|d| d.is_finite())?;
    let geometry = geometry.trim();
    (!geometry.is_empty()).then_some((distance, geometry))
}

/// Parse `(a,b,"c,d")`, `[a,b]` or `{a,b}` into items, stripping quotes
pub fn parse_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let inner = [('(', ')'), ('[', ']'), ('{', '}')]
        .iter()
        .find_map(|(open, close)| {
            trimmed
                .strip_prefix(*open)
                .and_then(|rest| rest.strip_suffix(*close))
        })
        .unwrap_or(trimmed);

    split_top_level(inner)
        .into_iter()
        .map(|item| strip_quotes(item.trim()).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn strip_quotes(item: &str) -> &str {
    for quote in ['"', '\''] {
        if item.len() >= 2 && item.starts_with(quote) && item.ends_with(quote) {
            return &item[1..item.len() - 1];
        }
    }
    item
}

/// Split on commas outside of parentheses and double quotes
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < input.len() {
        parts.push(&input[start..]);
    }
    parts
}

/// Parse `or=(a.eq.1,b.gt.2)` / `and=(...)`
///
/// `group` is `Some(id)` for OR groups; AND groups join the top level.
fn parse_logical_group(value: &str, group: Option<u32>) -> Result<Vec<Filter>> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(trimmed);

    let mut filters = Vec::new();
    for item in split_top_level(inner) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if item.starts_with("or(") || item.starts_with("and(") {
            return Err(DataApiError::invalid_filter(format!(
                "Nested logical groups are not supported: '{}'",
                item
            )));
        }

        let (column, rest) = item.split_once('.').ok_or_else(|| {
            DataApiError::invalid_filter(format!(
                "Malformed logical filter '{}': expected 'column.operator.value'",
                item
            ))
        })?;
        let (operator, value) = parse_operator_value(rest)?;
        let filter = Filter::new(non_empty_column(column)?, operator, value);

        filters.push(match group {
            Some(id) => filter.in_or_group(id),
            None => filter,
        });
    }

    if filters.is_empty() {
        return Err(DataApiError::invalid_filter(format!(
            "Logical group '{}' contains no filters",
            value
        )));
    }
    Ok(filters)
}

/// Parse `order=col.desc.nullslast,other`
pub fn parse_order(value: &str) -> Result<Vec<OrderBy>> {
    let mut order = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut parts = item.split('.');
        let column = parts.next().unwrap_or_default().trim();
        if column.is_empty() {
            return Err(DataApiError::invalid_order(format!(
                "Missing column in order item '{}'",
                item
            )));
        }

        let mut entry = OrderBy::asc(column);
        for modifier in parts {
            match modifier.to_ascii_lowercase().as_str() {
                "asc" => entry.desc = false,
                "desc" => entry.desc = true,
                "nullsfirst" | "nullslast" => entry.nulls = NullsOrder::parse(modifier),
                _ => {
                    return Err(DataApiError::invalid_order(format!(
                        "Invalid order modifier '{}' in '{}'. Must be asc, desc, nullsfirst or nullslast.",
                        modifier, item
                    )));
                }
            }
        }
        order.push(entry);
    }
    Ok(order)
}

/// Move `rel.column` filters onto the matching embedded relation
///
/// Returns the filter back when no relation matches.
fn attach_to_embedded(relations: &mut [EmbeddedRelation], filter: Filter) -> Option<Filter> {
    let Some((head, rest)) = filter.column.split_once('.') else {
        return Some(filter);
    };
    let Some(relation) = relations.iter_mut().find(|r| r.name == head) else {
        return Some(filter);
    };

    let nested = Filter {
        column: rest.to_string(),
        ..filter.clone()
    };
    if rest.contains('.') {
        match attach_to_embedded(&mut relation.embedded, nested) {
            None => None,
            Some(_) => Some(filter),
        }
    } else {
        relation.filters.push(nested);
        None
    }
}
