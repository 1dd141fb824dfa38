//! Condition building for SQL WHERE and ORDER BY clauses
//!
//! Converts [`Filter`] and [`OrderBy`] values into parameterized SQL. Filters
//! whose column fails identifier validation, or whose value does not fit the
//! operator, are dropped: they contribute neither SQL text nor arguments.

use tracing::debug;

use crate::params::{parse_operator_value, split_distance};
use crate::sql::jsonpath::{compile_path, is_numeric_literal, needs_numeric_cast};
use crate::sql::sanitize::is_valid_identifier;
use crate::types::{
    ComparisonOp, Filter, FilterValue, NullsOrder, Operator, OrderBy, PatternOp, SetOp, SpatialOp,
};

/// Positional argument list for one statement
///
/// Placeholders are numbered `$1, $2, ...` in the order values are pushed, so
/// the argument order always matches the emitted SQL text.
#[derive(Debug, Clone, Default)]
pub struct SqlParams {
    args: Vec<serde_json::Value>,
}

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument and return its placeholder
    pub fn push(&mut self, value: serde_json::Value) -> String {
        self.args.push(value);
        format!("${}", self.args.len())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn into_args(self) -> Vec<serde_json::Value> {
        self.args
    }
}

/// Render one filter as a SQL predicate
///
/// Returns `None` (and pushes no arguments) when the filter must be dropped.
pub fn render_filter(filter: &Filter, params: &mut SqlParams) -> Option<String> {
    let Some(lhs) = compile_path(&filter.column) else {
        debug!(column = %filter.column, "dropping filter on invalid column");
        return None;
    };
    let rendered = render_predicate(&filter.column, &lhs, &filter.operator, &filter.value, params);
    if rendered.is_none() {
        debug!(column = %filter.column, operator = %filter.operator, "dropping filter with unusable value");
    }
    rendered
}

fn render_predicate(
    column: &str,
    lhs: &str,
    operator: &Operator,
    value: &FilterValue,
    params: &mut SqlParams,
) -> Option<String> {
    match operator {
        Operator::Comparison(op) => render_comparison(column, lhs, *op, value, params),
        Operator::Pattern(op) => {
            let pattern = value.as_text()?.replace('*', "%");
            let keyword = match op {
                PatternOp::Like => "LIKE",
                PatternOp::Ilike => "ILIKE",
            };
            Some(format!(
                "{} {} {}",
                lhs,
                keyword,
                params.push(serde_json::Value::String(pattern))
            ))
        }
        Operator::Set(SetOp::In) => {
            let items = match value {
                FilterValue::List(items) => items.clone(),
                FilterValue::Null => return None,
                other => vec![other.as_text()?],
            };
            Some(format!(
                "{} = ANY({})",
                lhs,
                params.push(FilterValue::List(items).to_json())
            ))
        }
        Operator::Set(SetOp::Contains) => render_containment(lhs, "@>", value, params),
        Operator::Set(SetOp::ContainedBy) => render_containment(lhs, "<@", value, params),
        Operator::Set(SetOp::Overlaps) => render_containment(lhs, "&&", value, params),
        Operator::Is => match value {
            FilterValue::Null => Some(format!("{} IS NULL", lhs)),
            FilterValue::Bool(true) => Some(format!("{} IS TRUE", lhs)),
            FilterValue::Bool(false) => Some(format!("{} IS FALSE", lhs)),
            FilterValue::String(s) if s.eq_ignore_ascii_case("unknown") => {
                Some(format!("{} IS UNKNOWN", lhs))
            }
            FilterValue::List(_) => None,
            other => Some(format!(
                "{} IS NOT DISTINCT FROM {}",
                lhs,
                params.push(other.to_json())
            )),
        },
        Operator::TextSearch { mode, config } => {
            let query = value.as_text()?;
            match config {
                Some(config) => {
                    if !is_valid_identifier(config) {
                        return None;
                    }
                    let config = params.push(serde_json::Value::String(config.clone()));
                    let query = params.push(serde_json::Value::String(query));
                    Some(format!(
                        "{} @@ {}({}::regconfig, {})",
                        lhs,
                        mode.function(),
                        config,
                        query
                    ))
                }
                None => Some(format!(
                    "{} @@ {}({})",
                    lhs,
                    mode.function(),
                    params.push(serde_json::Value::String(query))
                )),
            }
        }
        Operator::Range(op) => {
            if value.is_null() {
                return None;
            }
            Some(format!("{} {} {}", lhs, op.as_sql(), params.push(value.to_json())))
        }
        Operator::Spatial(op) => render_spatial(lhs, *op, value, params),
        Operator::Not => {
            let raw = value.as_text()?;
            let (inner_op, inner_value) = parse_operator_value(&raw).ok()?;
            let inner = render_predicate(column, lhs, &inner_op, &inner_value, params)?;
            Some(format!("NOT ({})", inner))
        }
    }
}

fn render_containment(
    lhs: &str,
    symbol: &str,
    value: &FilterValue,
    params: &mut SqlParams,
) -> Option<String> {
    if value.is_null() {
        return None;
    }
    Some(format!("{} {} {}", lhs, symbol, params.push(value.to_json())))
}

fn render_comparison(
    column: &str,
    lhs: &str,
    op: ComparisonOp,
    value: &FilterValue,
    params: &mut SqlParams,
) -> Option<String> {
    match value {
        FilterValue::Null => match op {
            ComparisonOp::Eq => Some(format!("{} IS NULL", lhs)),
            ComparisonOp::Neq => Some(format!("{} IS NOT NULL", lhs)),
            _ => None,
        },
        FilterValue::List(_) => None,
        _ if needs_numeric_cast(column, value) => {
            let number = numeric_argument(value)?;
            Some(format!(
                "({})::numeric {} {}",
                lhs,
                op.as_sql(),
                params.push(number)
            ))
        }
        _ => Some(format!(
            "{} {} {}",
            lhs,
            op.as_sql(),
            params.push(value.to_json())
        )),
    }
}

fn render_spatial(
    lhs: &str,
    op: SpatialOp,
    value: &FilterValue,
    params: &mut SqlParams,
) -> Option<String> {
    let raw = value.as_text()?;

    if op.takes_distance() {
        let (distance, geometry) = split_distance(&raw)?;
        let distance = serde_json::Number::from_f64(distance)?;
        let geometry = params.push(serde_json::Value::String(geometry.to_string()));
        let distance = params.push(serde_json::Value::Number(distance));
        return Some(match op {
            SpatialOp::DWithin => format!(
                "ST_DWithin({}, ST_GeomFromGeoJSON({}), {})",
                lhs, geometry, distance
            ),
            _ => format!(
                "ST_Distance({}, ST_GeomFromGeoJSON({})) <= {}",
                lhs, geometry, distance
            ),
        });
    }

    Some(format!(
        "{}({}, ST_GeomFromGeoJSON({}))",
        op.function(),
        lhs,
        params.push(serde_json::Value::String(raw))
    ))
}

/// Numeric argument for a `::numeric` comparison
fn numeric_argument(value: &FilterValue) -> Option<serde_json::Value> {
    match value {
        FilterValue::Number(n) => Some(serde_json::Value::Number(n.clone())),
        FilterValue::String(s) if is_numeric_literal(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(serde_json::Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
        }
        _ => None,
    }
}

/// Build a WHERE condition (without the `WHERE` keyword)
///
/// Consecutive filters sharing a non-zero OR group become one parenthesized
/// `OR` clause at the position of the group; everything is then joined with
/// `AND`. Returns `None` when no filter survives.
pub fn build_where_clause(filters: &[Filter], params: &mut SqlParams) -> Option<String> {
    let mut clauses = Vec::new();
    let mut i = 0;

    while i < filters.len() {
        let group = filters[i].or_group_id;
        if group == 0 {
            if let Some(clause) = render_filter(&filters[i], params) {
                clauses.push(clause);
            }
            i += 1;
            continue;
        }

        let mut members = Vec::new();
        while i < filters.len() && filters[i].or_group_id == group {
            if let Some(clause) = render_filter(&filters[i], params) {
                members.push(clause);
            }
            i += 1;
        }
        if !members.is_empty() {
            clauses.push(format!("({})", members.join(" OR ")));
        }
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

/// Build an ORDER BY list (without the `ORDER BY` keyword)
///
/// Entries on invalid columns are dropped. Returns `None` when nothing is left.
pub fn build_order_by_clause(order: &[OrderBy]) -> Option<String> {
    let parts: Vec<String> = order
        .iter()
        .filter_map(|entry| {
            let Some(expr) = compile_path(&entry.column) else {
                debug!(column = %entry.column, "dropping order on invalid column");
                return None;
            };
            Some(order_term(&expr, entry))
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// `expr ASC|DESC [NULLS FIRST|LAST]`
pub fn order_term(expr: &str, entry: &OrderBy) -> String {
    let mut part = format!("{} {}", expr, if entry.desc { "DESC" } else { "ASC" });
    match entry.nulls {
        Some(NullsOrder::First) => part.push_str(" NULLS FIRST"),
        Some(NullsOrder::Last) => part.push_str(" NULLS LAST"),
        None => {}
    }
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RangeOp, TextSearchMode};
    use serde_json::json;

    fn render(filter: Filter) -> (Option<String>, Vec<serde_json::Value>) {
        let mut params = SqlParams::new();
        let sql = render_filter(&filter, &mut params);
        (sql, params.into_args())
    }

    fn op(name: &str) -> Operator {
        name.parse().unwrap()
    }

    // ==================== Comparison Operations ====================

    #[test]
    fn test_eq_condition() {
        let (sql, args) = render(Filter::eq("name", "test"));
        assert_eq!(sql.as_deref(), Some("\"name\" = $1"));
        assert_eq!(args, vec![json!("test")]);
    }

    #[test]
    fn test_comparison_operators() {
        for (name, symbol) in [
            ("neq", "<>"),
            ("gt", ">"),
            ("gte", ">="),
            ("lt", "<"),
            ("lte", "<="),
        ] {
            let (sql, args) = render(Filter::new("age", op(name), 18));
            assert_eq!(sql, Some(format!("\"age\" {} $1", symbol)));
            assert_eq!(args, vec![json!(18)]);
        }
    }

    #[test]
    fn test_eq_null_becomes_is_null() {
        let (sql, args) = render(Filter::eq("deleted_at", FilterValue::Null));
        assert_eq!(sql.as_deref(), Some("\"deleted_at\" IS NULL"));
        assert!(args.is_empty());

        let (sql, _) = render(Filter::new("deleted_at", Operator::NEQ, FilterValue::Null));
        assert_eq!(sql.as_deref(), Some("\"deleted_at\" IS NOT NULL"));

        let (sql, _) = render(Filter::new("age", Operator::GT, FilterValue::Null));
        assert_eq!(sql, None);
    }

    #[test]
    fn test_json_path_numeric_cast() {
        let (sql, args) = render(Filter::new("data->>price", Operator::GT, "10"));
        assert_eq!(sql.as_deref(), Some("(\"data\"->>'price')::numeric > $1"));
        assert_eq!(args, vec![json!(10)]);

        let (sql, args) = render(Filter::new("data->a->>score", Operator::LTE, "2.5"));
        assert_eq!(sql.as_deref(), Some("(\"data\"->'a'->>'score')::numeric <= $1"));
        assert_eq!(args, vec![json!(2.5)]);
    }

    #[test]
    fn test_json_path_text_comparison_without_cast() {
        let (sql, args) = render(Filter::eq("data->>name", "bob"));
        assert_eq!(sql.as_deref(), Some("\"data\"->>'name' = $1"));
        assert_eq!(args, vec![json!("bob")]);

        let (sql, _) = render(Filter::eq("data->count", "3"));
        assert_eq!(sql.as_deref(), Some("\"data\"->'count' = $1"));
    }

    // ==================== Pattern / Set Operations ====================

    #[test]
    fn test_like_wildcards() {
        let (sql, args) = render(Filter::new("name", op("ilike"), "*john*"));
        assert_eq!(sql.as_deref(), Some("\"name\" ILIKE $1"));
        assert_eq!(args, vec![json!("%john%")]);

        let (sql, _) = render(Filter::new("name", op("like"), "J%"));
        assert_eq!(sql.as_deref(), Some("\"name\" LIKE $1"));
    }

    #[test]
    fn test_in_uses_any_with_single_array_param() {
        let (sql, args) = render(Filter::new(
            "id",
            Operator::IN,
            FilterValue::List(vec!["1".into(), "2".into(), "3".into()]),
        ));
        assert_eq!(sql.as_deref(), Some("\"id\" = ANY($1)"));
        assert_eq!(args, vec![json!(["1", "2", "3"])]);
    }

    #[test]
    fn test_containment_and_overlap() {
        let (sql, args) = render(Filter::new("tags", op("cs"), json!(["a"])));
        assert_eq!(sql.as_deref(), Some("\"tags\" @> $1"));
        assert_eq!(args, vec![json!(["a"])]);

        let (sql, _) = render(Filter::new("tags", op("cd"), "{a,b}"));
        assert_eq!(sql.as_deref(), Some("\"tags\" <@ $1"));

        let (sql, _) = render(Filter::new("tags", op("ov"), "{a,b}"));
        assert_eq!(sql.as_deref(), Some("\"tags\" && $1"));
    }

    #[test]
    fn test_is_operator() {
        let (sql, _) = render(Filter::new("a", Operator::Is, FilterValue::Null));
        assert_eq!(sql.as_deref(), Some("\"a\" IS NULL"));
        let (sql, _) = render(Filter::new("a", Operator::Is, true));
        assert_eq!(sql.as_deref(), Some("\"a\" IS TRUE"));
        let (sql, _) = render(Filter::new("a", Operator::Is, false));
        assert_eq!(sql.as_deref(), Some("\"a\" IS FALSE"));
        let (sql, _) = render(Filter::new("a", Operator::Is, "unknown"));
        assert_eq!(sql.as_deref(), Some("\"a\" IS UNKNOWN"));
        let (sql, args) = render(Filter::new("a", Operator::Is, "x"));
        assert_eq!(sql.as_deref(), Some("\"a\" IS NOT DISTINCT FROM $1"));
        assert_eq!(args, vec![json!("x")]);
    }

    // ==================== Full text / range / spatial ====================

    #[test]
    fn test_full_text_search_variants() {
        let (sql, args) = render(Filter::new("body", op("fts"), "cat"));
        assert_eq!(sql.as_deref(), Some("\"body\" @@ plainto_tsquery($1)"));
        assert_eq!(args, vec![json!("cat")]);

        let (sql, _) = render(Filter::new("body", op("phfts"), "fat cat"));
        assert_eq!(sql.as_deref(), Some("\"body\" @@ phraseto_tsquery($1)"));

        let (sql, args) = render(Filter::new(
            "body",
            Operator::TextSearch {
                mode: TextSearchMode::Websearch,
                config: Some("english".into()),
            },
            "cat -dog",
        ));
        assert_eq!(
            sql.as_deref(),
            Some("\"body\" @@ websearch_to_tsquery($1::regconfig, $2)")
        );
        assert_eq!(args, vec![json!("english"), json!("cat -dog")]);
    }

    #[test]
    fn test_text_search_rejects_bad_config() {
        let (sql, args) = render(Filter::new(
            "body",
            Operator::TextSearch {
                mode: TextSearchMode::Plain,
                config: Some("english'); --".into()),
            },
            "cat",
        ));
        assert_eq!(sql, None);
        assert!(args.is_empty());
    }

    #[test]
    fn test_range_operators() {
        let (sql, _) = render(Filter::new("during", Operator::Range(RangeOp::Adjacent), "[1,5)"));
        assert_eq!(sql.as_deref(), Some("\"during\" -|- $1"));
        let (sql, _) = render(Filter::new("during", op("sl"), "[1,5)"));
        assert_eq!(sql.as_deref(), Some("\"during\" << $1"));
        let (sql, _) = render(Filter::new("during", op("nxr"), "[1,5)"));
        assert_eq!(sql.as_deref(), Some("\"during\" &< $1"));
    }

    #[test]
    fn test_spatial_predicates() {
        let point = r#"{"type":"Point","coordinates":[1,2]}"#;
        for (name, function) in [
            ("st_intersects", "ST_Intersects"),
            ("st_contains", "ST_Contains"),
            ("st_within", "ST_Within"),
            ("st_touches", "ST_Touches"),
            ("st_crosses", "ST_Crosses"),
            ("st_overlaps", "ST_Overlaps"),
        ] {
            let (sql, args) = render(Filter::new("geom", op(name), point));
            assert_eq!(
                sql,
                Some(format!("{}(\"geom\", ST_GeomFromGeoJSON($1))", function))
            );
            assert_eq!(args, vec![json!(point)]);
        }
    }

    #[test]
    fn test_spatial_distance_predicates() {
        let value = r#"500,{"type":"Point","coordinates":[1,2]}"#;
        let (sql, args) = render(Filter::new("geom", op("st_dwithin"), value));
        assert_eq!(
            sql.as_deref(),
            Some("ST_DWithin(\"geom\", ST_GeomFromGeoJSON($1), $2)")
        );
        assert_eq!(
            args,
            vec![json!(r#"{"type":"Point","coordinates":[1,2]}"#), json!(500.0)]
        );

        let (sql, _) = render(Filter::new("geom", op("st_distance"), value));
        assert_eq!(
            sql.as_deref(),
            Some("ST_Distance(\"geom\", ST_GeomFromGeoJSON($1)) <= $2")
        );

        let (sql, args) = render(Filter::new("geom", op("st_dwithin"), "nope"));
        assert_eq!(sql, None);
        assert!(args.is_empty());
    }

    // ==================== NOT ====================

    #[test]
    fn test_not_wraps_inner_expression() {
        let (sql, args) = render(Filter::new("status", Operator::Not, "eq.deleted"));
        assert_eq!(sql.as_deref(), Some("NOT (\"status\" = $1)"));
        assert_eq!(args, vec![json!("deleted")]);

        let (sql, args) = render(Filter::new("id", Operator::Not, "in.(1,2)"));
        assert_eq!(sql.as_deref(), Some("NOT (\"id\" = ANY($1))"));
        assert_eq!(args, vec![json!(["1", "2"])]);

        let (sql, _) = render(Filter::new("a", Operator::Not, "not.is.null"));
        assert_eq!(sql.as_deref(), Some("NOT (NOT (\"a\" IS NULL))"));
    }

    #[test]
    fn test_not_with_malformed_inner_is_dropped() {
        let (sql, args) = render(Filter::new("status", Operator::Not, "deleted"));
        assert_eq!(sql, None);
        assert!(args.is_empty());
    }

    // ==================== Dropping ====================

    #[test]
    fn test_invalid_column_dropped() {
        let (sql, args) = render(Filter::eq("name; DROP TABLE users", "x"));
        assert_eq!(sql, None);
        assert!(args.is_empty());
    }

    // ==================== WHERE assembly ====================

    #[test]
    fn test_where_and_join() {
        let mut params = SqlParams::new();
        let clause = build_where_clause(
            &[Filter::eq("status", "active"), Filter::new("age", Operator::GTE, 18)],
            &mut params,
        );
        assert_eq!(clause.as_deref(), Some("\"status\" = $1 AND \"age\" >= $2"));
        assert_eq!(params.into_args(), vec![json!("active"), json!(18)]);
    }

    #[test]
    fn test_where_or_group() {
        let mut params = SqlParams::new();
        let clause = build_where_clause(
            &[
                Filter::eq("role", "admin").in_or_group(1),
                Filter::eq("role", "moderator").in_or_group(1),
            ],
            &mut params,
        );
        assert_eq!(clause.as_deref(), Some("(\"role\" = $1 OR \"role\" = $2)"));
    }

    #[test]
    fn test_where_groups_keep_position() {
        let mut params = SqlParams::new();
        let clause = build_where_clause(
            &[
                Filter::eq("a", 1),
                Filter::eq("b", 2).in_or_group(1),
                Filter::eq("c", 3).in_or_group(1),
                Filter::eq("d", 4),
                Filter::eq("e", 5).in_or_group(2),
                Filter::eq("f", 6).in_or_group(2),
            ],
            &mut params,
        );
        assert_eq!(
            clause.as_deref(),
            Some("\"a\" = $1 AND (\"b\" = $2 OR \"c\" = $3) AND \"d\" = $4 AND (\"e\" = $5 OR \"f\" = $6)")
        );
        assert_eq!(params.len(), 6);
    }

    #[test]
    fn test_where_drops_invalid_members() {
        let mut params = SqlParams::new();
        let clause = build_where_clause(
            &[
                Filter::eq("bad col", "x"),
                Filter::eq("ok", "y").in_or_group(1),
                Filter::eq("1bad", "z").in_or_group(1),
            ],
            &mut params,
        );
        assert_eq!(clause.as_deref(), Some("(\"ok\" = $1)"));
        assert_eq!(params.into_args(), vec![json!("y")]);
    }

    #[test]
    fn test_where_empty() {
        let mut params = SqlParams::new();
        assert_eq!(build_where_clause(&[], &mut params), None);
        assert_eq!(
            build_where_clause(&[Filter::eq("x y", 1)], &mut params),
            None
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_param_numbering_continues() {
        let mut params = SqlParams::new();
        params.push(json!("earlier"));
        let clause = build_where_clause(&[Filter::eq("a", 1)], &mut params);
        assert_eq!(clause.as_deref(), Some("\"a\" = $2"));
    }

    // ==================== ORDER BY ====================

    #[test]
    fn test_order_by_clause() {
        let order = vec![
            OrderBy::desc("created_at").nulls(Some(NullsOrder::Last)),
            OrderBy::asc("name"),
            OrderBy::asc("data->>rank").nulls(Some(NullsOrder::First)),
        ];
        assert_eq!(
            build_order_by_clause(&order).as_deref(),
            Some("\"created_at\" DESC NULLS LAST, \"name\" ASC, \"data\"->>'rank' ASC NULLS FIRST")
        );
    }

    #[test]
    fn test_order_by_drops_invalid() {
        assert_eq!(build_order_by_clause(&[OrderBy::asc("a;b")]), None);
        assert_eq!(
            build_order_by_clause(&[OrderBy::asc("a;b"), OrderBy::desc("b")]).as_deref(),
            Some("\"b\" DESC")
        );
    }
}
