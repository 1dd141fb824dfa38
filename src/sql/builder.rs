//! Parameterized statement builder
//!
//! [`QueryBuilder`] is a per-request value configured through `with_*`
//! methods and emitted with the `build_*` methods, each returning the SQL
//! text and its positional arguments. Building takes `&self`, so one
//! configured builder can emit several statements (page + count).
//!
//! Arguments are numbered by a single counter in the order they appear in
//! the text: projection sub-selects, SET values, WHERE, then LIMIT/OFFSET.

use serde_json::{Map, Value};
use tracing::debug;

use crate::cursor::{CursorError, decode_cursor};
use crate::error::Result;
use crate::params::split_alias;
use crate::sql::condition::{SqlParams, build_order_by_clause, build_where_clause, order_term};
use crate::sql::jsonpath::{JsonPath, compile_path};
use crate::sql::sanitize::{qualified_table, quoted};
use crate::types::{
    AggregateFunction, Aggregation, ColumnInfo, EmbeddedRelation, Filter, OnConflict, OrderBy,
    QueryParams, RelationKind, Relationship,
};

/// Column holding a row's position in [`QueryBuilder::build_ordered_select`] output
pub const ROW_ORDER_COLUMN: &str = "__row_order";

/// Builder for SELECT / COUNT / INSERT / UPDATE / DELETE statements on one table
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    schema: String,
    table: String,
    columns: Vec<String>,
    filters: Vec<Filter>,
    order: Vec<OrderBy>,
    limit: Option<i64>,
    offset: Option<i64>,
    returning: Vec<String>,
    group_by: Vec<String>,
    aggregations: Vec<Aggregation>,
    column_info: Vec<ColumnInfo>,
    relationships: Vec<Relationship>,
    embedded: Vec<EmbeddedRelation>,
    on_conflict: Option<(Vec<String>, OnConflict)>,
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl QueryBuilder {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    /// Builder configured from a parsed query string, cursor included
    pub fn from_params(
        schema: impl Into<String>,
        table: impl Into<String>,
        params: &QueryParams,
    ) -> Result<Self> {
        let builder = Self::new(schema, table)
            .with_columns(params.select.iter().cloned())
            .with_filters(params.filters.iter().cloned())
            .with_order(params.order.iter().cloned())
            .with_group_by(params.group_by.iter().cloned())
            .with_aggregations(params.aggregations.iter().cloned())
            .with_embedded(params.embedded.iter().cloned());

        let builder = match params.limit {
            Some(limit) => builder.with_limit(limit),
            None => builder,
        };
        let builder = match params.offset {
            Some(offset) => builder.with_offset(offset),
            None => builder,
        };

        builder.with_cursor(params.cursor.as_deref().unwrap_or(""), "")
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = strings(columns);
        self
    }

    /// Append filters to the ones already configured
    pub fn with_filters<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Filter>,
    {
        self.filters.extend(filters);
        self
    }

    pub fn with_order<I>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = OrderBy>,
    {
        self.order = order.into_iter().collect();
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Columns for `RETURNING`; `*` returns every column
    pub fn with_returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = strings(columns);
        self
    }

    pub fn with_group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = strings(columns);
        self
    }

    pub fn with_aggregations<I>(mut self, aggregations: I) -> Self
    where
        I: IntoIterator<Item = Aggregation>,
    {
        self.aggregations = aggregations.into_iter().collect();
        self
    }

    /// Known columns of the table, used for geometry-aware projection and writes
    pub fn with_column_info<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = ColumnInfo>,
    {
        self.column_info = columns.into_iter().collect();
        self
    }

    /// Register a relationship that embedded relations may use
    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_embedded<I>(mut self, embedded: I) -> Self
    where
        I: IntoIterator<Item = EmbeddedRelation>,
    {
        self.embedded = embedded.into_iter().collect();
        self
    }

    pub fn with_on_conflict<I, S>(mut self, columns: I, action: OnConflict) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.on_conflict = Some((strings(columns), action));
        self
    }

    /// Continue after a cursor token
    ///
    /// An empty token leaves the builder unchanged. Otherwise the token is
    /// decoded and a `>` (ascending) or `<` (descending) filter is appended.
    /// A non-empty `override_column` replaces the column stored in the token.
    /// A token carrying a null value is rejected, as no row sorts after it.
    pub fn with_cursor(mut self, token: &str, override_column: &str) -> Result<Self> {
        if token.trim().is_empty() {
            return Ok(self);
        }

        let mut cursor = decode_cursor(token)?;
        if cursor.value.is_null() {
            return Err(CursorError::NullValue.into());
        }
        if !override_column.is_empty() {
            cursor.column = override_column.to_string();
        }
        self.filters.push(cursor.to_filter());
        Ok(self)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column_info(&self) -> &[ColumnInfo] {
        &self.column_info
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    /// Whether write statements carry a `RETURNING` clause
    pub fn returns_rows(&self) -> bool {
        !self.returning.is_empty()
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// `SELECT`
    pub fn build_select(&self) -> (String, Vec<Value>) {
        self.select_statement(None)
    }

    /// `SELECT` that also projects each row's position in the requested order
    ///
    /// The position is `row_number()` over the same ordering, projected as
    /// [`ROW_ORDER_COLUMN`], so a wrapping query can restore the order.
    /// `None` when there is no usable order or table.
    pub fn build_ordered_select(&self) -> Option<(String, Vec<Value>)> {
        self.table_ref()?;
        let window = self.window_order()?;
        Some(self.select_statement(Some(&window)))
    }

    fn select_statement(&self, window: Option<&str>) -> (String, Vec<Value>) {
        let Some(table) = self.table_ref() else {
            return (String::new(), Vec::new());
        };

        let mut params = SqlParams::new();
        let mut select_list = self.select_list(&table, &mut params);
        if let Some(window) = window {
            select_list.push_str(&format!(
                ", row_number() OVER (ORDER BY {}) AS \"{}\"",
                window, ROW_ORDER_COLUMN
            ));
        }
        let mut sql = format!("SELECT {} FROM {}", select_list, table);
        self.push_where(&mut sql, &mut params);

        if let Some(group) = self.group_by_clause() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group);
        }
        if let Some(order) = build_order_by_clause(&self.order) {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&params.push(Value::from(limit)));
        }
        if let Some(offset) = self.offset {
            sql.push_str(" OFFSET ");
            sql.push_str(&params.push(Value::from(offset)));
        }

        (sql, params.into_args())
    }

    /// `SELECT COUNT(*)` over the filtered rows, ignoring paging
    ///
    /// With grouping, counts the groups through a derived table.
    pub fn build_count(&self) -> (String, Vec<Value>) {
        let Some(table) = self.table_ref() else {
            return (String::new(), Vec::new());
        };

        let mut params = SqlParams::new();
        let sql = match self.group_by_clause() {
            Some(group) => {
                let mut inner = format!("SELECT 1 FROM {}", table);
                self.push_where(&mut inner, &mut params);
                format!(
                    "SELECT COUNT(*) FROM ({} GROUP BY {}) AS \"groups\"",
                    inner, group
                )
            }
            None => {
                let mut sql = format!("SELECT COUNT(*) FROM {}", table);
                self.push_where(&mut sql, &mut params);
                sql
            }
        };

        (sql, params.into_args())
    }

    /// `EXPLAIN (FORMAT JSON)` of the filtered rows, for planner estimates
    pub fn build_count_estimate(&self) -> (String, Vec<Value>) {
        let Some(table) = self.table_ref() else {
            return (String::new(), Vec::new());
        };

        let mut params = SqlParams::new();
        let mut sql = format!("EXPLAIN (FORMAT JSON) SELECT 1 FROM {}", table);
        self.push_where(&mut sql, &mut params);
        (sql, params.into_args())
    }

    /// `INSERT` of one row; empty data gives an empty statement
    pub fn build_insert(&self, data: &Map<String, Value>) -> (String, Vec<Value>) {
        self.build_insert_many(std::slice::from_ref(data))
    }

    /// `INSERT` of several rows
    ///
    /// The column list is the union of all row keys in first-seen order; a
    /// row without a value for a column inserts `DEFAULT`.
    pub fn build_insert_many(&self, rows: &[Map<String, Value>]) -> (String, Vec<Value>) {
        let Some(table) = self.table_ref() else {
            return (String::new(), Vec::new());
        };

        let mut columns: Vec<(&str, String)> = Vec::new();
        for key in rows.iter().flat_map(|row| row.keys()) {
            if columns.iter().any(|(name, _)| *name == key.as_str()) {
                continue;
            }
            match quoted(key) {
                Some(ident) => columns.push((key.as_str(), ident)),
                None => debug!(column = %key, "dropping insert column"),
            }
        }
        if columns.is_empty() {
            return (String::new(), Vec::new());
        }

        let mut params = SqlParams::new();
        let values: Vec<String> = rows
            .iter()
            .map(|row| {
                let items: Vec<String> = columns
                    .iter()
                    .map(|(name, _)| match row.get(*name) {
                        Some(value) => self.write_value(name, value, &mut params),
                        None => "DEFAULT".to_string(),
                    })
                    .collect();
                format!("({})", items.join(", "))
            })
            .collect();

        let idents: Vec<&str> = columns.iter().map(|(_, ident)| ident.as_str()).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            idents.join(", "),
            values.join(", ")
        );

        if let Some(clause) = self.on_conflict_clause(&columns) {
            sql.push(' ');
            sql.push_str(&clause);
        }
        self.push_returning(&mut sql);

        (sql, params.into_args())
    }

    /// `UPDATE ... SET ... WHERE ...`; empty data gives an empty statement
    pub fn build_update(&self, data: &Map<String, Value>) -> (String, Vec<Value>) {
        let Some(table) = self.table_ref() else {
            return (String::new(), Vec::new());
        };

        let mut params = SqlParams::new();
        let assignments: Vec<String> = data
            .iter()
            .filter_map(|(name, value)| {
                let Some(ident) = quoted(name) else {
                    debug!(column = %name, "dropping update column");
                    return None;
                };
                Some(format!(
                    "{} = {}",
                    ident,
                    self.write_value(name, value, &mut params)
                ))
            })
            .collect();
        if assignments.is_empty() {
            return (String::new(), Vec::new());
        }

        let mut sql = format!("UPDATE {} SET {}", table, assignments.join(", "));
        self.push_where(&mut sql, &mut params);
        self.push_returning(&mut sql);

        (sql, params.into_args())
    }

    /// `DELETE FROM ... WHERE ...`
    pub fn build_delete(&self) -> (String, Vec<Value>) {
        let Some(table) = self.table_ref() else {
            return (String::new(), Vec::new());
        };

        let mut params = SqlParams::new();
        let mut sql = format!("DELETE FROM {}", table);
        self.push_where(&mut sql, &mut params);
        self.push_returning(&mut sql);

        (sql, params.into_args())
    }

    // =========================================================================
    // Clause helpers
    // =========================================================================

    fn table_ref(&self) -> Option<String> {
        let table = qualified_table(&self.schema, &self.table);
        if table.is_none() {
            debug!(schema = %self.schema, table = %self.table, "invalid table reference");
        }
        table
    }

    fn push_where(&self, sql: &mut String, params: &mut SqlParams) {
        if let Some(condition) = build_where_clause(&self.filters, params) {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
    }

    fn push_returning(&self, sql: &mut String) {
        if self.returning.is_empty() {
            return;
        }
        let items = self.project_columns(&self.returning);
        sql.push_str(" RETURNING ");
        sql.push_str(&items.join(", "));
    }

    fn is_spatial(&self, column: &str) -> bool {
        self.column_info
            .iter()
            .any(|c| c.name == column && c.column_type.is_spatial())
    }

    /// Bind a written value, routing spatial columns through GeoJSON parsing
    fn write_value(&self, column: &str, value: &Value, params: &mut SqlParams) -> String {
        if self.is_spatial(column) && !value.is_null() {
            let geojson = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return format!("ST_GeomFromGeoJSON({})", params.push(Value::String(geojson)));
        }
        params.push(value.clone())
    }

    /// `*`, expanded into an explicit list when spatial columns are known
    fn star(&self) -> String {
        if !self.column_info.iter().any(|c| c.column_type.is_spatial()) {
            return "*".to_string();
        }
        let items: Vec<String> = self
            .column_info
            .iter()
            .filter_map(|c| project_column(&c.name, &self.column_info))
            .collect();
        if items.is_empty() {
            "*".to_string()
        } else {
            items.join(", ")
        }
    }

    /// Project a list of select items; falls back to `*` when none survive
    fn project_columns(&self, columns: &[String]) -> Vec<String> {
        let mut items = Vec::new();
        for column in columns {
            if column.trim() == "*" {
                items.push(self.star());
            } else if let Some(item) = project_column(column, &self.column_info) {
                items.push(item);
            } else {
                debug!(column = %column, "dropping select column");
            }
        }
        if items.is_empty() {
            items.push(self.star());
        }
        items
    }

    /// Columns the statement groups by: explicit `group_by`, or the plain
    /// select columns when aggregates are present
    fn grouping_columns(&self) -> Vec<&str> {
        if !self.group_by.is_empty() {
            return self.group_by.iter().map(String::as_str).collect();
        }
        if self.aggregations.is_empty() {
            return Vec::new();
        }
        self.columns
            .iter()
            .map(String::as_str)
            .filter(|c| c.trim() != "*")
            .collect()
    }

    fn group_by_clause(&self) -> Option<String> {
        let exprs: Vec<String> = self
            .grouping_columns()
            .into_iter()
            .filter_map(|column| compile_path(split_alias(column).1))
            .collect();
        if exprs.is_empty() {
            None
        } else {
            Some(exprs.join(", "))
        }
    }

    /// ORDER BY for a window function
    ///
    /// Output aliases are not visible inside `OVER (...)`, so ordering on an
    /// aggregate or a column alias uses the aliased expression.
    fn window_order(&self) -> Option<String> {
        let parts: Vec<String> = self
            .order
            .iter()
            .filter_map(|entry| Some(order_term(&self.order_source(&entry.column)?, entry)))
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    fn order_source(&self, column: &str) -> Option<String> {
        if let Some(aggregation) = self.aggregations.iter().find(|a| a.alias == column) {
            return aggregate_expr(aggregation);
        }
        let aliased = self.columns.iter().find_map(|item| match split_alias(item) {
            (Some(alias), expr) if alias == column => Some(expr),
            _ => None,
        });
        compile_path(aliased.unwrap_or(column))
    }

    fn select_list(&self, table: &str, params: &mut SqlParams) -> String {
        if !self.aggregations.is_empty() {
            let mut items: Vec<String> = self
                .grouping_columns()
                .into_iter()
                .filter_map(|column| project_column(column, &self.column_info))
                .collect();
            items.extend(self.aggregations.iter().filter_map(render_aggregation));
            if items.is_empty() {
                return "*".to_string();
            }
            return items.join(", ");
        }

        let mut items = if self.columns.is_empty() {
            vec![self.star()]
        } else {
            self.project_columns(&self.columns)
        };

        for relation in &self.embedded {
            if let Some(sub) = self.embed(table, relation, params) {
                items.push(sub);
            }
        }

        items.join(", ")
    }

    /// Correlated sub-select producing the embedded relation as JSON
    fn embed(
        &self,
        parent: &str,
        relation: &EmbeddedRelation,
        params: &mut SqlParams,
    ) -> Option<String> {
        let Some(rel) = self.relationships.iter().find(|r| r.name == relation.name) else {
            debug!(relation = %relation.name, "dropping unknown embedded relation");
            return None;
        };
        let table = qualified_table(&rel.schema, &rel.table)?;
        let alias = quoted(&rel.name)?;
        let local = quoted(&rel.local_column)?;
        let foreign = quoted(&rel.foreign_column)?;

        let mut items: Vec<String> = relation
            .select
            .iter()
            .filter_map(|column| {
                if column.trim() == "*" {
                    Some("*".to_string())
                } else {
                    project_column(column, &[])
                }
            })
            .collect();
        if items.is_empty() {
            items.push("*".to_string());
        }
        for nested in &relation.embedded {
            if let Some(sub) = self.embed(&alias, nested, params) {
                items.push(sub);
            }
        }

        let mut conditions = vec![format!("{}.{} = {}.{}", alias, foreign, parent, local)];
        if let Some(condition) = build_where_clause(&relation.filters, params) {
            conditions.push(condition);
        }

        let inner = format!(
            "SELECT {} FROM {} AS {} WHERE {}",
            items.join(", "),
            table,
            alias,
            conditions.join(" AND ")
        );

        Some(match rel.kind {
            RelationKind::ToOne => format!(
                "(SELECT to_jsonb(_r) FROM ({} LIMIT 1) AS _r) AS {}",
                inner, alias
            ),
            RelationKind::ToMany => format!(
                "(SELECT COALESCE(jsonb_agg(_r), '[]'::jsonb) FROM ({}) AS _r) AS {}",
                inner, alias
            ),
        })
    }

    fn on_conflict_clause(&self, columns: &[(&str, String)]) -> Option<String> {
        let (targets, action) = self.on_conflict.as_ref()?;
        let targets: Vec<String> = targets.iter().filter_map(|c| quoted(c)).collect();
        let target = if targets.is_empty() {
            String::new()
        } else {
            format!(" ({})", targets.join(", "))
        };

        let updates: Vec<String> = columns
            .iter()
            .filter(|(_, ident)| !targets.contains(ident))
            .map(|(_, ident)| format!("{} = EXCLUDED.{}", ident, ident))
            .collect();

        match action {
            OnConflict::DoUpdate if targets.is_empty() => {
                debug!("DO UPDATE needs a conflict target; omitting ON CONFLICT");
                None
            }
            OnConflict::DoUpdate if !updates.is_empty() => Some(format!(
                "ON CONFLICT{} DO UPDATE SET {}",
                target,
                updates.join(", ")
            )),
            _ => Some(format!("ON CONFLICT{} DO NOTHING", target)),
        }
    }
}

/// Render one select item against a column catalog
///
/// Plain columns are quoted, spatial ones wrapped in `ST_AsGeoJSON(..)::jsonb`
/// and JSON paths aliased by their last key. `alias:` prefixes are honoured.
fn project_column(item: &str, catalog: &[ColumnInfo]) -> Option<String> {
    let (alias, expr) = split_alias(item);

    if expr.contains("->") {
        let path = JsonPath::parse(expr)?;
        let sql = path.to_sql()?;
        let name = alias.unwrap_or_else(|| path.last_key());
        return Some(match quoted(name) {
            Some(name) => format!("{} AS {}", sql, name),
            None => sql,
        });
    }

    let column = quoted(expr)?;
    let alias = alias.and_then(quoted);
    let spatial = catalog
        .iter()
        .any(|c| c.name == expr && c.column_type.is_spatial());

    Some(match (spatial, alias) {
        (true, Some(alias)) => format!("ST_AsGeoJSON({})::jsonb AS {}", column, alias),
        (true, None) => format!("ST_AsGeoJSON({})::jsonb AS {}", column, column),
        (false, Some(alias)) => format!("{} AS {}", column, alias),
        (false, None) => column,
    })
}

/// `FUNC(column) AS alias`
fn render_aggregation(aggregation: &Aggregation) -> Option<String> {
    let Some(alias) = quoted(&aggregation.alias) else {
        debug!(alias = %aggregation.alias, "dropping aggregation with invalid alias");
        return None;
    };
    Some(format!("{} AS {}", aggregate_expr(aggregation)?, alias))
}

/// `FUNC(column)`
fn aggregate_expr(aggregation: &Aggregation) -> Option<String> {
    let function = aggregation.function.name().to_ascii_uppercase();
    let argument = match aggregation.function {
        AggregateFunction::CountStar => "*".to_string(),
        _ => compile_path(&aggregation.column)?,
    };
    Some(format!("{}({})", function, argument))
}
