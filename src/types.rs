//! Core type definitions for the query engine
//!
//! Includes the filter/order/aggregation model produced by the query-string
//! parser (or built programmatically by a GraphQL resolver) and consumed by
//! the SQL builder, plus the column catalog used for geometry-aware projection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DataApiError;

// ============================================================================
// Filter values
// ============================================================================

/// Loosely typed filter value
///
/// Query-string values arrive as strings; `in` produces a list and `is`
/// produces null/booleans. Programmatic callers may pass any variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<String>),
    Json(serde_json::Value),
}

impl FilterValue {
    /// Convert an arbitrary JSON value, keeping scalars as scalars
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FilterValue::Null,
            serde_json::Value::Bool(b) => FilterValue::Bool(b),
            serde_json::Value::Number(n) => FilterValue::Number(n),
            serde_json::Value::String(s) => FilterValue::String(s),
            other => FilterValue::Json(other),
        }
    }

    /// Convert into a bindable argument
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FilterValue::Null => serde_json::Value::Null,
            FilterValue::Bool(b) => serde_json::Value::Bool(*b),
            FilterValue::Number(n) => serde_json::Value::Number(n.clone()),
            FilterValue::String(s) => serde_json::Value::String(s.clone()),
            FilterValue::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .cloned()
                    .map(serde_json::Value::String)
                    .collect(),
            ),
            FilterValue::Json(v) => v.clone(),
        }
    }

    /// Text form of the value, for operators that take a string payload
    pub fn as_text(&self) -> Option<String> {
        match self {
            FilterValue::String(s) => Some(s.clone()),
            FilterValue::Number(n) => Some(n.to_string()),
            FilterValue::Bool(b) => Some(b.to_string()),
            FilterValue::Json(v) => Some(v.to_string()),
            FilterValue::Null | FilterValue::List(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FilterValue::Null)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::String(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::String(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Number(value.into())
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        FilterValue::Number(value.into())
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(FilterValue::Number)
            .unwrap_or(FilterValue::Null)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(value: Vec<String>) -> Self {
        FilterValue::List(value)
    }
}

impl From<serde_json::Value> for FilterValue {
    fn from(value: serde_json::Value) -> Self {
        FilterValue::from_json(value)
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Equality and ordering comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Neq => "<>",
            ComparisonOp::Gt => ">",
            ComparisonOp::Gte => ">=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOp {
    Like,
    Ilike,
}

/// Membership, containment and overlap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// `= ANY($n)`
    In,
    /// `@>`
    Contains,
    /// `<@`
    ContainedBy,
    /// `&&`
    Overlaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSearchMode {
    /// `plainto_tsquery`
    Plain,
    /// `phraseto_tsquery`
    Phrase,
    /// `websearch_to_tsquery`
    Websearch,
}

impl TextSearchMode {
    pub fn function(self) -> &'static str {
        match self {
            TextSearchMode::Plain => "plainto_tsquery",
            TextSearchMode::Phrase => "phraseto_tsquery",
            TextSearchMode::Websearch => "websearch_to_tsquery",
        }
    }
}

/// Range position operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    StrictlyLeft,
    StrictlyRight,
    NotExtendRight,
    NotExtendLeft,
    Adjacent,
}

impl RangeOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            RangeOp::StrictlyLeft => "<<",
            RangeOp::StrictlyRight => ">>",
            RangeOp::NotExtendRight => "&<",
            RangeOp::NotExtendLeft => "&>",
            RangeOp::Adjacent => "-|-",
        }
    }
}

/// PostGIS predicates; the filter value is GeoJSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialOp {
    Intersects,
    Contains,
    Within,
    /// Value is `<distance>,<geojson>`
    DWithin,
    /// Value is `<max distance>,<geojson>`
    Distance,
    Touches,
    Crosses,
    Overlaps,
}

impl SpatialOp {
    pub fn function(self) -> &'static str {
        match self {
            SpatialOp::Intersects => "ST_Intersects",
            SpatialOp::Contains => "ST_Contains",
            SpatialOp::Within => "ST_Within",
            SpatialOp::DWithin => "ST_DWithin",
            SpatialOp::Distance => "ST_Distance",
            SpatialOp::Touches => "ST_Touches",
            SpatialOp::Crosses => "ST_Crosses",
            SpatialOp::Overlaps => "ST_Overlaps",
        }
    }

    /// Whether the value carries a leading distance
    pub fn takes_distance(self) -> bool {
        matches!(self, SpatialOp::DWithin | SpatialOp::Distance)
    }
}

/// Filter operator, grouped by family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Comparison(ComparisonOp),
    Pattern(PatternOp),
    Set(SetOp),
    Is,
    TextSearch {
        mode: TextSearchMode,
        /// Text search configuration such as `english`
        config: Option<String>,
    },
    Range(RangeOp),
    Spatial(SpatialOp),
    /// Negation; the filter value is itself an `operator.value` string
    Not,
}

impl Operator {
    pub const EQ: Operator = Operator::Comparison(ComparisonOp::Eq);
    pub const NEQ: Operator = Operator::Comparison(ComparisonOp::Neq);
    pub const GT: Operator = Operator::Comparison(ComparisonOp::Gt);
    pub const GTE: Operator = Operator::Comparison(ComparisonOp::Gte);
    pub const LT: Operator = Operator::Comparison(ComparisonOp::Lt);
    pub const LTE: Operator = Operator::Comparison(ComparisonOp::Lte);
    pub const IN: Operator = Operator::Set(SetOp::In);
}

impl FromStr for Operator {
    type Err = DataApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, config) = match s.split_once('(') {
            Some((name, rest)) => {
                let config = rest.strip_suffix(')').ok_or_else(|| {
                    DataApiError::invalid_filter(format!("Malformed operator '{}'", s))
                })?;
                (name, Some(config.to_string()))
            }
            None => (s, None),
        };

        let text_search = |mode| Operator::TextSearch {
            mode,
            config: config.clone(),
        };

        let op = match name {
            "eq" => Operator::Comparison(ComparisonOp::Eq),
            "neq" => Operator::Comparison(ComparisonOp::Neq),
            "gt" => Operator::Comparison(ComparisonOp::Gt),
            "gte" => Operator::Comparison(ComparisonOp::Gte),
            "lt" => Operator::Comparison(ComparisonOp::Lt),
            "lte" => Operator::Comparison(ComparisonOp::Lte),
            "like" => Operator::Pattern(PatternOp::Like),
            "ilike" => Operator::Pattern(PatternOp::Ilike),
            "in" => Operator::Set(SetOp::In),
            "cs" => Operator::Set(SetOp::Contains),
            "cd" => Operator::Set(SetOp::ContainedBy),
            "ov" => Operator::Set(SetOp::Overlaps),
            "is" => Operator::Is,
            "fts" | "plfts" => text_search(TextSearchMode::Plain),
            "phfts" => text_search(TextSearchMode::Phrase),
            "wfts" => text_search(TextSearchMode::Websearch),
            "sl" => Operator::Range(RangeOp::StrictlyLeft),
            "sr" => Operator::Range(RangeOp::StrictlyRight),
            "nxr" => Operator::Range(RangeOp::NotExtendRight),
            "nxl" => Operator::Range(RangeOp::NotExtendLeft),
            "adj" => Operator::Range(RangeOp::Adjacent),
            "st_intersects" => Operator::Spatial(SpatialOp::Intersects),
            "st_contains" => Operator::Spatial(SpatialOp::Contains),
            "st_within" => Operator::Spatial(SpatialOp::Within),
            "st_dwithin" => Operator::Spatial(SpatialOp::DWithin),
            "st_distance" => Operator::Spatial(SpatialOp::Distance),
            "st_touches" => Operator::Spatial(SpatialOp::Touches),
            "st_crosses" => Operator::Spatial(SpatialOp::Crosses),
            "st_overlaps" => Operator::Spatial(SpatialOp::Overlaps),
            "not" => Operator::Not,
            _ => {
                return Err(DataApiError::invalid_filter(format!(
                    "Unknown operator '{}'",
                    name
                )));
            }
        };

        if config.is_some() && !matches!(op, Operator::TextSearch { .. }) {
            return Err(DataApiError::invalid_filter(format!(
                "Operator '{}' does not accept a configuration",
                name
            )));
        }

        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Comparison(ComparisonOp::Eq) => "eq",
            Operator::Comparison(ComparisonOp::Neq) => "neq",
            Operator::Comparison(ComparisonOp::Gt) => "gt",
            Operator::Comparison(ComparisonOp::Gte) => "gte",
            Operator::Comparison(ComparisonOp::Lt) => "lt",
            Operator::Comparison(ComparisonOp::Lte) => "lte",
            Operator::Pattern(PatternOp::Like) => "like",
            Operator::Pattern(PatternOp::Ilike) => "ilike",
            Operator::Set(SetOp::In) => "in",
            Operator::Set(SetOp::Contains) => "cs",
            Operator::Set(SetOp::ContainedBy) => "cd",
            Operator::Set(SetOp::Overlaps) => "ov",
            Operator::Is => "is",
            Operator::TextSearch { mode, config } => {
                let name = match mode {
                    TextSearchMode::Plain => "plfts",
                    TextSearchMode::Phrase => "phfts",
                    TextSearchMode::Websearch => "wfts",
                };
                return match config {
                    Some(config) => write!(f, "{}({})", name, config),
                    None => f.write_str(name),
                };
            }
            Operator::Range(RangeOp::StrictlyLeft) => "sl",
            Operator::Range(RangeOp::StrictlyRight) => "sr",
            Operator::Range(RangeOp::NotExtendRight) => "nxr",
            Operator::Range(RangeOp::NotExtendLeft) => "nxl",
            Operator::Range(RangeOp::Adjacent) => "adj",
            Operator::Spatial(SpatialOp::Intersects) => "st_intersects",
            Operator::Spatial(SpatialOp::Contains) => "st_contains",
            Operator::Spatial(SpatialOp::Within) => "st_within",
            Operator::Spatial(SpatialOp::DWithin) => "st_dwithin",
            Operator::Spatial(SpatialOp::Distance) => "st_distance",
            Operator::Spatial(SpatialOp::Touches) => "st_touches",
            Operator::Spatial(SpatialOp::Crosses) => "st_crosses",
            Operator::Spatial(SpatialOp::Overlaps) => "st_overlaps",
            Operator::Not => "not",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Filters, ordering, aggregation
// ============================================================================

/// One WHERE predicate
///
/// Filters sharing a non-zero `or_group_id` are rendered as one parenthesized
/// OR clause; `or_group_id == 0` filters are always AND-joined.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub operator: Operator,
    pub value: FilterValue,
    pub is_or: bool,
    pub or_group_id: u32,
}

impl Filter {
    /// Create an AND-joined filter
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<FilterValue>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
            is_or: false,
            or_group_id: 0,
        }
    }

    /// Shorthand for an equality filter
    pub fn eq(column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(column, Operator::EQ, value)
    }

    /// Place the filter in an OR group
    pub fn in_or_group(mut self, group_id: u32) -> Self {
        self.is_or = true;
        self.or_group_id = group_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

impl NullsOrder {
    /// Lenient parse: anything but `first`/`last` means the database default
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "first" | "nullsfirst" => Some(NullsOrder::First),
            "last" | "nullslast" => Some(NullsOrder::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub desc: bool,
    pub nulls: Option<NullsOrder>,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            desc: false,
            nulls: None,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            desc: true,
            nulls: None,
        }
    }

    pub fn nulls(mut self, nulls: Option<NullsOrder>) -> Self {
        self.nulls = nulls;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    CountStar,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AggregateFunction::Count | AggregateFunction::CountStar => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub function: AggregateFunction,
    /// Empty for `CountStar`
    pub column: String,
    pub alias: String,
}

impl Aggregation {
    /// Create an aggregation with the default alias
    pub fn new(function: AggregateFunction, column: impl Into<String>) -> Self {
        let column = column.into();
        let alias = Self::default_alias(function, &column);
        Self {
            function,
            column,
            alias,
        }
    }

    pub fn count_star() -> Self {
        Self::new(AggregateFunction::CountStar, "")
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// `<function>_<column>`, or `count` for `count(*)`
    pub fn default_alias(function: AggregateFunction, column: &str) -> String {
        match function {
            AggregateFunction::CountStar => "count".to_string(),
            _ => format!("{}_{}", function.name(), column),
        }
    }
}

/// Related-table sub-selection from `select=rel(col,...)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddedRelation {
    pub name: String,
    pub select: Vec<String>,
    pub filters: Vec<Filter>,
    pub embedded: Vec<EmbeddedRelation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountMode {
    #[default]
    None,
    Exact,
    Planned,
    Estimated,
}

impl FromStr for CountMode {
    type Err = DataApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(CountMode::Exact),
            "planned" => Ok(CountMode::Planned),
            "estimated" => Ok(CountMode::Estimated),
            "none" | "" => Ok(CountMode::None),
            other => Err(DataApiError::invalid_param(format!(
                "Invalid count mode '{}'. Must be exact, planned or estimated.",
                other
            ))),
        }
    }
}

/// Structured form of one request's query string
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    pub select: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub embedded: Vec<EmbeddedRelation>,
    pub count: CountMode,
    pub aggregations: Vec<Aggregation>,
    pub group_by: Vec<String>,
    /// Keyset pagination token from `cursor=`
    pub cursor: Option<String>,
}

// ============================================================================
// Column catalog
// ============================================================================

/// Classification of a PostgreSQL column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamp,
    Json,
    Geometry,
    Geography,
    Other(String),
}

impl ColumnType {
    /// Classify a type name as reported by `information_schema` / `format_type`
    pub fn from_pg_type(type_name: &str) -> Self {
        let lower = type_name.trim().to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or(&lower).trim();
        match base {
            "text" | "character varying" | "varchar" | "character" | "char" | "uuid"
            | "citext" => ColumnType::Text,
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" => ColumnType::Integer,
            "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" => {
                ColumnType::Numeric
            }
            "boolean" | "bool" => ColumnType::Boolean,
            "json" | "jsonb" => ColumnType::Json,
            "geometry" => ColumnType::Geometry,
            "geography" => ColumnType::Geography,
            b if b.starts_with("timestamp") || b == "date" => ColumnType::Timestamp,
            _ => ColumnType::Other(lower),
        }
    }

    /// Geometry and geography columns project as GeoJSON
    pub fn is_spatial(&self) -> bool {
        matches!(self, ColumnType::Geometry | ColumnType::Geography)
    }
}

/// A known column of the target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Parent row references one related row (`jsonb` object or null)
    ToOne,
    /// Parent row is referenced by many related rows (`jsonb` array)
    ToMany,
}

/// How an embedded relation joins to its parent
///
/// The join condition is `related.foreign_column = parent.local_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub kind: RelationKind,
    pub local_column: String,
    pub foreign_column: String,
}

impl Relationship {
    pub fn to_many(
        name: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        local_column: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            table: table.into(),
            kind: RelationKind::ToMany,
            local_column: local_column.into(),
            foreign_column: foreign_column.into(),
        }
    }

    pub fn to_one(
        name: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        local_column: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationKind::ToOne,
            ..Self::to_many(name, schema, table, local_column, foreign_column)
        }
    }
}

/// Conflict handling for INSERT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    DoNothing,
    /// Overwrite the inserted columns with `EXCLUDED` values
    DoUpdate,
}
