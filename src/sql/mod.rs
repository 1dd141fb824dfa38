//! SQL generation
//!
//! Identifier validation, JSON path compilation, WHERE/ORDER BY rendering and
//! the statement builder.

pub mod builder;
pub mod condition;
pub mod jsonpath;
pub mod sanitize;

pub use builder::{QueryBuilder, ROW_ORDER_COLUMN};
pub use condition::{
    SqlParams, build_order_by_clause, build_where_clause, order_term, render_filter,
};
pub use jsonpath::{JsonPath, compile_path, needs_numeric_cast};
pub use sanitize::{is_valid_identifier, qualified_table, quote_identifier};
