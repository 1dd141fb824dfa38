//! # runtara-data-api
//!
//! A PostgREST-style query engine for PostgreSQL.
//!
//! This crate turns API query strings (or programmatically built filters)
//! into parameterized SQL and runs it under the caller's row-level-security
//! identity. It is the core shared by a REST layer and a GraphQL resolver:
//! both produce the same [`Filter`]/[`OrderBy`] model and hand it to the
//! [`QueryBuilder`].
//!
//! ## Features
//!
//! - **Query-string parsing**: `select`, `order`, `limit`, `offset`, `count`,
//!   `group_by`, `cursor`, `or`/`and` groups and `column=op.value` filters
//! - **Safe SQL generation**: identifiers are whitelisted and quoted, values
//!   always travel as `$n` parameters, invalid columns are dropped
//! - **JSONB paths**: `data->address->>city` filters, ordering and projection
//! - **PostGIS**: spatial predicates and GeoJSON projection of geometry columns
//! - **Keyset pagination**: opaque cursor tokens, no server-side state
//! - **Row-level security**: transaction-scoped `SET LOCAL ROLE` and claims
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runtara_data_api::{DataStore, EngineConfig, RlsContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder("postgres://localhost/mydb").build();
//!     let store = DataStore::new(config).await?;
//!
//!     // GET /users?select=id,name&status=eq.active&order=name.asc&limit=20
//!     let caller = RlsContext::new("4f2c9a", "user");
//!     let page = store
//!         .select_query(
//!             Some(&caller),
//!             "users",
//!             [
//!                 ("select", "id,name"),
//!                 ("status", "eq.active"),
//!                 ("order", "name.asc"),
//!                 ("limit", "20"),
//!             ],
//!         )
//!         .await?;
//!
//!     for row in &page.rows {
//!         println!("{:?}", row.get("name"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Building SQL without a database
//!
//! ```rust
//! use runtara_data_api::{Filter, Operator, QueryBuilder};
//!
//! let (sql, args) = QueryBuilder::new("public", "users")
//!     .with_filters([
//!         Filter::eq("status", "active"),
//!         Filter::new("age", Operator::GTE, 18),
//!     ])
//!     .build_select();
//!
//! assert_eq!(
//!     sql,
//!     "SELECT * FROM \"public\".\"users\" WHERE \"status\" = $1 AND \"age\" >= $2"
//! );
//! assert_eq!(args, vec![serde_json::json!("active"), serde_json::json!(18)]);
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use runtara_data_api::EngineConfig;
//!
//! let config = EngineConfig::builder("postgres://localhost/mydb")
//!     .schema("api")                       // Exposed schema (default: public)
//!     .default_limit(50)                   // Page size when none is given
//!     .max_limit(500)                      // Largest page a client may ask for
//!     .claims_setting("request.jwt.claims")
//!     .build();
//! ```

mod bind;

pub mod config;
pub mod cursor;
pub mod error;
pub mod params;
pub mod rls;
pub mod sql;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::{EngineConfig, EngineConfigBuilder, RoleConfig};
pub use cursor::{Cursor, CursorError, decode_cursor, encode_cursor, next_cursor};
pub use error::{ConstraintViolation, DataApiError, Result};
pub use params::{PageLimits, parse_select};
pub use rls::{RlsContext, RowMap, ScopedTransaction};
pub use sql::QueryBuilder;
pub use store::{DataStore, Page, WriteOutcome};
pub use types::{
    AggregateFunction, Aggregation, ColumnInfo, ColumnType, ComparisonOp, CountMode,
    EmbeddedRelation, Filter, FilterValue, NullsOrder, OnConflict, Operator, OrderBy, PatternOp,
    QueryParams, RangeOp, RelationKind, Relationship, SetOp, SpatialOp, TextSearchMode,
};

// Re-export SQL utilities for advanced users
pub use sql::{compile_path, is_valid_identifier, needs_numeric_cast, quote_identifier};
