//! DataStore - Main entry point for running API queries against PostgreSQL
//!
//! Ties the pieces together: query-string parsing with the configured paging
//! limits, statement building, and execution under the caller's row-level
//! security context.

use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::config::EngineConfig;
use crate::cursor::{decode_cursor, next_cursor};
use crate::error::{DataApiError, Result};
use crate::params::PageLimits;
use crate::rls::{self, RlsContext, RowMap, ScopedTransaction};
use crate::sql::QueryBuilder;
use crate::types::{ColumnInfo, ColumnType, CountMode, OrderBy, QueryParams};

/// One page of a SELECT
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<RowMap>,
    /// Total matching rows, when a count mode was requested
    pub total: Option<i64>,
    /// Token for the following page, when the page was full and ordered
    pub next_cursor: Option<String>,
}

/// Result of an INSERT / UPDATE / DELETE
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub affected: u64,
    /// Returned rows; empty unless the builder requested `RETURNING`
    pub rows: Vec<RowMap>,
}

/// PostgREST-style query engine over one PostgreSQL database
pub struct DataStore {
    /// Database connection pool
    pool: PgPool,
    /// Engine configuration
    config: EngineConfig,
}

impl DataStore {
    /// Connect to the configured database
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let pool = PgPool::connect(&config.database_url).await.map_err(|e| {
            DataApiError::Connection(format!("Database connection failed: {}", e))
        })?;

        Ok(Self { pool, config })
    }

    /// Create a DataStore from an existing pool
    pub fn from_pool(pool: PgPool, config: EngineConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Query preparation
    // =========================================================================

    /// Parse query-string pairs with the configured paging limits
    pub fn parse_query<I, K, V>(&self, pairs: I) -> Result<QueryParams>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        QueryParams::parse(pairs, PageLimits::from(&self.config))
    }

    /// Empty builder for a table of the configured schema
    pub fn builder(&self, table: &str) -> QueryBuilder {
        QueryBuilder::new(self.config.schema.as_str(), table)
    }

    /// Builder for parsed parameters
    ///
    /// A cursor without an explicit order sorts on the cursor column, so
    /// consecutive pages stay in keyset order.
    pub fn builder_for(&self, table: &str, params: &QueryParams) -> Result<QueryBuilder> {
        let builder = QueryBuilder::from_params(self.config.schema.as_str(), table, params)?;

        if params.order.is_empty() {
            if let Some(token) = params.cursor.as_deref() {
                let cursor = decode_cursor(token)?;
                let order = if cursor.desc {
                    OrderBy::desc(cursor.column)
                } else {
                    OrderBy::asc(cursor.column)
                };
                return Ok(builder.with_order([order]));
            }
        }

        Ok(builder)
    }

    /// Column catalog of a table in the configured schema
    pub async fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.load_columns(&self.config.schema, table).await
    }

    /// Copy of `builder` carrying its table's column catalog
    ///
    /// Spatial columns are only projected as GeoJSON and written from GeoJSON
    /// when the builder knows about them. A builder that already has a
    /// catalog is returned as is.
    pub async fn with_catalog(&self, builder: &QueryBuilder) -> Result<QueryBuilder> {
        if !builder.column_info().is_empty() {
            return Ok(builder.clone());
        }
        let columns = self.load_columns(builder.schema(), builder.table()).await?;
        debug!(table = %builder.table(), columns = columns.len(), "loaded column catalog");
        Ok(builder.clone().with_column_info(columns))
    }

    async fn load_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT column_name, udt_name
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                let name: String = row.try_get("column_name")?;
                let udt: String = row.try_get("udt_name")?;
                Ok(ColumnInfo::new(name, ColumnType::from_pg_type(&udt)))
            })
            .collect()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Run a SELECT, with an optional count, in one scoped transaction
    ///
    /// The table's column catalog is loaded when the builder has none. Rows
    /// come back in the builder's order.
    pub async fn select(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
        count: CountMode,
    ) -> Result<Page> {
        if builder.build_select().0.is_empty() {
            return Err(DataApiError::invalid_param("Invalid table reference"));
        }
        let builder = self.with_catalog(builder).await?;

        let mut tx = ScopedTransaction::begin(&self.pool, &self.config, context).await?;
        let fetched = match builder.build_ordered_select() {
            Some((sql, args)) => tx.fetch_ordered_rows(&sql, &args).await,
            None => {
                let (sql, args) = builder.build_select();
                tx.fetch_rows(&sql, &args).await
            }
        };
        let result = match fetched {
            Ok(rows) => self
                .resolve_count(&mut tx, &builder, count)
                .await
                .map(|total| (rows, total)),
            Err(e) => Err(e),
        };
        let (rows, total) = tx.finish(result).await?;

        let next_cursor = page_cursor(&builder, &rows);
        Ok(Page {
            rows,
            total,
            next_cursor,
        })
    }

    /// Parse, build and run a SELECT from query-string pairs
    pub async fn select_query<I, K, V>(
        &self,
        context: Option<&RlsContext>,
        table: &str,
        pairs: I,
    ) -> Result<Page>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let params = self.parse_query(pairs)?;
        let builder = self.builder_for(table, &params)?;
        self.select(context, &builder, params.count).await
    }

    /// Count the rows matched by the builder's filters
    ///
    /// Returns `None` for `CountMode::None`.
    pub async fn count(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
        mode: CountMode,
    ) -> Result<Option<i64>> {
        let mut tx = ScopedTransaction::begin(&self.pool, &self.config, context).await?;
        let result = self.resolve_count(&mut tx, builder, mode).await;
        tx.finish(result).await
    }

    async fn resolve_count(
        &self,
        tx: &mut ScopedTransaction,
        builder: &QueryBuilder,
        mode: CountMode,
    ) -> Result<Option<i64>> {
        match mode {
            CountMode::None => Ok(None),
            CountMode::Exact => {
                let (sql, args) = builder.build_count();
                Ok(Some(tx.fetch_count(&sql, &args).await?))
            }
            CountMode::Planned => {
                let (sql, args) = builder.build_count_estimate();
                Ok(Some(tx.fetch_plan_rows(&sql, &args).await?))
            }
            CountMode::Estimated => {
                let (sql, args) = builder.build_count_estimate();
                let estimate = tx.fetch_plan_rows(&sql, &args).await?;
                if estimate >= self.config.estimated_count_threshold {
                    return Ok(Some(estimate));
                }
                debug!(estimate, "estimate below threshold, counting exactly");
                let (sql, args) = builder.build_count();
                Ok(Some(tx.fetch_count(&sql, &args).await?))
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert one row; empty data is a no-op
    pub async fn insert(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
        data: &Map<String, Value>,
    ) -> Result<WriteOutcome> {
        let builder = self.with_catalog(builder).await?;
        let (sql, args) = builder.build_insert(data);
        self.write(context, &builder, &sql, &args).await
    }

    /// Insert several rows in one statement
    pub async fn insert_many(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
        rows: &[Map<String, Value>],
    ) -> Result<WriteOutcome> {
        let builder = self.with_catalog(builder).await?;
        let (sql, args) = builder.build_insert_many(rows);
        self.write(context, &builder, &sql, &args).await
    }

    /// Update the rows matched by the builder's filters; empty data is a no-op
    pub async fn update(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
        data: &Map<String, Value>,
    ) -> Result<WriteOutcome> {
        let builder = self.with_catalog(builder).await?;
        let (sql, args) = builder.build_update(data);
        self.write(context, &builder, &sql, &args).await
    }

    /// Delete the rows matched by the builder's filters
    pub async fn delete(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
    ) -> Result<WriteOutcome> {
        let builder = self.with_catalog(builder).await?;
        let (sql, args) = builder.build_delete();
        self.write(context, &builder, &sql, &args).await
    }

    async fn write(
        &self,
        context: Option<&RlsContext>,
        builder: &QueryBuilder,
        sql: &str,
        args: &[Value],
    ) -> Result<WriteOutcome> {
        if sql.is_empty() {
            debug!("nothing to write");
            return Ok(WriteOutcome::default());
        }

        if builder.returns_rows() {
            let rows = rls::fetch_rows(&self.pool, &self.config, context, sql, args).await?;
            Ok(WriteOutcome {
                affected: rows.len() as u64,
                rows,
            })
        } else {
            let affected = rls::execute(&self.pool, &self.config, context, sql, args).await?;
            Ok(WriteOutcome {
                affected,
                rows: Vec::new(),
            })
        }
    }

    // =========================================================================
    // Raw statements
    // =========================================================================

    /// Run any row-returning statement under the caller's context
    pub async fn fetch_rows(
        &self,
        context: Option<&RlsContext>,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<RowMap>> {
        rls::fetch_rows(&self.pool, &self.config, context, sql, args).await
    }

    /// Run any statement under the caller's context
    pub async fn execute(
        &self,
        context: Option<&RlsContext>,
        sql: &str,
        args: &[Value],
    ) -> Result<u64> {
        rls::execute(&self.pool, &self.config, context, sql, args).await
    }
}

/// Cursor for the page after `rows`
///
/// Only a full page sorted on a plain column yields a cursor.
fn page_cursor(builder: &QueryBuilder, rows: &[RowMap]) -> Option<String> {
    let limit = builder.limit().filter(|limit| *limit > 0)?;
    if (rows.len() as i64) < limit {
        return None;
    }
    let order = builder.order().first()?;
    next_cursor(rows.last()?, &order.column, order.desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use serde_json::json;

    fn rows(ids: &[i64]) -> Vec<RowMap> {
        ids.iter()
            .map(|id| {
                let mut row = RowMap::new();
                row.insert("id".to_string(), json!(id));
                row
            })
            .collect()
    }

    #[test]
    fn test_page_cursor_for_full_page() {
        let builder = QueryBuilder::new("public", "users")
            .with_order([OrderBy::desc("id")])
            .with_limit(2);
        let token = page_cursor(&builder, &rows(&[9, 8])).unwrap();
        assert_eq!(
            decode_cursor(&token).unwrap(),
            Cursor::new("id", json!(8), true)
        );
    }

    #[test]
    fn test_page_cursor_requires_full_ordered_page() {
        let ordered = QueryBuilder::new("public", "users")
            .with_order([OrderBy::asc("id")])
            .with_limit(3);
        assert_eq!(page_cursor(&ordered, &rows(&[1, 2])), None);

        let unordered = QueryBuilder::new("public", "users").with_limit(2);
        assert_eq!(page_cursor(&unordered, &rows(&[1, 2])), None);

        let unlimited = QueryBuilder::new("public", "users").with_order([OrderBy::asc("id")]);
        assert_eq!(page_cursor(&unlimited, &rows(&[1, 2])), None);

        let missing = QueryBuilder::new("public", "users")
            .with_order([OrderBy::asc("name")])
            .with_limit(2);
        assert_eq!(page_cursor(&missing, &rows(&[1, 2])), None);
    }

    #[test]
    fn test_page_cursor_ends_at_null_sort_value() {
        let builder = QueryBuilder::new("public", "users")
            .with_order([OrderBy::asc("score")])
            .with_limit(2);
        let mut page = rows(&[1, 2]);
        page[0].insert("score".to_string(), json!(10));
        page[1].insert("score".to_string(), Value::Null);
        assert_eq!(page_cursor(&builder, &page), None);
    }
}
