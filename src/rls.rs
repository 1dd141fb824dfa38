//! Row-level security scoped execution
//!
//! Every statement runs inside its own transaction that first switches to
//! the caller's database role with `SET LOCAL ROLE` and publishes the
//! caller's claims through a transaction-local `set_config`. Both revert when
//! the transaction ends, so a pooled connection never carries one caller's
//! privileges into the next checkout.
//!
//! If any step fails the transaction is rolled back explicitly before the
//! error is returned. Dropping a [`ScopedTransaction`] (for example when the
//! caller's future is cancelled) rolls back as well.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use crate::bind::{Prepared, prepare};
use crate::config::EngineConfig;
use crate::error::{DataApiError, Result};
use crate::sql::ROW_ORDER_COLUMN;
use crate::sql::sanitize::quoted;

/// One result row as a column-name to value mapping
pub type RowMap = Map<String, Value>;

/// Verified identity of the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RlsContext {
    /// Subject identifier, published as the `sub` claim
    pub user_id: String,
    /// Application role, mapped to a database role through `RoleConfig`
    pub role: String,
    /// Additional verified claims
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl RlsContext {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            claims: Map::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    /// No identity at all
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty() && self.role.is_empty()
    }

    /// Claims document published to the session
    ///
    /// Extra claims first, then `sub` and `role`, which always win.
    pub fn claims_json(&self) -> Value {
        let mut claims = self.claims.clone();
        claims.insert("sub".to_string(), Value::String(self.user_id.clone()));
        claims.insert("role".to_string(), Value::String(self.role.clone()));
        Value::Object(claims)
    }
}

/// `SET LOCAL ROLE` statement for a database role
///
/// Roles cannot be bound as parameters, so the name must pass identifier
/// validation.
pub fn set_role_sql(database_role: &str) -> Result<String> {
    let role = quoted(database_role).ok_or_else(|| {
        DataApiError::rls_setup(format!("Invalid database role '{}'", database_role))
    })?;
    Ok(format!("SET LOCAL ROLE {}", role))
}

/// Transaction running under a caller's role and claims
pub struct ScopedTransaction {
    tx: Transaction<'static, Postgres>,
}

impl ScopedTransaction {
    /// Begin a transaction and apply the caller's role and claims
    ///
    /// `None` (or an anonymous context) runs under the anonymous role and
    /// publishes no claims.
    pub async fn begin(
        pool: &PgPool,
        config: &EngineConfig,
        context: Option<&RlsContext>,
    ) -> Result<Self> {
        let context = context.filter(|c| !c.is_anonymous());
        let app_role = context.map(|c| c.role.as_str()).unwrap_or("");
        let database_role = config.roles.database_role(app_role);
        let set_role = set_role_sql(database_role)?;

        let tx = pool.begin().await?;
        let mut scoped = Self { tx };

        debug!(
            role = %database_role,
            anonymous = context.is_none(),
            "scoping transaction"
        );

        if let Err(e) = scoped.apply(&set_role, config, context).await {
            scoped.rollback().await;
            return Err(e);
        }

        Ok(scoped)
    }

    async fn apply(
        &mut self,
        set_role: &str,
        config: &EngineConfig,
        context: Option<&RlsContext>,
    ) -> Result<()> {
        sqlx::query(set_role)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| DataApiError::rls_setup(format!("SET ROLE failed: {}", e)))?;

        if let Some(context) = context {
            let claims = serde_json::to_string(&context.claims_json())?;
            sqlx::query("SELECT set_config($1, $2, true)")
                .bind(&config.claims_setting)
                .bind(claims)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| DataApiError::rls_setup(format!("set_config failed: {}", e)))?;
        }

        Ok(())
    }

    /// Run a row-returning statement (SELECT, or DML with RETURNING)
    pub async fn fetch_rows(&mut self, sql: &str, args: &[Value]) -> Result<Vec<RowMap>> {
        debug!(sql = %sql, args = args.len(), "fetching rows");
        let wrapped = format!("WITH q AS ({}) SELECT to_jsonb(q) AS row FROM q", sql);
        self.fetch_json_rows(&wrapped, args).await
    }

    /// Run a SELECT projecting [`ROW_ORDER_COLUMN`] and return rows in that order
    ///
    /// The position column is removed from the returned rows.
    pub async fn fetch_ordered_rows(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<RowMap>> {
        debug!(sql = %sql, args = args.len(), "fetching ordered rows");
        let wrapped = format!(
            "WITH q AS ({}) SELECT to_jsonb(q) - '{}' AS row FROM q ORDER BY q.\"{}\"",
            sql, ROW_ORDER_COLUMN, ROW_ORDER_COLUMN
        );
        self.fetch_json_rows(&wrapped, args).await
    }

    async fn fetch_json_rows(&mut self, wrapped: &str, args: &[Value]) -> Result<Vec<RowMap>> {
        let Prepared { sql, arguments } = prepare(&mut self.tx, wrapped, args).await?;
        let rows = sqlx::query_with(&sql, arguments)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter()
            .map(|row| -> Result<RowMap> {
                let value: Value = row.try_get("row")?;
                Ok(match value {
                    Value::Object(map) => map,
                    _ => RowMap::new(),
                })
            })
            .collect()
    }

    /// Run a statement and return the number of affected rows
    pub async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64> {
        debug!(sql = %sql, args = args.len(), "executing statement");
        let Prepared { sql, arguments } = prepare(&mut self.tx, sql, args).await?;
        let result = sqlx::query_with(&sql, arguments)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Run a `SELECT COUNT(*)` statement
    pub async fn fetch_count(&mut self, sql: &str, args: &[Value]) -> Result<i64> {
        debug!(sql = %sql, args = args.len(), "counting rows");
        let Prepared { sql, arguments } = prepare(&mut self.tx, sql, args).await?;
        let row = sqlx::query_with(&sql, arguments)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Run an `EXPLAIN (FORMAT JSON)` statement and read the planner's row estimate
    pub async fn fetch_plan_rows(&mut self, sql: &str, args: &[Value]) -> Result<i64> {
        debug!(sql = %sql, args = args.len(), "estimating rows");
        let Prepared { sql, arguments } = prepare(&mut self.tx, sql, args).await?;
        let row = sqlx::query_with(&sql, arguments)
            .fetch_one(&mut *self.tx)
            .await?;
        let plan: Value = row.try_get(0)?;
        Ok(plan_rows(&plan))
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll back; a failed rollback is logged, the connection is discarded by the pool
    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "rollback failed");
        }
    }

    /// Commit on success, roll back on failure
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }
}

/// `Plan Rows` of the top plan node in `EXPLAIN (FORMAT JSON)` output
fn plan_rows(plan: &Value) -> i64 {
    plan.get(0)
        .and_then(|entry| entry.get("Plan"))
        .and_then(|node| node.get("Plan Rows"))
        .and_then(Value::as_f64)
        .map(|rows| rows.round() as i64)
        .unwrap_or(0)
}

/// Fetch rows in a single scoped transaction
pub async fn fetch_rows(
    pool: &PgPool,
    config: &EngineConfig,
    context: Option<&RlsContext>,
    sql: &str,
    args: &[Value],
) -> Result<Vec<RowMap>> {
    let mut tx = ScopedTransaction::begin(pool, config, context).await?;
    let result = tx.fetch_rows(sql, args).await;
    tx.finish(result).await
}

/// Execute a statement in a single scoped transaction
pub async fn execute(
    pool: &PgPool,
    config: &EngineConfig,
    context: Option<&RlsContext>,
    sql: &str,
    args: &[Value],
) -> Result<u64> {
    let mut tx = ScopedTransaction::begin(pool, config, context).await?;
    let result = tx.execute(sql, args).await;
    tx.finish(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // =========================================================================
    // Claims
    // =========================================================================

    #[test]
    fn test_claims_json() {
        let ctx = RlsContext::new("user-1", "editor").with_claim("email", "a@b.c");
        assert_eq!(
            ctx.claims_json(),
            json!({"email": "a@b.c", "sub": "user-1", "role": "editor"})
        );
    }

    #[test]
    fn test_claims_cannot_override_identity() {
        let ctx = RlsContext::new("user-1", "editor")
            .with_claim("sub", "someone-else")
            .with_claim("role", "admin");
        let claims = ctx.claims_json();
        assert_eq!(claims["sub"], "user-1");
        assert_eq!(claims["role"], "editor");
    }

    #[test]
    fn test_anonymous_context() {
        assert!(RlsContext::default().is_anonymous());
        assert!(!RlsContext::new("u", "").is_anonymous());
        assert!(!RlsContext::new("", "anon").is_anonymous());
    }

    #[test]
    fn test_context_deserialize_without_claims() {
        let ctx: RlsContext =
            serde_json::from_value(json!({"user_id": "u1", "role": "user"})).unwrap();
        assert_eq!(ctx, RlsContext::new("u1", "user"));
    }

    // =========================================================================
    // Role statement
    // =========================================================================

    #[test]
    fn test_set_role_sql() {
        assert_eq!(
            set_role_sql("authenticated").unwrap(),
            "SET LOCAL ROLE \"authenticated\""
        );
        let err = set_role_sql("admin; RESET ROLE").unwrap_err();
        assert!(matches!(err, DataApiError::RlsSetup(_)));
        assert!(set_role_sql("").is_err());
    }

    // =========================================================================
    // Planner output
    // =========================================================================

    #[test]
    fn test_plan_rows() {
        let plan = json!([{"Plan": {"Node Type": "Seq Scan", "Plan Rows": 1523.0}}]);
        assert_eq!(plan_rows(&plan), 1523);
        assert_eq!(plan_rows(&json!([])), 0);
        assert_eq!(plan_rows(&json!({"Plan": {}})), 0);
    }
}
