//! Postgres row-store over a `sqlx` connection pool.
//!
//! Rows are converted to JSON server-side: the registry statement is wrapped
//! as `SELECT row_to_json(q) FROM (<sql>) AS q`, so arbitrary result shapes
//! come back as one `json` column per row without per-type decoding here.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::QueryScalar;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info};

use super::{Row, RowStore};
use crate::config::DatabaseConfig;
use crate::error::{LensError, Result};

/// Postgres-backed [`RowStore`].
#[derive(Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

impl std::fmt::Debug for PgRowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRowStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PgRowStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the database section of the config.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                LensError::Config(
                    "database.url is not set (config file, BIZLENS_DATABASE_URL or DATABASE_URL)"
                        .into(),
                )
            })?;

        let statement_timeout = config.statement_timeout_secs;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if statement_timeout > 0 {
                        let stmt = format!("SET statement_timeout = '{}s'", statement_timeout);
                        sqlx::query(&stmt).execute(conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|e| LensError::Execution(format!("Failed to connect to Postgres: {}", e)))?;

        info!(max_connections = config.max_connections, "Postgres pool ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Wrap registry SQL so each row comes back as a single JSON object.
pub fn wrap_as_json(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT row_to_json(q) FROM ({}) AS q", trimmed)
}

/// Bind one parameter. Strings and nulls go out as `text`; registry SQL casts
/// placeholders compared with other column types (`$1::date`).
fn bind_param<'q>(
    query: QueryScalar<'q, Postgres, Value, PgArguments>,
    param: &Value,
) -> Result<QueryScalar<'q, Postgres, Value, PgArguments>> {
    Ok(match param {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                return Err(LensError::InvalidRequest(format!(
                    "Numeric parameter out of range: {}",
                    n
                )));
            }
        }
        Value::String(s) => query.bind(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(LensError::InvalidRequest(
                "Query parameters must be primitive values".into(),
            ))
        }
    })
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let wrapped = wrap_as_json(sql);
        let mut query = sqlx::query_scalar::<Postgres, Value>(&wrapped);
        for param in params {
            query = bind_param(query, param)?;
        }

        let values = query.fetch_all(&self.pool).await?;
        debug!(rows = values.len(), "Postgres query returned");

        values
            .into_iter()
            .map(|v| match v {
                Value::Object(row) => Ok(row),
                other => Err(LensError::Execution(format!(
                    "Expected JSON object row, got {}",
                    other
                ))),
            })
            .collect()
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrap_as_json() {
        assert_eq!(
            wrap_as_json("SELECT a, b FROM t WHERE x = $1;  "),
            "SELECT row_to_json(q) FROM (SELECT a, b FROM t WHERE x = $1) AS q"
        );
    }

    #[test]
    fn test_bind_param_accepts_primitives_only() {
        let sql = "SELECT $1::date";
        for param in [json!("2024-03-01"), Value::Null, json!(7), json!(1.5), json!(true)] {
            assert!(bind_param(sqlx::query_scalar::<Postgres, Value>(sql), &param).is_ok());
        }
        let err = bind_param(sqlx::query_scalar::<Postgres, Value>(sql), &json!([1]))
            .err()
            .unwrap();
        assert!(matches!(err, LensError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connect_without_url_is_config_error() {
        let err = PgRowStore::connect(&DatabaseConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LensError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_execution_error() {
        let cfg = DatabaseConfig {
            url: Some("postgres://user:pw@127.0.0.1:1/db".into()),
            acquire_timeout_secs: 1,
            ..Default::default()
        };
        let err = PgRowStore::connect(&cfg).await.unwrap_err();
        assert!(matches!(err, LensError::Execution(_)));
    }
}
