//! Row-store executors.

pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

pub use postgres::PgRowStore;

/// One result row: column name → value, in column order.
pub type Row = Map<String, Value>;

/// Executes registry SQL with positional parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Run `sql` with `params` bound to `$1..$N` and return every row.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Backend name for logging ("postgres", ...).
    fn name(&self) -> &str;
}
