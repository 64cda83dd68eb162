//! Database connection and query execution
//!
//! [Database] wraps the SQLite pool and runs compiled queries under a
//! timeout. [ConnectionCache] hands out one lazily created pool to every
//! caller.

pub mod schema_sync;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteQueryResult, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{OrmError, Result};
use crate::orm::{CompiledQuery, SqlValue};

/// One result row, keyed by output column name in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    columns: Vec<(String, SqlValue)>,
}

impl RawRow {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn columns(&self) -> &[(String, SqlValue)] {
        &self.columns
    }

    pub fn to_json(&self) -> JsonMap<String, JsonValue> {
        self.columns
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

/// Anything that can execute compiled SELECT statements.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<RawRow>>;

    /// Run a single-column count query.
    async fn fetch_count(&self, query: &CompiledQuery) -> Result<i64>;
}

/// Decode a SQLite row by the storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<RawRow> {
    let mut columns = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => {
                    SqlValue::Int(row.try_get_unchecked::<i64, _>(index)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" => SqlValue::Float(row.try_get_unchecked::<f64, _>(index)?),
                "BLOB" => SqlValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                _ => SqlValue::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        columns.push((column.name().to_string(), value));
    }
    Ok(RawRow::new(columns))
}

/// Database wrapper providing connection pool access
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// Create a new database connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        // An in-memory database lives only as long as its connections
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        info!(url = %config.url, in_memory, "Connected to database");
        Ok(Self::new(pool, config.query_timeout))
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Run a driver operation under the query timeout. On expiry the caller
    /// gets [OrmError::QueryTimeout], but SQLite's worker thread keeps running
    /// the statement until it finishes; the connection is busy until then.
    async fn timed<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, operation).await {
            Ok(result) => result.map_err(OrmError::from),
            Err(_) => Err(OrmError::QueryTimeout(self.query_timeout)),
        }
    }

    /// Execute a statement that returns no rows.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<SqliteQueryResult> {
        debug!(sql = %sql, params = params.len(), "Executing statement");
        let mut query = sqlx::query(sql);
        for param in params {
            query = param.bind_to_query(query);
        }
        self.timed(query.execute(&self.pool)).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RowSource for Database {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<RawRow>> {
        debug!(sql = %query.sql, params = query.params.len(), "Executing query");
        let mut statement = sqlx::query(&query.sql);
        for param in &query.params {
            statement = param.bind_to_query(statement);
        }
        let rows = self.timed(statement.fetch_all(&self.pool)).await?;
        debug!(rows = rows.len(), "Query returned");
        rows.iter().map(decode_row).collect()
    }

    async fn fetch_count(&self, query: &CompiledQuery) -> Result<i64> {
        debug!(sql = %query.sql, params = query.params.len(), "Executing count query");
        let mut statement = sqlx::query(&query.sql);
        for param in &query.params {
            statement = param.bind_to_query(statement);
        }
        let row = self.timed(statement.fetch_one(&self.pool)).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

type PendingConnection = Shared<BoxFuture<'static, Result<Database>>>;

/// Lazily connects once and hands the same [Database] to every caller.
///
/// Concurrent first callers all await the same connection attempt. A failed
/// attempt is memoized as well until [close](Self::close) clears it.
pub struct ConnectionCache {
    config: DatabaseConfig,
    pending: Mutex<Option<PendingConnection>>,
}

impl ConnectionCache {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Database> {
        let pending = {
            let mut slot = self.pending.lock();
            slot.get_or_insert_with(|| {
                let config = self.config.clone();
                debug!(url = %config.url, "Opening database connection");
                async move { Database::connect(&config).await }
                    .boxed()
                    .shared()
            })
            .clone()
        };
        pending.await
    }

    /// True once a connection attempt has resolved to an open pool. A
    /// pending or failed attempt is not connected.
    pub fn is_connected(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .and_then(|pending| pending.peek())
            .is_some_and(|result| result.is_ok())
    }

    /// Close the pool, if one was opened, and forget it.
    pub async fn close(&self) {
        let pending = self.pending.lock().take();
        if let Some(pending) = pending {
            if let Ok(database) = pending.await {
                database.close().await;
                info!(url = %self.config.url, "Database connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_raw_row_lookup() {
        let row = RawRow::new(vec![
            ("category_id".to_string(), SqlValue::Int(1)),
            ("category_name".to_string(), SqlValue::from("cat1")),
        ]);
        assert_eq!(row.get("category_id"), Some(&SqlValue::Int(1)));
        assert_eq!(row.get("nope"), None);
        assert_eq!(
            JsonValue::Object(row.to_json()),
            json!({"category_id": 1, "category_name": "cat1"})
        );
    }

    #[tokio::test]
    async fn test_decode_storage_classes() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let query = CompiledQuery {
            sql: "SELECT 1 AS \"i\", 2.5 AS \"f\", 'x' AS \"s\", NULL AS \"n\", x'0102' AS \"b\", ?1 AS \"p\"".into(),
            params: vec![SqlValue::Bool(true)],
            shape: Default::default(),
        };
        let rows = db.fetch_rows(&query).await.unwrap();
        assert_eq!(
            rows[0].columns(),
            &[
                ("i".to_string(), SqlValue::Int(1)),
                ("f".to_string(), SqlValue::Float(2.5)),
                ("s".to_string(), SqlValue::String("x".into())),
                ("n".to_string(), SqlValue::Null),
                ("b".to_string(), SqlValue::Bytes(vec![1, 2])),
                ("p".to_string(), SqlValue::Int(1)),
            ]
        );
        db.close().await;
    }
}
