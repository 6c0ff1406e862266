//! Embedded SQLite backend.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Backend, Transaction, TransactionMode};
use crate::bind::Shape;
use crate::dialect::{Dialect, SQLITE};
use crate::error::{DbError, DriverError, Result};
use crate::executor::{BoxFuture, Executor, QueryResult, Statement};
use crate::value::{Row, Value};

/// SQLite backend over a connection pool.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Executor for SqliteBackend {
    fn dialect(&self) -> &'static dyn Dialect {
        &SQLITE
    }

    fn run<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            Ok(run_statement(&mut conn, statement).await?)
        })
    }
}

impl Backend for SqliteBackend {
    fn executor(&self) -> &dyn Executor {
        self
    }

    fn begin(&self, mode: TransactionMode) -> BoxFuture<'_, Result<Box<dyn Transaction>>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            if mode == TransactionMode::SchemaChange {
                // Has no effect inside a transaction, so it must come first.
                raw(&mut conn, "PRAGMA foreign_keys = OFF").await?;
            }
            if let Err(err) = raw(&mut conn, "BEGIN").await {
                if mode == TransactionMode::SchemaChange {
                    if let Err(restore) = raw(&mut conn, "PRAGMA foreign_keys = ON").await {
                        warn!(error = %restore, "Failed to re-enable foreign keys");
                    }
                }
                return Err(err);
            }
            debug!(?mode, "Began transaction");
            Ok(Box::new(SqliteTransaction {
                conn: Mutex::new(Some(conn)),
                mode,
            }) as Box<dyn Transaction>)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.pool.close().await })
    }
}

/// A transaction on a dedicated pooled connection.
struct SqliteTransaction {
    conn: Mutex<Option<PoolConnection<Sqlite>>>,
    mode: TransactionMode,
}

impl SqliteTransaction {
    fn take(&mut self) -> Result<PoolConnection<Sqlite>> {
        self.conn
            .get_mut()
            .take()
            .ok_or_else(|| DbError::sync("transaction already finished"))
    }

    async fn restore_foreign_keys(&self, conn: &mut SqliteConnection) {
        if self.mode == TransactionMode::SchemaChange {
            if let Err(err) = raw(conn, "PRAGMA foreign_keys = ON").await {
                warn!(error = %err, "Failed to re-enable foreign keys");
            }
        }
    }
}

impl Executor for SqliteTransaction {
    fn dialect(&self) -> &'static dyn Dialect {
        &SQLITE
    }

    fn run<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or("transaction already finished")?;
            Ok(run_statement(conn, statement).await?)
        })
    }
}

impl Transaction for SqliteTransaction {
    fn executor(&self) -> &dyn Executor {
        self
    }

    fn commit(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut conn = self.take()?;
            let mut result = Ok(());
            if self.mode == TransactionMode::SchemaChange {
                result = foreign_key_check(&mut conn).await;
            }
            if result.is_ok() {
                result = raw(&mut conn, "COMMIT").await;
            }
            if result.is_err() {
                rollback_quietly(&mut conn).await;
            }
            self.restore_foreign_keys(&mut conn).await;
            if result.is_ok() {
                debug!("Committed transaction");
            }
            result
        })
    }

    fn rollback(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut conn = self.take()?;
            let result = match raw(&mut conn, "ROLLBACK").await {
                // SQLite may already have rolled back after certain errors.
                Err(err) if err.to_string().contains("no transaction is active") => Ok(()),
                other => other,
            };
            self.restore_foreign_keys(&mut conn).await;
            if result.is_err() {
                // Never hand a connection with an open transaction back to the pool.
                drop(conn.detach());
            } else {
                debug!("Rolled back transaction");
            }
            result
        })
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            warn!("Transaction dropped without commit or rollback, closing its connection");
            drop(conn.detach());
        }
    }
}

async fn rollback_quietly(conn: &mut SqliteConnection) {
    if let Err(err) = raw(conn, "ROLLBACK").await {
        debug!(error = %err, "Rollback after failed commit");
    }
}

async fn foreign_key_check(conn: &mut SqliteConnection) -> Result<()> {
    let sql = "PRAGMA foreign_key_check";
    let violations = sqlx::query(sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(|source| query_error(sql, source))?;
    if violations.is_empty() {
        return Ok(());
    }
    let tables: Vec<String> = violations
        .iter()
        .filter_map(|row| row.try_get::<String, _>("table").ok())
        .collect();
    Err(DbError::sync(format!(
        "foreign key violations in {}",
        tables.join(", ")
    )))
}

async fn raw(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map_err(|source| query_error(sql, source))?;
    Ok(())
}

fn query_error(sql: &str, source: sqlx::Error) -> DbError {
    DbError::Query {
        sql: sql.to_string(),
        params: Vec::new(),
        source: Box::new(source),
    }
}

/// Runs a statement on one connection.
async fn run_statement(
    conn: &mut SqliteConnection,
    statement: &Statement,
) -> std::result::Result<QueryResult, sqlx::Error> {
    let mut query = sqlx::query::<Sqlite>(&statement.sql);
    for value in &statement.params {
        query = match value {
            Value::Null => query.bind(None::<i64>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
        };
    }

    match statement.shape {
        Shape::Rows => {
            let rows = query.fetch_all(&mut *conn).await?;
            rows.iter().map(decode_row).collect::<std::result::Result<_, _>>().map(QueryResult::Rows)
        }
        Shape::Count => {
            let done = query.execute(&mut *conn).await?;
            Ok(QueryResult::Count(done.rows_affected()))
        }
    }
}

fn decode_row(row: &SqliteRow) -> std::result::Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let declared_bool = column.type_info().name().eq_ignore_ascii_case("BOOLEAN");
            let storage = raw.type_info().name().to_ascii_uppercase();
            match storage.as_str() {
                "INTEGER" | "INT8" | "BIGINT" if declared_bool => {
                    Value::Bool(row.try_get_unchecked::<i64, _>(i)? != 0)
                }
                "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(i)?),
                "INTEGER" | "INT8" | "BIGINT" => Value::Int(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" | "FLOAT" | "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
                "BLOB" => Value::Text(
                    String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(i)?).into_owned(),
                ),
                _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}
