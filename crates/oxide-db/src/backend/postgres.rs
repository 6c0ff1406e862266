//! Networked PostgreSQL backend.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Backend, Transaction, TransactionMode};
use crate::bind::Shape;
use crate::dialect::{Dialect, POSTGRES};
use crate::error::{DbError, DriverError, Result};
use crate::executor::{BoxFuture, Executor, QueryResult, Statement};
use crate::value::{Row, Value};

/// PostgreSQL backend over a connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Executor for PostgresBackend {
    fn dialect(&self) -> &'static dyn Dialect {
        &POSTGRES
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

impl Backend for PostgresBackend {
    fn executor(&self) -> &dyn Executor {
        self
    }

    fn begin(&self, mode: TransactionMode) -> BoxFuture<'_, Result<Box<dyn Transaction>>> {
        Box::pin(async move {
            // The checked-out connection goes back to the pool when the
            // transaction is committed, rolled back or dropped.
            let mut tx = self.pool.begin().await?;
            if mode == TransactionMode::SchemaChange {
                let sql = "SET CONSTRAINTS ALL DEFERRED";
                sqlx::query(sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| statement_error(sql, source))?;
            }
            debug!(?mode, "Began transaction");
            Ok(Box::new(PostgresTransaction {
                tx: Mutex::new(Some(tx)),
            }) as Box<dyn Transaction>)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.pool.close().await })
    }
}

struct PostgresTransaction {
    tx: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl PostgresTransaction {
    fn take(self) -> Result<sqlx::Transaction<'static, Postgres>> {
        self.tx
            .into_inner()
            .ok_or_else(|| DbError::sync("transaction already finished"))
    }
}

impl Executor for PostgresTransaction {
    fn dialect(&self) -> &'static dyn Dialect {
        &POSTGRES
    }

    fn run<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or("transaction already finished")?;
            Ok(run_statement(&mut **tx, statement).await?)
        })
    }
}

impl Transaction for PostgresTransaction {
    fn executor(&self) -> &dyn Executor {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.take()?
                .commit()
                .await
                .map_err(|source| statement_error("COMMIT", source))?;
            debug!("Committed transaction");
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if let Err(err) = self.take()?.rollback().await {
                warn!(error = %err, "Rollback failed");
                return Err(statement_error("ROLLBACK", err));
            }
            debug!("Rolled back transaction");
            Ok(())
        })
    }
}

fn statement_error(sql: &str, source: sqlx::Error) -> DbError {
    DbError::Query {
        sql: sql.to_string(),
        params: Vec::new(),
        source: Box::new(source),
    }
}

/// Runs a statement on one connection.
async fn run_statement(
    conn: &mut PgConnection,
    statement: &Statement,
) -> std::result::Result<QueryResult, sqlx::Error> {
    let mut query = sqlx::query::<Postgres>(&statement.sql);
    for value in &statement.params {
        query = match value {
            // `bind_named` inlines NULLs; only hand-built statements get here.
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

fn decode_row(row: &PgRow) -> std::result::Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match column.type_info().name() {
                "BOOL" => Value::Bool(row.try_get::<bool, _>(i)?),
                "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(i)?)),
                "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(i)?)),
                "INT8" => Value::Int(row.try_get::<i64, _>(i)?),
                "FLOAT4" => Value::Float(f64::from(row.try_get::<f32, _>(i)?)),
                "FLOAT8" => Value::Float(row.try_get::<f64, _>(i)?),
                "NUMERIC" => {
                    let decimal = row.try_get::<Decimal, _>(i)?;
                    match decimal.to_i64().filter(|_| decimal.fract().is_zero()) {
                        Some(int) => Value::Int(int),
                        None => Value::Float(decimal.to_f64().unwrap_or(f64::NAN)),
                    }
                }
                "TIMESTAMPTZ" => Value::Text(
                    row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)?
                        .to_rfc3339(),
                ),
                "TIMESTAMP" => Value::Text(row.try_get::<chrono::NaiveDateTime, _>(i)?.to_string()),
                "DATE" => Value::Text(row.try_get::<chrono::NaiveDate, _>(i)?.to_string()),
                _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}
