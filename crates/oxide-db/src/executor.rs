//! The execution primitive.
//!
//! Everything above the backends talks to the store through [`Executor`]:
//! a pool, a transaction and an edge binding all look the same. Callers pass
//! the executor they want explicitly, so code running inside a transaction
//! simply receives the transaction.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tracing::debug;

use crate::bind::{bind_named, classify, Shape};
use crate::dialect::Dialect;
use crate::error::{DbError, DriverError, Result};
use crate::value::{Params, Row, Value};

/// A boxed future, used to keep the executor traits object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A statement after named parameters were rewritten to positional ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL with backend-native placeholders.
    pub sql: String,
    /// Values in placeholder order.
    pub params: Vec<Value>,
    /// Expected result shape.
    pub shape: Shape,
}

impl Statement {
    /// Creates a statement without parameters.
    #[must_use]
    pub fn raw(sql: impl Into<String>, shape: Shape) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            shape,
        }
    }
}

/// Result of a statement: rows or an affected-row count.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Rows returned by a row-returning statement.
    Rows(Vec<Row>),
    /// Number of rows affected by a count-returning statement.
    Count(u64),
}

impl QueryResult {
    /// The neutral result for a shape, substituted for suppressed failures.
    #[must_use]
    pub fn empty(shape: Shape) -> Self {
        match shape {
            Shape::Rows => Self::Rows(Vec::new()),
            Shape::Count => Self::Count(0),
        }
    }

    /// Consumes the result, returning rows (empty for counts).
    #[must_use]
    pub fn rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Count(_) => Vec::new(),
        }
    }

    /// Returns the affected-row count (number of rows for row results).
    #[must_use]
    pub fn affected(&self) -> u64 {
        match self {
            Self::Rows(rows) => rows.len() as u64,
            Self::Count(n) => *n,
        }
    }
}

/// A result together with how long the statement took.
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    /// The statement result.
    pub result: T,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

/// Runs statements against one backend connection context.
pub trait Executor: Send + Sync {
    /// The dialect of the underlying store.
    fn dialect(&self) -> &'static dyn Dialect;

    /// Runs a prepared statement on the driver.
    fn run<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>>;

    /// Executes `sql` with named `$name` parameters and measures the duration.
    ///
    /// With `suppress`, binding and driver failures are logged and replaced
    /// by an empty result of the statement's shape.
    fn exec_with_duration<'a>(
        &'a self,
        sql: &'a str,
        params: &'a Params,
        suppress: bool,
    ) -> BoxFuture<'a, Result<Timed<QueryResult>>> {
        Box::pin(async move {
            let started = Instant::now();
            let shape = classify(sql);
            let outcome = match bind_named(sql, params, self.dialect().placeholder()) {
                Ok((rewritten, values)) => {
                    let statement = Statement {
                        sql: rewritten,
                        params: values,
                        shape,
                    };
                    self.run(&statement)
                        .await
                        .map_err(|source| DbError::Query {
                            sql: statement.sql.clone(),
                            params: statement.params.clone(),
                            source,
                        })
                }
                Err(err) => Err(err),
            };
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(result) => {
                    debug!(sql = %sql, duration_ms, "Executed statement");
                    Ok(Timed {
                        result,
                        duration_ms,
                    })
                }
                Err(err) if suppress => {
                    debug!(sql = %sql, error = %err, "Suppressed statement failure");
                    Ok(Timed {
                        result: QueryResult::empty(shape),
                        duration_ms,
                    })
                }
                Err(err) => Err(err),
            }
        })
    }

    /// Executes `sql` with named parameters.
    fn exec<'a>(
        &'a self,
        sql: &'a str,
        params: &'a Params,
        suppress: bool,
    ) -> BoxFuture<'a, Result<QueryResult>> {
        Box::pin(async move {
            self.exec_with_duration(sql, params, suppress)
                .await
                .map(|timed| timed.result)
        })
    }

    /// Executes a row-returning statement.
    fn query<'a>(&'a self, sql: &'a str, params: &'a Params) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move { Ok(self.exec(sql, params, false).await?.rows()) })
    }

    /// Executes a statement and returns the affected-row count.
    fn execute<'a>(&'a self, sql: &'a str, params: &'a Params) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move { Ok(self.exec(sql, params, false).await?.affected()) })
    }
}
