//! D1 edge binding backend.
//!
//! The binding is supplied by the host runtime. It speaks SQLite but has no
//! transactions: every statement commits on its own, so a "transaction" here
//! only forwards statements and cannot roll anything back.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Backend, Transaction, TransactionMode};
use crate::bind::Shape;
use crate::dialect::{Dialect, D1};
use crate::error::{DriverError, Result};
use crate::executor::{BoxFuture, Executor, QueryResult, Statement};
use crate::params;
use crate::value::{Row, Value};

/// Statement execution provided by a D1 host.
///
/// SQL arrives with `?1`-style placeholders and values in placeholder order.
pub trait D1Binding: Send + Sync {
    /// Runs a statement and returns its rows.
    fn all<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, std::result::Result<Vec<Row>, DriverError>>;

    /// Runs a statement and returns the number of changed rows.
    fn run<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, std::result::Result<u64, DriverError>>;
}

/// Backend over a D1 binding.
#[derive(Clone)]
pub struct D1Backend {
    binding: Arc<dyn D1Binding>,
}

impl fmt::Debug for D1Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("D1Backend").finish_non_exhaustive()
    }
}

impl D1Backend {
    /// Wraps a binding.
    #[must_use]
    pub fn new(binding: Arc<dyn D1Binding>) -> Self {
        Self { binding }
    }
}

fn run_on<'a>(
    binding: &'a dyn D1Binding,
    statement: &'a Statement,
) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>> {
    Box::pin(async move {
        match statement.shape {
            Shape::Rows => Ok(QueryResult::Rows(
                binding.all(&statement.sql, &statement.params).await?,
            )),
            Shape::Count => Ok(QueryResult::Count(
                binding.run(&statement.sql, &statement.params).await?,
            )),
        }
    })
}

impl Executor for D1Backend {
    fn dialect(&self) -> &'static dyn Dialect {
        &D1
    }

    fn run<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>> {
        run_on(self.binding.as_ref(), statement)
    }
}

impl Backend for D1Backend {
    fn executor(&self) -> &dyn Executor {
        self
    }

    fn begin(&self, mode: TransactionMode) -> BoxFuture<'_, Result<Box<dyn Transaction>>> {
        Box::pin(async move {
            if mode == TransactionMode::SchemaChange {
                // Lets tables be rebuilt while others still reference them.
                self.execute("PRAGMA defer_foreign_keys = on", &params! {})
                    .await?;
            }
            debug!("D1 has no transactions, statements run individually");
            Ok(Box::new(D1Passthrough {
                binding: Arc::clone(&self.binding),
            }) as Box<dyn Transaction>)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Stand-in transaction that forwards statements to the binding.
struct D1Passthrough {
    binding: Arc<dyn D1Binding>,
}

impl Executor for D1Passthrough {
    fn dialect(&self) -> &'static dyn Dialect {
        &D1
    }

    fn run<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, std::result::Result<QueryResult, DriverError>> {
        run_on(self.binding.as_ref(), statement)
    }
}

impl Transaction for D1Passthrough {
    fn executor(&self) -> &dyn Executor {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async {
            warn!("D1 cannot roll back, statements already applied are kept");
            Ok(())
        })
    }
}
