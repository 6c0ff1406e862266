//! Transaction coordination.
//!
//! The callback receives the transaction's executor explicitly; nothing
//! global is swapped while it runs.

use tracing::warn;

use crate::backend::{Backend, TransactionMode};
use crate::error::Result;
use crate::executor::{BoxFuture, Executor};

/// Runs `f` inside a transaction.
///
/// Commits when `f` succeeds. When `f` fails the transaction is rolled back
/// and the original error is returned; a failing rollback is only logged.
pub async fn run_in_transaction<T, F>(backend: &dyn Backend, mode: TransactionMode, f: F) -> Result<T>
where
    F: for<'t> FnOnce(&'t dyn Executor) -> BoxFuture<'t, Result<T>>,
{
    let tx = backend.begin(mode).await?;
    let outcome = f(tx.executor()).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::backend::SqliteBackend;
    use crate::error::DbError;
    use crate::params;

    async fn backend() -> SqliteBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        let backend = SqliteBackend::new(pool);
        backend
            .execute("CREATE TABLE log (line TEXT)", &params! {})
            .await
            .unwrap();
        backend
    }

    async fn count(backend: &SqliteBackend) -> i64 {
        backend
            .query("SELECT COUNT(*) AS n FROM log", &params! {})
            .await
            .unwrap()[0]
            .get_i64("n")
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let db = backend().await;
        let inserted = run_in_transaction(&db, TransactionMode::Standard, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO log (line) VALUES ('a'), ('b')", &params! {})
                    .await
            })
        })
        .await
        .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(count(&db).await, 2);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let db = backend().await;
        let err = run_in_transaction(&db, TransactionMode::Standard, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO log (line) VALUES ('a')", &params! {})
                    .await?;
                tx.execute("INSERT INTO missing (line) VALUES ('b')", &params! {})
                    .await
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        assert_eq!(count(&db).await, 0);
    }
}
