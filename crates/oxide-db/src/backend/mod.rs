//! Backing stores.
//!
//! A [`Backend`] owns the connection handle of one store and hands out
//! [`Transaction`]s. Both are [`Executor`]s, so any code that runs
//! statements works unchanged inside or outside a transaction.

mod d1;
mod postgres;
mod sqlite;

pub use d1::{D1Backend, D1Binding};
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::dialect::DialectKind;
use crate::error::{DbError, Result};
use crate::executor::{BoxFuture, Executor};

/// How a transaction treats foreign key enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Constraints are enforced statement by statement.
    #[default]
    Standard,
    /// Constraints are checked only at commit, so tables can be rebuilt and
    /// renamed while other tables still reference them.
    SchemaChange,
}

/// An open transaction.
pub trait Transaction: Executor {
    /// This transaction as a plain executor.
    fn executor(&self) -> &dyn Executor;

    /// Commits the transaction.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>>;

    /// Rolls the transaction back.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// A connected backing store.
pub trait Backend: Executor {
    /// This backend as a plain executor.
    fn executor(&self) -> &dyn Executor;

    /// Begins a transaction. Stores without transactions return a handle
    /// whose statements run individually.
    fn begin(&self, mode: TransactionMode) -> BoxFuture<'_, Result<Box<dyn Transaction>>>;

    /// Closes the connection pool.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Where to connect.
#[derive(Clone)]
pub enum ConnectionConfig {
    /// `sqlite:<path>`, `sqlite::memory:`, `postgres://…` or `d1://<binding>`.
    Url(String),
    /// An existing SQLite pool.
    Sqlite(SqlitePool),
    /// An existing PostgreSQL pool.
    Postgres(PgPool),
    /// A host-supplied D1 binding.
    D1(Arc<dyn D1Binding>),
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(&redact(url)).finish(),
            Self::Sqlite(_) => f.write_str("Sqlite(<pool>)"),
            Self::Postgres(_) => f.write_str("Postgres(<pool>)"),
            Self::D1(_) => f.write_str("D1(<binding>)"),
        }
    }
}

impl From<&str> for ConnectionConfig {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for ConnectionConfig {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<SqlitePool> for ConnectionConfig {
    fn from(pool: SqlitePool) -> Self {
        Self::Sqlite(pool)
    }
}

impl From<PgPool> for ConnectionConfig {
    fn from(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }
}

impl From<Arc<dyn D1Binding>> for ConnectionConfig {
    fn from(binding: Arc<dyn D1Binding>) -> Self {
        Self::D1(binding)
    }
}

impl ConnectionConfig {
    /// Infers the dialect from the configuration's shape.
    pub fn dialect_kind(&self) -> Result<DialectKind> {
        match self {
            Self::Sqlite(_) => Ok(DialectKind::Sqlite),
            Self::Postgres(_) => Ok(DialectKind::Postgres),
            Self::D1(_) => Ok(DialectKind::D1),
            Self::Url(url) => {
                if url.starts_with("sqlite:") {
                    Ok(DialectKind::Sqlite)
                } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                    Ok(DialectKind::Postgres)
                } else if d1_binding_name(url).is_some() {
                    Ok(DialectKind::D1)
                } else {
                    Err(DbError::config(format!(
                        "unsupported connection string {:?}",
                        redact(url)
                    )))
                }
            }
        }
    }

    /// Opens the backend.
    ///
    /// `d1://<name>` URLs are looked up in `bindings`.
    pub async fn open(
        &self,
        max_connections: u32,
        bindings: &HashMap<String, Arc<dyn D1Binding>>,
    ) -> Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match self {
            Self::Sqlite(pool) => Arc::new(SqliteBackend::new(pool.clone())),
            Self::Postgres(pool) => Arc::new(PostgresBackend::new(pool.clone())),
            Self::D1(binding) => Arc::new(D1Backend::new(Arc::clone(binding))),
            Self::Url(url) => match self.dialect_kind()? {
                DialectKind::Sqlite => {
                    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
                    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
                    // Every connection to an in-memory database sees its own
                    // database, so the pool must keep exactly one alive.
                    let pool = if in_memory {
                        SqlitePoolOptions::new()
                            .max_connections(1)
                            .idle_timeout(None)
                            .max_lifetime(None)
                            .connect_with(options)
                            .await?
                    } else {
                        SqlitePoolOptions::new()
                            .max_connections(max_connections)
                            .connect_with(options)
                            .await?
                    };
                    Arc::new(SqliteBackend::new(pool))
                }
                DialectKind::Postgres => {
                    let pool = PgPoolOptions::new()
                        .max_connections(max_connections)
                        .connect(url)
                        .await?;
                    Arc::new(PostgresBackend::new(pool))
                }
                DialectKind::D1 => {
                    let name = d1_binding_name(url).unwrap_or_default();
                    let binding = bindings.get(name).ok_or_else(|| {
                        DbError::config(format!("no D1 binding registered as {name:?}"))
                    })?;
                    Arc::new(D1Backend::new(Arc::clone(binding)))
                }
            },
        };
        info!(dialect = %backend.dialect().kind(), "Connected");
        Ok(backend)
    }
}

fn d1_binding_name(url: &str) -> Option<&str> {
    url.strip_prefix("d1://").filter(|name| !name.is_empty())
}

/// Hides the password of a connection URL.
fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => match credentials.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_detection() {
        let kind = |url: &str| ConnectionConfig::from(url).dialect_kind();
        assert_eq!(kind("sqlite::memory:").unwrap(), DialectKind::Sqlite);
        assert_eq!(kind("sqlite://data/app.db").unwrap(), DialectKind::Sqlite);
        assert_eq!(kind("postgres://localhost/app").unwrap(), DialectKind::Postgres);
        assert_eq!(kind("postgresql://localhost/app").unwrap(), DialectKind::Postgres);
        assert_eq!(kind("d1://DB").unwrap(), DialectKind::D1);
        assert!(matches!(kind("mysql://localhost"), Err(DbError::Config(_))));
        assert!(kind("d1://").is_err());
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://app:secret@db:5432/app"),
            "postgres://app:***@db:5432/app"
        );
        assert_eq!(redact("sqlite::memory:"), "sqlite::memory:");
        let err = ConnectionConfig::from("mongodb://u:pw@host").dialect_kind().unwrap_err();
        assert!(!err.to_string().contains("pw"));
    }

    #[tokio::test]
    async fn test_unknown_d1_binding() {
        let err = ConnectionConfig::from("d1://MISSING")
            .open(1, &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("MISSING"));
    }

    #[tokio::test]
    async fn test_open_memory_sqlite() {
        let backend = ConnectionConfig::from("sqlite::memory:")
            .open(5, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(backend.dialect().kind(), DialectKind::Sqlite);
        backend
            .execute("CREATE TABLE t (x INTEGER)", &crate::params! {})
            .await
            .unwrap();
        // Same connection, same in-memory database.
        let rows = backend.query("SELECT COUNT(*) AS n FROM t", &crate::params! {}).await.unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(0));
        backend.close().await;
    }
}
