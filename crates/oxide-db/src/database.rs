//! The database facade.
//!
//! [`Database`] ties a connection configuration to a resolved schema. It owns
//! the backend handle, the lock manager and the sync options, and exposes
//! the execution primitive plus option, lock and transaction helpers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::backend::{Backend, ConnectionConfig, D1Binding, Transaction, TransactionMode};
use crate::dialect::{Dialect, DialectKind};
use crate::error::{DbError, Result};
use crate::executor::{BoxFuture, Executor, QueryResult, Timed};
use crate::lock::{LockInfo, LockManager, LockOptions};
use crate::options;
use crate::resolver::{resolve, ResolvedSchema, SchemaMap};
use crate::schema::Schema;
use crate::sync::{persisted_map, synchronize, SyncOptions, SyncOutcome};
use crate::transaction::run_in_transaction;
use crate::value::{Params, Row};

/// Default pool size for pooled backends.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Options for a [`Database`].
#[derive(Clone)]
pub struct DatabaseOptions {
    /// Destructive-step and lock settings for synchronization.
    pub sync: SyncOptions,
    /// Pool size for pooled backends. In-memory SQLite always uses one.
    pub max_connections: u32,
    /// Whether [`Database::connect`] synchronizes the schema.
    pub sync_on_connect: bool,
    /// D1 bindings addressable as `d1://<name>`.
    pub bindings: HashMap<String, Arc<dyn D1Binding>>,
}

impl fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("sync", &self.sync)
            .field("max_connections", &self.max_connections)
            .field("sync_on_connect", &self.sync_on_connect)
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync: SyncOptions::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sync_on_connect: true,
            bindings: HashMap::new(),
        }
    }

    /// Sets the sync options.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Controls whether connecting synchronizes the schema.
    #[must_use]
    pub fn with_sync_on_connect(mut self, sync_on_connect: bool) -> Self {
        self.sync_on_connect = sync_on_connect;
        self
    }

    /// Registers a D1 binding under `name`.
    #[must_use]
    pub fn with_d1_binding(mut self, name: impl Into<String>, binding: Arc<dyn D1Binding>) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }
}

/// A schema-managed database.
pub struct Database {
    config: ConnectionConfig,
    kind: DialectKind,
    schema: ResolvedSchema,
    options: DatabaseOptions,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    locks: LockManager,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field("dialect", &self.kind)
            .field("collections", &self.schema.map().len())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Validates the schema and the connection configuration.
    ///
    /// Nothing is opened until [`connect`](Self::connect).
    pub fn new(
        config: impl Into<ConnectionConfig>,
        schema: &Schema,
        options: DatabaseOptions,
    ) -> Result<Self> {
        let config = config.into();
        let kind = config.dialect_kind()?;
        let schema = resolve(schema)?;
        Ok(Self {
            config,
            kind,
            schema,
            options,
            backend: RwLock::new(None),
            locks: LockManager::new(),
        })
    }

    /// Opens the backend, creates the options table and, unless disabled,
    /// synchronizes the schema.
    pub async fn connect(&self) -> Result<SyncOutcome> {
        let backend = {
            let mut slot = self.backend.write().await;
            match slot.as_ref() {
                Some(backend) => Arc::clone(backend),
                None => {
                    let backend = self
                        .config
                        .open(self.options.max_connections, &self.options.bindings)
                        .await?;
                    *slot = Some(Arc::clone(&backend));
                    backend
                }
            }
        };
        options::ensure_table(backend.executor()).await?;
        if self.options.sync_on_connect {
            synchronize(backend.as_ref(), &self.locks, &self.schema, &self.options.sync).await
        } else {
            Ok(SyncOutcome::Unchanged)
        }
    }

    /// Releases locks this instance holds and closes the backend.
    pub async fn close(&self) {
        let Some(backend) = self.backend.write().await.take() else {
            return;
        };
        if let Err(err) = self.locks.release_owned(backend.executor()).await {
            warn!(error = %err, "Failed to release locks on close");
        }
        backend.close().await;
        info!("Closed database");
    }

    /// Whether [`connect`](Self::connect) has opened the backend.
    pub async fn is_connected(&self) -> bool {
        self.backend.read().await.is_some()
    }

    /// The open backend.
    pub async fn backend(&self) -> Result<Arc<dyn Backend>> {
        self.backend
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(DbError::NotConnected)
    }

    /// Dialect of the configured store.
    #[must_use]
    pub fn dialect(&self) -> &'static dyn Dialect {
        self.kind.dialect()
    }

    /// The resolved schema.
    #[must_use]
    pub fn schema(&self) -> &ResolvedSchema {
        &self.schema
    }

    /// The schema map this instance synchronizes towards.
    #[must_use]
    pub fn schema_map(&self) -> &SchemaMap {
        self.schema.map()
    }

    /// The schema map persisted by the last successful synchronization.
    pub async fn persisted_schema_map(&self) -> Result<Option<SchemaMap>> {
        persisted_map(self.backend().await?.executor()).await
    }

    /// Synchronizes the schema now.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let backend = self.backend().await?;
        synchronize(backend.as_ref(), &self.locks, &self.schema, &self.options.sync).await
    }

    /// Executes a statement with named `$name` parameters.
    pub async fn exec(&self, sql: &str, params: &Params, suppress: bool) -> Result<QueryResult> {
        self.backend().await?.exec(sql, params, suppress).await
    }

    /// Executes a statement and reports how long it took.
    pub async fn exec_with_duration(
        &self,
        sql: &str,
        params: &Params,
        suppress: bool,
    ) -> Result<Timed<QueryResult>> {
        self.backend()
            .await?
            .exec_with_duration(sql, params, suppress)
            .await
    }

    /// Executes a row-returning statement.
    pub async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>> {
        self.backend().await?.query(sql, params).await
    }

    /// Executes a statement and returns the affected-row count.
    pub async fn execute(&self, sql: &str, params: &Params) -> Result<u64> {
        self.backend().await?.execute(sql, params).await
    }

    /// Runs `f` in a transaction, committing on success and rolling back on
    /// error.
    ///
    /// ```rust,ignore
    /// let moved = db
    ///     .transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.execute(r#"UPDATE "Users" SET "role" = 'admin'"#, &params! {}).await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t dyn Executor) -> BoxFuture<'t, Result<T>>,
    {
        let backend = self.backend().await?;
        run_in_transaction(backend.as_ref(), TransactionMode::Standard, f).await
    }

    /// Begins a transaction the caller finishes explicitly.
    pub async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.backend().await?.begin(TransactionMode::Standard).await
    }

    /// Takes an advisory lock. Returns `false` on timeout.
    pub async fn lock(&self, name: &str, options: LockOptions) -> Result<bool> {
        let backend = self.backend().await?;
        self.locks.lock(backend.executor(), name, options).await
    }

    /// Whether anyone holds the lock `name`.
    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        let backend = self.backend().await?;
        self.locks.is_locked(backend.executor(), name).await
    }

    /// Lists held locks.
    pub async fn list_locks(&self) -> Result<Vec<LockInfo>> {
        let backend = self.backend().await?;
        self.locks.list(backend.executor()).await
    }

    /// Releases the lock `name`.
    pub async fn unlock(&self, name: &str) -> Result<bool> {
        let backend = self.backend().await?;
        self.locks.unlock(backend.executor(), name).await
    }

    /// Releases every lock, including other instances' locks.
    pub async fn unlock_all(&self) -> Result<u64> {
        let backend = self.backend().await?;
        self.locks.unlock_all(backend.executor()).await
    }

    /// Reads an option.
    pub async fn get_option<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        options::get(self.backend().await?.executor(), key).await
    }

    /// Writes an option.
    pub async fn set_option<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        options::set(self.backend().await?.executor(), key, value).await
    }

    /// Deletes an option. Returns whether it existed.
    pub async fn delete_option(&self, key: &str) -> Result<bool> {
        options::delete(self.backend().await?.executor(), key).await
    }

    /// Lists user options.
    pub async fn list_options(&self) -> Result<Vec<(String, serde_json::Value)>> {
        options::list(self.backend().await?.executor()).await
    }
}
