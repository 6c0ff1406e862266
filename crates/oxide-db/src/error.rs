//! Error types for the database layer.

use crate::value::Value;

/// Boxed error produced by a backend driver or a host-supplied binding.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while resolving schemas, executing statements or
/// synchronizing structure.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A collection, field, table or column identifier is malformed.
    #[error("Invalid {kind} identifier {name:?}: {reason}")]
    InvalidIdentifier {
        /// What the identifier names (e.g. "collection key", "column").
        kind: &'static str,
        /// The offending identifier.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The schema description or connection configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Named parameters in a statement did not match the supplied values.
    #[error("Parameter binding failed: {message}\n  SQL: {sql}")]
    Binding {
        /// The statement as written by the caller.
        sql: String,
        /// Which names were missing or unused.
        message: String,
    },

    /// The driver rejected a statement.
    #[error("Query failed: {source}\n  SQL: {sql}\n  Params: {params:?}")]
    Query {
        /// The rewritten statement sent to the driver.
        sql: String,
        /// The positional parameters bound to it.
        params: Vec<Value>,
        /// The underlying driver error.
        #[source]
        source: DriverError,
    },

    /// Pool construction or connection failure.
    #[error("Connection error: {0}")]
    Connect(#[from] sqlx::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Option keys starting with `_` are reserved for internal bookkeeping.
    #[error("Option key {0:?} is reserved (keys must not start with '_')")]
    InvalidOptionKey(String),

    /// Structural synchronization could not be completed.
    #[error("Schema synchronization failed: {0}")]
    Sync(String),

    /// The database has not been connected yet or was closed.
    #[error("Database is not connected")]
    NotConnected,
}

impl DbError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a synchronization error.
    pub fn sync(message: impl Into<String>) -> Self {
        Self::Sync(message.into())
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;
