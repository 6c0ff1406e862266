//! Schema synchronization and dialect-neutral query execution.
//!
//! `oxide-db` keeps a live SQLite, PostgreSQL or D1 store in line with a
//! declarative schema description, and runs statements written once with
//! named `$name` parameters against any of them.
//!
//! # Architecture
//!
//! - **Resolver** - Validates a [`Schema`](schema::Schema) and produces the
//!   canonical schema map plus a dependency-ordered list of collections
//! - **Dialect** - Type mapping, DDL generation and introspection per store
//! - **Backend** - Connection pools, transactions and row decoding
//! - **Sync** - Diffs the persisted schema map and applies DDL under an
//!   advisory lock, inside one schema-change transaction
//! - **Database** - The facade owning the connection
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_db::prelude::*;
//!
//! let schema = Schema::new().collection(
//!     CollectionDefinition::new("Users")
//!         .field(FieldDefinition::new("email", DataType::Text).required())
//!         .field(FieldDefinition::new("role", DataType::Text))
//!         .index(IndexDefinition::unique(["email"])),
//! );
//!
//! let db = Database::new("sqlite:app.db", &schema, DatabaseOptions::new())?;
//! db.connect().await?;
//! db.execute(
//!     r#"INSERT INTO "Users" ("email") VALUES ($email)"#,
//!     &params! { "email" => "ada@example.com" },
//! )
//! .await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Synchronize a database with a JSON schema description
//! oxide-db --database sqlite:app.db sync --schema schema.json
//!
//! # Show the persisted schema map
//! oxide-db show-schema
//!
//! # Inspect and clear advisory locks
//! oxide-db locks
//! oxide-db unlock --all
//! ```

pub mod backend;
pub mod bind;
pub mod database;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod identifier;
pub mod lock;
pub mod options;
pub mod resolver;
pub mod schema;
pub mod sync;
pub mod transaction;
pub mod value;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{
        Backend, ConnectionConfig, D1Backend, D1Binding, PostgresBackend, SqliteBackend,
        Transaction, TransactionMode,
    };
    pub use crate::database::{Database, DatabaseOptions};
    pub use crate::dialect::{Dialect, DialectKind};
    pub use crate::error::{DbError, Result};
    pub use crate::executor::{BoxFuture, Executor, QueryResult, Timed};
    pub use crate::lock::{LockInfo, LockOptions};
    pub use crate::params;
    pub use crate::resolver::{resolve, ResolvedSchema, SchemaMap};
    pub use crate::schema::{
        CollectionDefinition, DataType, FieldDefinition, ForeignKeyAction, ForeignKeyDefinition,
        IndexDefinition, Schema,
    };
    pub use crate::sync::{SyncOptions, SyncOutcome};
    pub use crate::value::{Params, Row, Value};
}
