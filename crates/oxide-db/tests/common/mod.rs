#![allow(dead_code)]

use std::sync::Arc;

use oxide_db::bind::Shape;
use oxide_db::dialect::{ColumnInfo, IndexInfo};
use oxide_db::error::DriverError;
use oxide_db::executor::Statement;
use oxide_db::prelude::*;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// A single-connection in-memory SQLite pool.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("in-memory pool")
}

/// Connects a database over `pool` and returns it with the sync outcome.
pub async fn connect(pool: &SqlitePool, schema: &Schema, options: DatabaseOptions) -> (Database, SyncOutcome) {
    let db = Database::new(pool.clone(), schema, options).unwrap_or_else(|e| panic!("invalid schema: {e}"));
    let outcome = db.connect().await.unwrap_or_else(|e| panic!("connect failed: {e}"));
    (db, outcome)
}

pub async fn columns(db: &Database, table: &str) -> Vec<ColumnInfo> {
    let backend = db.backend().await.unwrap();
    db.dialect().list_columns(backend.executor(), table).await.unwrap()
}

pub async fn column_names(db: &Database, table: &str) -> Vec<String> {
    columns(db, table).await.into_iter().map(|c| c.name).collect()
}

pub async fn column(db: &Database, table: &str, name: &str) -> ColumnInfo {
    columns(db, table)
        .await
        .into_iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("column {table}.{name} missing"))
}

pub async fn indexes(db: &Database, table: &str) -> Vec<IndexInfo> {
    let backend = db.backend().await.unwrap();
    db.dialect().list_indexes(backend.executor(), table).await.unwrap()
}

pub async fn tables(db: &Database) -> Vec<String> {
    let backend = db.backend().await.unwrap();
    db.dialect().list_tables(backend.executor()).await.unwrap()
}

/// Values of one column, ordered by id.
pub async fn values(db: &Database, table: &str, column: &str) -> Vec<Value> {
    let sql = format!(r#"SELECT "{column}" AS v FROM "{table}" ORDER BY "id""#);
    db.query(&sql, &params! {})
        .await
        .unwrap()
        .iter()
        .map(|row| row.get("v").cloned().unwrap_or_default())
        .collect()
}

/// A D1 binding that forwards to an in-process SQLite backend.
pub struct SqliteBinding {
    backend: SqliteBackend,
}

impl SqliteBinding {
    pub fn new(pool: SqlitePool) -> Arc<dyn D1Binding> {
        Arc::new(Self {
            backend: SqliteBackend::new(pool),
        })
    }

    async fn statement(&self, sql: &str, params: &[Value], shape: Shape) -> std::result::Result<QueryResult, DriverError> {
        let statement = Statement {
            sql: sql.to_string(),
            params: params.to_vec(),
            shape,
        };
        self.backend.run(&statement).await
    }
}

impl D1Binding for SqliteBinding {
    fn all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, std::result::Result<Vec<Row>, DriverError>> {
        Box::pin(async move { Ok(self.statement(sql, params, Shape::Rows).await?.rows()) })
    }

    fn run<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, std::result::Result<u64, DriverError>> {
        Box::pin(async move { Ok(self.statement(sql, params, Shape::Count).await?.affected()) })
    }
}
