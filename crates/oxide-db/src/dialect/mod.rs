//! Database dialect implementations.
//!
//! A dialect knows the type names, DDL syntax and introspection queries of
//! one backing store. Dialects are selected once when a connection is
//! configured and shared as `&'static dyn Dialect`.

mod postgres;
mod sqlite;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use std::fmt;

use crate::bind::PlaceholderStyle;
use crate::error::Result;
use crate::executor::{BoxFuture, Executor};
use crate::identifier::{quote, quote_list};
use crate::resolver::{ForeignKeySpec, IndexSpec};
use crate::schema::DataType;
use crate::value::{Params, Value};

/// The embedded SQLite dialect.
pub static SQLITE: SqliteDialect = SqliteDialect::new(DialectKind::Sqlite);
/// The D1 edge binding dialect (SQLite syntax, no transactions).
pub static D1: SqliteDialect = SqliteDialect::new(DialectKind::D1);
/// The PostgreSQL dialect.
pub static POSTGRES: PostgresDialect = PostgresDialect;

/// The supported backing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectKind {
    /// Embedded single-file engine.
    Sqlite,
    /// Networked pooled server.
    Postgres,
    /// Stateless edge binding.
    D1,
}

impl DialectKind {
    /// Returns the shared dialect instance for this kind.
    #[must_use]
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Self::Sqlite => &SQLITE,
            Self::Postgres => &POSTGRES,
            Self::D1 => &D1,
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::D1 => "d1",
        })
    }
}

/// A live column, as reported by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Native type name as declared.
    pub native_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether the column is (part of) the primary key.
    pub primary_key: bool,
    /// Default expression, verbatim.
    pub default_sql: Option<String>,
}

/// A live index that was not created implicitly by a constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Whether the index is unique.
    pub unique: bool,
    /// The statement that recreates the index.
    pub sql: Option<String>,
}

/// A live single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyInfo {
    /// Constraint name.
    pub name: String,
    /// Source column.
    pub column: String,
    /// Referenced table.
    pub referenced_table: String,
    /// Referenced column.
    pub referenced_column: String,
}

mod private {
    pub trait Sealed {}
}

/// Database-specific DDL generation and introspection.
///
/// This trait is sealed: the engine only knows how to synchronize the stores
/// implemented in this crate.
pub trait Dialect: private::Sealed + Send + Sync + fmt::Debug {
    /// Which store this dialect targets.
    fn kind(&self) -> DialectKind;

    /// Positional placeholder syntax.
    fn placeholder(&self) -> PlaceholderStyle;

    /// Whether statements can be grouped into a transaction.
    fn supports_transactions(&self) -> bool;

    /// Native type name for a managed data type.
    fn type_name(&self, data_type: DataType) -> &'static str;

    /// Maps a native type name back to a managed data type.
    fn data_type_of(&self, native: &str) -> Option<DataType>;

    /// Whether a table belongs to the engine itself and must never be touched.
    fn is_internal_table(&self, name: &str) -> bool;

    /// Creates a table holding only the generated `id` primary key.
    fn create_table_sql(&self, table: &str) -> String;

    /// Renames a table.
    fn rename_table_sql(&self, from: &str, to: &str) -> String {
        format!("ALTER TABLE {} RENAME TO {}", quote(from), quote(to))
    }

    /// Drops a table.
    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {}", quote(table))
    }

    /// Adds a column. `default` is the value existing rows receive when the
    /// store requires one for a NOT NULL column.
    fn add_column_sql(
        &self,
        table: &str,
        column: &str,
        data_type: DataType,
        nullable: bool,
        default: &Value,
    ) -> String;

    /// Renames a column.
    fn rename_column_sql(&self, table: &str, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote(table),
            quote(from),
            quote(to)
        )
    }

    /// Drops a column.
    fn drop_column_sql(&self, table: &str, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(column))
    }

    /// Creates an index.
    fn create_index_sql(&self, index: &IndexSpec) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote(&index.name),
            quote(&index.table),
            quote_list(&index.columns)
        )
    }

    /// Drops an index.
    fn drop_index_sql(&self, name: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", quote(name))
    }

    /// Renders a value as a literal suitable for DDL and backfills.
    fn literal(&self, value: &Value) -> String {
        value.to_sql_literal()
    }

    /// Lists user tables.
    fn list_tables<'a>(&'a self, exec: &'a dyn Executor) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Lists the columns of a table in ordinal order.
    fn list_columns<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>>>;

    /// Lists explicitly created indexes of a table.
    fn list_indexes<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<IndexInfo>>>;

    /// Lists the foreign keys of a table.
    fn list_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ForeignKeyInfo>>>;

    /// Changes a column's type, converting existing values.
    fn change_column_type<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        column: &'a str,
        data_type: DataType,
    ) -> BoxFuture<'a, Result<()>>;

    /// Adds or removes a column's NOT NULL constraint.
    fn set_nullable<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        column: &'a str,
        nullable: bool,
    ) -> BoxFuture<'a, Result<()>>;

    /// Adds foreign keys to a table, replacing any existing key on the same
    /// source column.
    fn add_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        foreign_keys: &'a [ForeignKeySpec],
    ) -> BoxFuture<'a, Result<()>>;

    /// Removes every foreign key of a table.
    fn drop_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Returns whether a table holds at least one row.
pub async fn table_has_rows(exec: &dyn Executor, table: &str) -> Result<bool> {
    let sql = format!("SELECT 1 AS present FROM {} LIMIT 1", quote(table));
    let rows = exec.query(&sql, &Params::new()).await?;
    Ok(!rows.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_for_kind() {
        assert_eq!(DialectKind::Sqlite.dialect().kind(), DialectKind::Sqlite);
        assert_eq!(DialectKind::D1.dialect().kind(), DialectKind::D1);
        assert_eq!(DialectKind::Postgres.dialect().kind(), DialectKind::Postgres);
        assert!(DialectKind::Sqlite.dialect().supports_transactions());
        assert!(!DialectKind::D1.dialect().supports_transactions());
    }

    #[test]
    fn test_shared_ddl() {
        let index = IndexSpec {
            name: "uidx__Users__email".to_string(),
            table: "Users".to_string(),
            columns: vec!["email".to_string()],
            unique: true,
        };
        for dialect in [&SQLITE as &dyn Dialect, &POSTGRES] {
            assert_eq!(
                dialect.create_index_sql(&index),
                r#"CREATE UNIQUE INDEX "uidx__Users__email" ON "Users" ("email")"#
            );
            assert_eq!(
                dialect.rename_column_sql("Users", "mail", "email"),
                r#"ALTER TABLE "Users" RENAME COLUMN "mail" TO "email""#
            );
            assert_eq!(
                dialect.drop_index_sql("idx__Users__role"),
                r#"DROP INDEX IF EXISTS "idx__Users__role""#
            );
        }
    }
}
