//! SQLite dialect, shared by the embedded backend and the D1 edge binding.
//!
//! SQLite has limited ALTER TABLE support, so changing a column's type or
//! nullability and adding or dropping foreign keys use the "table
//! recreation" strategy: create a new table, copy data, drop the old table,
//! rename the new table and replay the indexes the old table had.

use tracing::debug;

use super::{private, ColumnInfo, Dialect, DialectKind, ForeignKeyInfo, IndexInfo};
use crate::bind::PlaceholderStyle;
use crate::error::{DbError, Result};
use crate::executor::{BoxFuture, Executor};
use crate::identifier::{quote, quote_list, temporary_name};
use crate::params;
use crate::resolver::ForeignKeySpec;
use crate::schema::DataType;
use crate::value::{Row, Value};

/// SQLite dialect.
#[derive(Debug, Clone, Copy)]
pub struct SqliteDialect {
    kind: DialectKind,
}

impl SqliteDialect {
    /// Creates the dialect for the embedded engine or the D1 binding.
    #[must_use]
    pub const fn new(kind: DialectKind) -> Self {
        Self { kind }
    }

    /// Recreates a table after applying `edit` to its layout.
    async fn rebuild<F>(&self, exec: &dyn Executor, table: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut TableLayout) -> Result<()> + Send,
    {
        let mut layout = self.load_layout(exec, table).await?;
        edit(&mut layout)?;

        let temp = temporary_name();
        debug!(table = %table, temp = %temp, "Rebuilding table");

        exec.execute(&layout.create_sql(&temp), &params! {}).await?;
        let columns = layout
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>();
        let copy = format!(
            "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
            quote(&temp),
            quote(table),
            cols = quote_list(&columns)
        );
        exec.execute(&copy, &params! {}).await?;
        exec.execute(&self.drop_table_sql(table), &params! {}).await?;
        exec.execute(&self.rename_table_sql(&temp, table), &params! {})
            .await?;

        // Dropping the original table destroyed its indexes.
        for sql in &layout.indexes {
            exec.execute(sql, &params! {}).await?;
        }
        Ok(())
    }

    async fn load_layout(&self, exec: &dyn Executor, table: &str) -> Result<TableLayout> {
        let columns = self.list_columns(exec, table).await?;
        if columns.is_empty() {
            return Err(DbError::sync(format!("table {table:?} does not exist")));
        }

        let ddl = exec
            .query(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = $table",
                &params! { "table" => table },
            )
            .await?;
        let autoincrement = ddl
            .first()
            .and_then(|row| row.get_str("sql"))
            .is_some_and(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT"));

        let foreign_keys = exec
            .query(
                r#"SELECT "from" AS column_name, "table" AS referenced_table,
                       "to" AS referenced_column, on_delete, on_update
                   FROM pragma_foreign_key_list($table) ORDER BY "id", "seq""#,
                &params! { "table" => table },
            )
            .await?
            .iter()
            .map(|row| LayoutForeignKey::from_row(table, row))
            .collect();

        let indexes = self
            .list_indexes(exec, table)
            .await?
            .into_iter()
            .filter_map(|index| index.sql)
            .collect();

        Ok(TableLayout {
            columns,
            autoincrement,
            foreign_keys,
            indexes,
        })
    }
}

impl private::Sealed for SqliteDialect {}

impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        self.kind
    }

    fn placeholder(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn supports_transactions(&self) -> bool {
        self.kind == DialectKind::Sqlite
    }

    fn type_name(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::BigInt => "INTEGER",
            DataType::Boolean => "BOOLEAN",
            DataType::Numeric => "NUMERIC",
            DataType::Text => "TEXT",
        }
    }

    fn data_type_of(&self, native: &str) -> Option<DataType> {
        match native.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => Some(DataType::BigInt),
            "BOOLEAN" | "BOOL" => Some(DataType::Boolean),
            "NUMERIC" | "DECIMAL" | "REAL" => Some(DataType::Numeric),
            "TEXT" => Some(DataType::Text),
            _ => None,
        }
    }

    fn is_internal_table(&self, name: &str) -> bool {
        name.starts_with("sqlite_") || name.starts_with("_cf_")
    }

    fn create_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {} (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT)",
            quote(table)
        )
    }

    fn add_column_sql(
        &self,
        table: &str,
        column: &str,
        data_type: DataType,
        nullable: bool,
        default: &Value,
    ) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote(table),
            quote(column),
            self.type_name(data_type)
        );
        // SQLite refuses NOT NULL columns without a default.
        if !nullable {
            sql.push_str(" NOT NULL DEFAULT ");
            sql.push_str(&self.literal(default));
        }
        sql
    }

    fn list_tables<'a>(&'a self, exec: &'a dyn Executor) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let rows = exec
                .query(
                    r"SELECT name FROM sqlite_master WHERE type = 'table'
                      AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
                      AND name NOT LIKE '\_cf\_%' ESCAPE '\'
                      ORDER BY name",
                    &params! {},
                )
                .await?;
            Ok(rows
                .iter()
                .filter_map(|row| row.get_str("name").map(str::to_string))
                .collect())
        })
    }

    fn list_columns<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>>> {
        Box::pin(async move {
            let rows = exec
                .query(
                    r#"SELECT name, type AS native_type, "notnull" AS not_null, pk,
                           dflt_value AS default_sql
                       FROM pragma_table_info($table) ORDER BY cid"#,
                    &params! { "table" => table },
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| ColumnInfo {
                    name: row.get_str("name").unwrap_or_default().to_string(),
                    native_type: row.get_str("native_type").unwrap_or_default().to_string(),
                    nullable: row.get_i64("not_null") == Some(0),
                    primary_key: row.get_i64("pk").unwrap_or(0) > 0,
                    default_sql: row.get_str("default_sql").map(str::to_string),
                })
                .collect())
        })
    }

    fn list_indexes<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<IndexInfo>>> {
        Box::pin(async move {
            // Automatic indexes backing UNIQUE / PRIMARY KEY constraints have no SQL.
            let rows = exec
                .query(
                    "SELECT name, sql FROM sqlite_master
                     WHERE type = 'index' AND tbl_name = $table AND sql IS NOT NULL
                     ORDER BY name",
                    &params! { "table" => table },
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| {
                    let sql = row.get_str("sql").map(str::to_string);
                    IndexInfo {
                        name: row.get_str("name").unwrap_or_default().to_string(),
                        unique: sql
                            .as_deref()
                            .is_some_and(|s| s.trim_start().to_ascii_uppercase().starts_with("CREATE UNIQUE")),
                        sql,
                    }
                })
                .collect())
        })
    }

    fn list_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ForeignKeyInfo>>> {
        Box::pin(async move {
            let rows = exec
                .query(
                    r#"SELECT "from" AS column_name, "table" AS referenced_table,
                           "to" AS referenced_column, on_delete, on_update
                       FROM pragma_foreign_key_list($table) ORDER BY "id", "seq""#,
                    &params! { "table" => table },
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| {
                    let fk = LayoutForeignKey::from_row(table, row);
                    ForeignKeyInfo {
                        name: fk.name,
                        column: fk.column,
                        referenced_table: fk.referenced_table,
                        referenced_column: fk.referenced_column,
                    }
                })
                .collect())
        })
    }

    fn change_column_type<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        column: &'a str,
        data_type: DataType,
    ) -> BoxFuture<'a, Result<()>> {
        let native = self.type_name(data_type);
        Box::pin(self.rebuild(exec, table, move |layout| {
            layout.column_mut(table, column)?.native_type = native.to_string();
            Ok(())
        }))
    }

    fn set_nullable<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        column: &'a str,
        nullable: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.rebuild(exec, table, move |layout| {
            layout.column_mut(table, column)?.nullable = nullable;
            Ok(())
        }))
    }

    fn add_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        foreign_keys: &'a [ForeignKeySpec],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if foreign_keys.is_empty() {
                return Ok(());
            }
            self.rebuild(exec, table, move |layout| {
                for spec in foreign_keys {
                    layout.foreign_keys.retain(|fk| fk.column != spec.column);
                    layout.foreign_keys.push(LayoutForeignKey {
                        name: spec.name.clone(),
                        column: spec.column.clone(),
                        referenced_table: spec.referenced_table.clone(),
                        referenced_column: spec.referenced_column.clone(),
                        on_delete: spec.on_delete.to_sql().to_string(),
                        on_update: spec.on_update.to_sql().to_string(),
                    });
                }
                Ok(())
            })
            .await
        })
    }

    fn drop_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.list_foreign_keys(exec, table).await?.is_empty() {
                return Ok(());
            }
            self.rebuild(exec, table, |layout| {
                layout.foreign_keys.clear();
                Ok(())
            })
            .await
        })
    }
}

/// Everything needed to recreate a table.
#[derive(Debug, Clone)]
struct TableLayout {
    columns: Vec<ColumnInfo>,
    autoincrement: bool,
    foreign_keys: Vec<LayoutForeignKey>,
    indexes: Vec<String>,
}

impl TableLayout {
    fn column_mut(&mut self, table: &str, column: &str) -> Result<&mut ColumnInfo> {
        self.columns
            .iter_mut()
            .find(|c| c.name == column)
            .ok_or_else(|| DbError::sync(format!("column {column:?} does not exist in {table:?}")))
    }

    fn create_sql(&self, name: &str) -> String {
        let primary: Vec<&ColumnInfo> = self.columns.iter().filter(|c| c.primary_key).collect();
        let inline_pk = primary.len() == 1;

        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut def = quote(&column.name);
                if !column.native_type.is_empty() {
                    def.push(' ');
                    def.push_str(&column.native_type);
                }
                if column.primary_key && inline_pk {
                    def.push_str(" PRIMARY KEY");
                    if self.autoincrement {
                        def.push_str(" AUTOINCREMENT");
                    }
                } else if !column.nullable {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &column.default_sql {
                    def.push_str(" DEFAULT ");
                    def.push_str(default);
                }
                def
            })
            .collect();

        if primary.len() > 1 {
            let names: Vec<&str> = primary.iter().map(|c| c.name.as_str()).collect();
            defs.push(format!("PRIMARY KEY ({})", quote_list(&names)));
        }

        for fk in &self.foreign_keys {
            defs.push(format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
                quote(&fk.name),
                quote(&fk.column),
                quote(&fk.referenced_table),
                quote(&fk.referenced_column),
                fk.on_delete,
                fk.on_update
            ));
        }

        format!("CREATE TABLE {} ({})", quote(name), defs.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LayoutForeignKey {
    name: String,
    column: String,
    referenced_table: String,
    referenced_column: String,
    on_delete: String,
    on_update: String,
}

impl LayoutForeignKey {
    /// SQLite does not keep constraint names, so they are derived.
    fn from_row(table: &str, row: &Row) -> Self {
        let column = row.get_str("column_name").unwrap_or_default().to_string();
        Self {
            name: format!("fk__{table}__{column}"),
            referenced_table: row.get_str("referenced_table").unwrap_or_default().to_string(),
            referenced_column: row.get_str("referenced_column").unwrap_or("id").to_string(),
            on_delete: row.get_str("on_delete").unwrap_or("NO ACTION").to_string(),
            on_update: row.get_str("on_update").unwrap_or("NO ACTION").to_string(),
            column,
        }
    }
}
