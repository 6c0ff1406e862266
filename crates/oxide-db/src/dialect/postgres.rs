//! PostgreSQL dialect.
//!
//! PostgreSQL alters columns and constraints in place, so no operation here
//! needs a table rebuild.

use super::{private, ColumnInfo, Dialect, DialectKind, ForeignKeyInfo, IndexInfo};
use crate::bind::PlaceholderStyle;
use crate::error::Result;
use crate::executor::{BoxFuture, Executor};
use crate::identifier::quote;
use crate::params;
use crate::resolver::ForeignKeySpec;
use crate::schema::DataType;
use crate::value::Value;

/// PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl private::Sealed for PostgresDialect {}

impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn placeholder(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn type_name(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::BigInt => "BIGINT",
            DataType::Boolean => "BOOLEAN",
            DataType::Numeric => "NUMERIC",
            DataType::Text => "TEXT",
        }
    }

    fn data_type_of(&self, native: &str) -> Option<DataType> {
        match native.trim().to_ascii_lowercase().as_str() {
            "bigint" | "int8" | "integer" | "int4" | "smallint" | "int2" => Some(DataType::BigInt),
            "boolean" | "bool" => Some(DataType::Boolean),
            "numeric" | "decimal" => Some(DataType::Numeric),
            "text" => Some(DataType::Text),
            _ => None,
        }
    }

    fn is_internal_table(&self, name: &str) -> bool {
        name.starts_with("pg_")
    }

    fn create_table_sql(&self, table: &str) -> String {
        format!("CREATE TABLE {} (\"id\" BIGSERIAL PRIMARY KEY)", quote(table))
    }

    fn add_column_sql(
        &self,
        table: &str,
        column: &str,
        data_type: DataType,
        nullable: bool,
        _default: &Value,
    ) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}{}",
            quote(table),
            quote(column),
            self.type_name(data_type),
            if nullable { "" } else { " NOT NULL" }
        )
    }

    fn list_tables<'a>(&'a self, exec: &'a dyn Executor) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let rows = exec
                .query(
                    "SELECT table_name::text AS name FROM information_schema.tables
                     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'
                     ORDER BY table_name",
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
                    "SELECT c.column_name::text AS name,
                            c.data_type::text AS native_type,
                            (c.is_nullable = 'YES') AS nullable,
                            EXISTS (
                                SELECT 1 FROM information_schema.table_constraints tc
                                JOIN information_schema.key_column_usage k
                                  ON k.constraint_name = tc.constraint_name
                                 AND k.table_schema = tc.table_schema
                                WHERE tc.constraint_type = 'PRIMARY KEY'
                                  AND k.table_schema = c.table_schema
                                  AND k.table_name = c.table_name
                                  AND k.column_name = c.column_name
                            ) AS primary_key,
                            c.column_default::text AS default_sql
                     FROM information_schema.columns c
                     WHERE c.table_schema = current_schema() AND c.table_name::text = $table
                     ORDER BY c.ordinal_position",
                    &params! { "table" => table },
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| ColumnInfo {
                    name: row.get_str("name").unwrap_or_default().to_string(),
                    native_type: row.get_str("native_type").unwrap_or_default().to_string(),
                    nullable: row.get_bool("nullable").unwrap_or(true),
                    primary_key: row.get_bool("primary_key").unwrap_or(false),
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
            let rows = exec
                .query(
                    "SELECT i.relname::text AS name, ix.indisunique AS is_unique,
                            pg_get_indexdef(ix.indexrelid) AS sql
                     FROM pg_index ix
                     JOIN pg_class i ON i.oid = ix.indexrelid
                     JOIN pg_class t ON t.oid = ix.indrelid
                     JOIN pg_namespace ns ON ns.oid = t.relnamespace
                     WHERE t.relname::text = $table
                       AND ns.nspname = current_schema()
                       AND NOT ix.indisprimary
                       AND NOT EXISTS (
                           SELECT 1 FROM pg_constraint con
                           WHERE con.conindid = ix.indexrelid AND con.contype IN ('p', 'u', 'x')
                       )
                     ORDER BY i.relname",
                    &params! { "table" => table },
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| IndexInfo {
                    name: row.get_str("name").unwrap_or_default().to_string(),
                    unique: row.get_bool("is_unique").unwrap_or(false),
                    sql: row.get_str("sql").map(str::to_string),
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
                    "SELECT con.conname::text AS name,
                            att.attname::text AS column_name,
                            ref.relname::text AS referenced_table,
                            refatt.attname::text AS referenced_column
                     FROM pg_constraint con
                     JOIN pg_class cls ON cls.oid = con.conrelid
                     JOIN pg_namespace ns ON ns.oid = cls.relnamespace
                     JOIN pg_class ref ON ref.oid = con.confrelid
                     JOIN pg_attribute att
                       ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1]
                     JOIN pg_attribute refatt
                       ON refatt.attrelid = con.confrelid AND refatt.attnum = con.confkey[1]
                     WHERE con.contype = 'f'
                       AND cls.relname::text = $table
                       AND ns.nspname = current_schema()
                     ORDER BY con.conname",
                    &params! { "table" => table },
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| ForeignKeyInfo {
                    name: row.get_str("name").unwrap_or_default().to_string(),
                    column: row.get_str("column_name").unwrap_or_default().to_string(),
                    referenced_table: row.get_str("referenced_table").unwrap_or_default().to_string(),
                    referenced_column: row
                        .get_str("referenced_column")
                        .unwrap_or_default()
                        .to_string(),
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
        Box::pin(async move {
            let native = self.type_name(data_type);
            let sql = format!(
                "ALTER TABLE {} ALTER COLUMN {col} TYPE {native} USING {col}::{native}",
                quote(table),
                col = quote(column),
            );
            exec.execute(&sql, &params! {}).await?;
            Ok(())
        })
    }

    fn set_nullable<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        column: &'a str,
        nullable: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
                quote(table),
                quote(column),
                if nullable { "DROP" } else { "SET" }
            );
            exec.execute(&sql, &params! {}).await?;
            Ok(())
        })
    }

    fn add_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
        foreign_keys: &'a [ForeignKeySpec],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for fk in foreign_keys {
                let drop = format!(
                    "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                    quote(table),
                    quote(&fk.name)
                );
                exec.execute(&drop, &params! {}).await?;
                exec.execute(&add_foreign_key_sql(table, fk), &params! {})
                    .await?;
            }
            Ok(())
        })
    }

    fn drop_foreign_keys<'a>(
        &'a self,
        exec: &'a dyn Executor,
        table: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for fk in self.list_foreign_keys(exec, table).await? {
                let sql = format!(
                    "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                    quote(table),
                    quote(&fk.name)
                );
                exec.execute(&sql, &params! {}).await?;
            }
            Ok(())
        })
    }
}

fn add_foreign_key_sql(table: &str, fk: &ForeignKeySpec) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) \
         ON DELETE {} ON UPDATE {} DEFERRABLE INITIALLY IMMEDIATE",
        quote(table),
        quote(&fk.name),
        quote(&fk.column),
        quote(&fk.referenced_table),
        quote(&fk.referenced_column),
        fk.on_delete.to_sql(),
        fk.on_update.to_sql()
    )
}
