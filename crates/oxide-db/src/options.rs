//! Key/value option storage.
//!
//! Options live in a dedicated table with JSON-encoded values. Keys starting
//! with `_` are reserved for the engine's own bookkeeping (the persisted
//! schema map and advisory locks) and are only reachable through the
//! crate-internal raw functions.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DbError, Result};
use crate::executor::Executor;
use crate::params;

/// Name of the options table.
pub const OPTIONS_TABLE: &str = "Options";

/// Key under which the schema map of the last synchronization is stored.
pub const SCHEMA_MAP_KEY: &str = "_schemaMap";

const CREATE_TABLE: &str =
    r#"CREATE TABLE IF NOT EXISTS "Options" ("key" TEXT NOT NULL UNIQUE, "value" TEXT)"#;

/// Creates the options table if it does not exist.
pub async fn ensure_table(exec: &dyn Executor) -> Result<()> {
    exec.execute(CREATE_TABLE, &params! {}).await?;
    Ok(())
}

/// Reads an option value.
pub async fn get<T: DeserializeOwned>(exec: &dyn Executor, key: &str) -> Result<Option<T>> {
    check_key(key)?;
    match get_raw(exec, key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Writes an option value, replacing any previous one.
pub async fn set<T: Serialize + ?Sized>(exec: &dyn Executor, key: &str, value: &T) -> Result<()> {
    check_key(key)?;
    set_raw(exec, key, &serde_json::to_string(value)?).await
}

/// Deletes an option. Returns whether it existed.
pub async fn delete(exec: &dyn Executor, key: &str) -> Result<bool> {
    check_key(key)?;
    delete_raw(exec, key).await
}

/// Lists all user options in key order.
pub async fn list(exec: &dyn Executor) -> Result<Vec<(String, serde_json::Value)>> {
    let rows = exec
        .query(
            r#"SELECT "key", "value" FROM "Options" WHERE "key" NOT LIKE '\_%' ESCAPE '\' ORDER BY "key""#,
            &params! {},
        )
        .await?;
    rows.iter()
        .map(|row| {
            let key = row.get_str("key").unwrap_or_default().to_string();
            let value = match row.get_str("value") {
                Some(json) => serde_json::from_str(json)?,
                None => serde_json::Value::Null,
            };
            Ok((key, value))
        })
        .collect()
}

fn check_key(key: &str) -> Result<()> {
    if key.starts_with('_') {
        return Err(DbError::InvalidOptionKey(key.to_string()));
    }
    Ok(())
}

pub(crate) async fn get_raw(exec: &dyn Executor, key: &str) -> Result<Option<String>> {
    let rows = exec
        .query(
            r#"SELECT "value" FROM "Options" WHERE "key" = $key"#,
            &params! { "key" => key },
        )
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.get_str("value"))
        .map(str::to_string))
}

pub(crate) async fn set_raw(exec: &dyn Executor, key: &str, value: &str) -> Result<()> {
    exec.execute(
        r#"INSERT INTO "Options" ("key", "value") VALUES ($key, $value)
           ON CONFLICT ("key") DO UPDATE SET "value" = excluded."value""#,
        &params! { "key" => key, "value" => value },
    )
    .await?;
    Ok(())
}

/// Inserts a row unless the key exists. Returns whether the row was inserted.
pub(crate) async fn insert_raw_if_absent(exec: &dyn Executor, key: &str, value: &str) -> Result<bool> {
    let inserted = exec
        .execute(
            r#"INSERT INTO "Options" ("key", "value") VALUES ($key, $value)
               ON CONFLICT ("key") DO NOTHING"#,
            &params! { "key" => key, "value" => value },
        )
        .await?;
    Ok(inserted > 0)
}

pub(crate) async fn delete_raw(exec: &dyn Executor, key: &str) -> Result<bool> {
    let deleted = exec
        .execute(
            r#"DELETE FROM "Options" WHERE "key" = $key"#,
            &params! { "key" => key },
        )
        .await?;
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::backend::SqliteBackend;

    async fn backend() -> SqliteBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        let backend = SqliteBackend::new(pool);
        ensure_table(&backend).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let db = backend().await;
        assert_eq!(get::<String>(&db, "site").await.unwrap(), None);

        set(&db, "site", "Oxide").await.unwrap();
        set(&db, "limits", &serde_json::json!({ "max": 10 })).await.unwrap();
        set(&db, "site", "Oxide DB").await.unwrap();

        assert_eq!(get::<String>(&db, "site").await.unwrap().as_deref(), Some("Oxide DB"));
        let limits: serde_json::Value = get(&db, "limits").await.unwrap().unwrap();
        assert_eq!(limits["max"], 10);

        assert!(delete(&db, "site").await.unwrap());
        assert!(!delete(&db, "site").await.unwrap());
    }

    #[tokio::test]
    async fn test_reserved_keys() {
        let db = backend().await;
        let err = set(&db, "_schemaMap", "{}").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidOptionKey(_)));
        assert!(get::<String>(&db, "_lock:sync").await.is_err());
        assert!(delete(&db, "_x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_hides_internal_keys() {
        let db = backend().await;
        set(&db, "b", &2).await.unwrap();
        set(&db, "a", &1).await.unwrap();
        set_raw(&db, SCHEMA_MAP_KEY, "{}").await.unwrap();

        let options = list(&db).await.unwrap();
        assert_eq!(
            options,
            vec![
                ("a".to_string(), serde_json::json!(1)),
                ("b".to_string(), serde_json::json!(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let db = backend().await;
        assert!(insert_raw_if_absent(&db, "_lock:x", "now").await.unwrap());
        assert!(!insert_raw_if_absent(&db, "_lock:x", "later").await.unwrap());
        assert_eq!(get_raw(&db, "_lock:x").await.unwrap().as_deref(), Some("now"));
    }
}
