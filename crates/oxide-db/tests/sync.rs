mod common;

use std::time::Duration;

use common::{column, column_names, connect, indexes, memory_pool, tables, values};
use oxide_db::prelude::*;

fn users() -> Schema {
    Schema::new().collection(
        CollectionDefinition::new("Users")
            .field(FieldDefinition::new("email", DataType::Text).required())
            .field(FieldDefinition::new("role", DataType::Text))
            .index(IndexDefinition::unique(["email"])),
    )
}

#[tokio::test]
async fn test_users_scenario() {
    let pool = memory_pool().await;
    let (db, outcome) = connect(&pool, &users(), DatabaseOptions::new()).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);

    assert_eq!(column_names(&db, "Users").await, ["id", "email", "role"]);
    assert!(!column(&db, "Users", "email").await.nullable);
    assert!(column(&db, "Users", "role").await.nullable);

    let idx = indexes(&db, "Users").await;
    assert_eq!(idx.len(), 1);
    assert_eq!(idx[0].name, "uidx__Users__email");
    assert!(idx[0].unique);

    let persisted = db.persisted_schema_map().await.unwrap().unwrap();
    assert_eq!(&persisted, db.schema_map());
    let users = persisted.get("Users").unwrap();
    assert_eq!(users.table, "Users");
    assert_eq!(users.fields["email"].column, "email");
    assert!(!users.fields["email"].nullable);
    assert_eq!(users.indexes, ["uidx__Users__email"]);

    db.execute(
        r#"INSERT INTO "Users" ("email") VALUES ($email)"#,
        &params! { "email" => "ada@example.com" },
    )
    .await
    .unwrap();
    let duplicate = db
        .execute(
            r#"INSERT INTO "Users" ("email") VALUES ($email)"#,
            &params! { "email" => "ada@example.com" },
        )
        .await;
    assert!(matches!(duplicate, Err(DbError::Query { .. })));
}

#[tokio::test]
async fn test_second_sync_is_unchanged() {
    let pool = memory_pool().await;
    let (first, _) = connect(&pool, &users(), DatabaseOptions::new()).await;
    assert_eq!(first.sync().await.unwrap(), SyncOutcome::Unchanged);

    let (second, outcome) = connect(&pool, &users(), DatabaseOptions::new()).await;
    assert_eq!(outcome, SyncOutcome::Unchanged);
    assert!(!second.is_locked("sync").await.unwrap());
}

fn pair(alpha_key: &str, beta_key: &str) -> Schema {
    let table = |name: &str, key: &str| {
        CollectionDefinition::new(name)
            .key(key)
            .field(FieldDefinition::new("label", DataType::Text))
            .index(IndexDefinition::new(["label"]))
    };
    Schema::new()
        .collection(table("Alpha", alpha_key))
        .collection(table("Beta", beta_key))
}

#[tokio::test]
async fn test_table_swap_keeps_data_and_indexes() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &pair("a", "b"), DatabaseOptions::new()).await;
    db.execute(r#"INSERT INTO "Alpha" ("label") VALUES ('from a')"#, &params! {})
        .await
        .unwrap();
    db.execute(r#"INSERT INTO "Beta" ("label") VALUES ('from b')"#, &params! {})
        .await
        .unwrap();

    // Key "a" now lives in Beta, key "b" in Alpha.
    let (db, outcome) = connect(&pool, &pair("b", "a"), DatabaseOptions::new()).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);

    let mut live = tables(&db).await;
    live.sort();
    assert_eq!(live, ["Alpha", "Beta", "Options"]);
    assert_eq!(values(&db, "Beta", "label").await, [Value::from("from a")]);
    assert_eq!(values(&db, "Alpha", "label").await, [Value::from("from b")]);

    let names: Vec<String> = indexes(&db, "Beta").await.into_iter().map(|i| i.name).collect();
    assert_eq!(names, ["idx__Beta__label"]);
    let names: Vec<String> = indexes(&db, "Alpha").await.into_iter().map(|i| i.name).collect();
    assert_eq!(names, ["idx__Alpha__label"]);
}

#[tokio::test]
async fn test_rename_onto_dropped_table() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &pair("a", "b"), DatabaseOptions::new()).await;
    db.execute(r#"INSERT INTO "Alpha" ("label") VALUES ('from a')"#, &params! {})
        .await
        .unwrap();
    db.execute(r#"INSERT INTO "Beta" ("label") VALUES ('from b')"#, &params! {})
        .await
        .unwrap();

    // Key "a" moves into Beta and key "b" goes away.
    let moved = Schema::new().collection(
        CollectionDefinition::new("Beta")
            .key("a")
            .field(FieldDefinition::new("label", DataType::Text))
            .index(IndexDefinition::new(["label"])),
    );
    let db = Database::new(pool.clone(), &moved, DatabaseOptions::new()).unwrap();
    assert!(matches!(db.connect().await, Err(DbError::Sync(_))));

    let options = DatabaseOptions::new().with_sync(SyncOptions::new().with_drop_tables(true));
    let (db, outcome) = connect(&pool, &moved, options).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);

    let mut live = tables(&db).await;
    live.sort();
    assert_eq!(live, ["Beta", "Options"]);
    assert_eq!(values(&db, "Beta", "label").await, [Value::from("from a")]);
    let names: Vec<String> = indexes(&db, "Beta").await.into_iter().map(|i| i.name).collect();
    assert_eq!(names, ["idx__Beta__label"]);
    assert_eq!(db.sync().await.unwrap(), SyncOutcome::Unchanged);
}

#[tokio::test]
async fn test_column_rename_onto_dropped_column() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &users(), DatabaseOptions::new()).await;
    db.execute(
        r#"INSERT INTO "Users" ("email", "role") VALUES ('a@b.c', 'admin')"#,
        &params! {},
    )
    .await
    .unwrap();

    // The "email" field takes over the "role" column name.
    let schema = Schema::new().collection(
        CollectionDefinition::new("Users")
            .field(FieldDefinition::new("role", DataType::Text).key("email").required()),
    );
    let options = DatabaseOptions::new().with_sync(SyncOptions::new().with_drop_columns(true));
    let (db, outcome) = connect(&pool, &schema, options).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(column_names(&db, "Users").await, ["id", "role"]);
    assert_eq!(values(&db, "Users", "role").await, [Value::from("a@b.c")]);
    assert!(!column(&db, "Users", "role").await.nullable);
}

fn metrics(amount: DataType, flag: DataType) -> Schema {
    Schema::new().collection(
        CollectionDefinition::new("Metrics")
            .field(FieldDefinition::new("amount", amount))
            .field(FieldDefinition::new("flag", flag)),
    )
}

#[tokio::test]
async fn test_type_changes() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &metrics(DataType::BigInt, DataType::BigInt), DatabaseOptions::new()).await;
    db.execute(
        r#"INSERT INTO "Metrics" ("amount", "flag") VALUES ($amount, $flag)"#,
        &params! { "amount" => 42, "flag" => 7 },
    )
    .await
    .unwrap();

    let (db, outcome) = connect(&pool, &metrics(DataType::Numeric, DataType::Boolean), DatabaseOptions::new()).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);

    // bigint -> numeric converts in place.
    assert_eq!(column(&db, "Metrics", "amount").await.native_type, "NUMERIC");
    assert_eq!(values(&db, "Metrics", "amount").await, [Value::Int(42)]);

    // bigint -> boolean is recreated, so old values are gone.
    assert_eq!(column(&db, "Metrics", "flag").await.native_type, "BOOLEAN");
    assert_eq!(values(&db, "Metrics", "flag").await, [Value::Null]);
}

#[tokio::test]
async fn test_required_column_on_populated_table_is_backfilled() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &users(), DatabaseOptions::new()).await;
    db.execute(r#"INSERT INTO "Users" ("email") VALUES ('a@b.c')"#, &params! {})
        .await
        .unwrap();

    let schema = Schema::new().collection(
        CollectionDefinition::new("Users")
            .field(FieldDefinition::new("email", DataType::Text).required())
            .field(FieldDefinition::new("role", DataType::Text).required().default("member"))
            .field(FieldDefinition::new("logins", DataType::BigInt).required())
            .index(IndexDefinition::unique(["email"])),
    );
    let (db, _) = connect(&pool, &schema, DatabaseOptions::new()).await;

    assert!(!column(&db, "Users", "role").await.nullable);
    assert!(!column(&db, "Users", "logins").await.nullable);
    assert_eq!(values(&db, "Users", "role").await, [Value::from("member")]);
    assert_eq!(values(&db, "Users", "logins").await, [Value::Int(0)]);
    assert_eq!(indexes(&db, "Users").await.len(), 1);
}

#[tokio::test]
async fn test_field_key_rename_keeps_column() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &users(), DatabaseOptions::new()).await;
    db.execute(r#"INSERT INTO "Users" ("email") VALUES ('a@b.c')"#, &params! {})
        .await
        .unwrap();

    let schema = Schema::new().collection(
        CollectionDefinition::new("Users")
            .field(FieldDefinition::new("email", DataType::Text).key("emailAddress").required())
            .field(FieldDefinition::new("role", DataType::Text))
            .index(IndexDefinition::unique(["email"])),
    );
    let (db, outcome) = connect(&pool, &schema, DatabaseOptions::new()).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(column_names(&db, "Users").await, ["id", "email", "role"]);
    assert_eq!(values(&db, "Users", "email").await, [Value::from("a@b.c")]);
    let persisted = db.persisted_schema_map().await.unwrap().unwrap();
    assert_eq!(persisted.get("Users").unwrap().fields["emailAddress"].column, "email");
}

#[tokio::test]
async fn test_column_rename_keeps_data() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &users(), DatabaseOptions::new()).await;
    db.execute(r#"INSERT INTO "Users" ("email") VALUES ('a@b.c')"#, &params! {})
        .await
        .unwrap();

    let schema = Schema::new().collection(
        CollectionDefinition::new("Users")
            .field(FieldDefinition::new("mail", DataType::Text).key("email").required())
            .field(FieldDefinition::new("role", DataType::Text))
            .index(IndexDefinition::unique(["mail"])),
    );
    let (db, _) = connect(&pool, &schema, DatabaseOptions::new()).await;
    assert_eq!(column_names(&db, "Users").await, ["id", "mail", "role"]);
    assert_eq!(values(&db, "Users", "mail").await, [Value::from("a@b.c")]);
    assert_eq!(indexes(&db, "Users").await[0].name, "uidx__Users__mail");
}

#[tokio::test]
async fn test_drop_undeclared_tables_and_columns() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &users(), DatabaseOptions::new()).await;
    db.execute(r#"CREATE TABLE "Legacy" ("x" TEXT)"#, &params! {})
        .await
        .unwrap();

    let slim = Schema::new().collection(
        CollectionDefinition::new("Users").field(FieldDefinition::new("email", DataType::Text).required()),
    );

    // Non-destructive by default.
    let (db, _) = connect(&pool, &slim, DatabaseOptions::new()).await;
    assert!(tables(&db).await.contains(&"Legacy".to_string()));
    assert_eq!(column_names(&db, "Users").await, ["id", "email", "role"]);

    db.execute(r#"DELETE FROM "Options" WHERE "key" = '_schemaMap'"#, &params! {})
        .await
        .unwrap();
    let options = DatabaseOptions::new().with_sync(
        SyncOptions::new().with_drop_tables(true).with_drop_columns(true),
    );
    let (db, outcome) = connect(&pool, &slim, options).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);
    let mut live = tables(&db).await;
    live.sort();
    assert_eq!(live, ["Options", "Users"]);
    assert_eq!(column_names(&db, "Users").await, ["id", "email"]);
}

fn blog(extra_user_field: bool) -> Schema {
    let mut users = CollectionDefinition::new("Users").field(FieldDefinition::new("name", DataType::Text));
    if extra_user_field {
        users = users.field(FieldDefinition::new("active", DataType::Boolean).required());
    }
    Schema::new()
        .collection(
            CollectionDefinition::new("Posts")
                .field(FieldDefinition::new("author", DataType::BigInt))
                .foreign_key(ForeignKeyDefinition::new("author", "Users").on_delete(ForeignKeyAction::Cascade)),
        )
        .collection(users)
}

#[tokio::test]
async fn test_foreign_keys_survive_rebuilds() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &blog(false), DatabaseOptions::new()).await;
    db.execute(r#"INSERT INTO "Users" ("name") VALUES ('ada')"#, &params! {})
        .await
        .unwrap();
    db.execute(r#"INSERT INTO "Posts" ("author") VALUES (1)"#, &params! {})
        .await
        .unwrap();

    // Users is rebuilt to tighten the new column while Posts references it.
    let (db, outcome) = connect(&pool, &blog(true), DatabaseOptions::new()).await;
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(values(&db, "Users", "active").await, [Value::Bool(false)]);

    let backend = db.backend().await.unwrap();
    let keys = db.dialect().list_foreign_keys(backend.executor(), "Posts").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].column, "author");
    assert_eq!(keys[0].referenced_table, "Users");

    db.execute(r#"DELETE FROM "Users""#, &params! {}).await.unwrap();
    assert!(values(&db, "Posts", "author").await.is_empty());
}

#[tokio::test]
async fn test_failed_sync_rolls_back_and_unlocks() {
    let pool = memory_pool().await;
    let (db, _) = connect(&pool, &pair("a", "b"), DatabaseOptions::new()).await;
    db.execute(r#"CREATE TABLE "Gamma" ("x" TEXT)"#, &params! {})
        .await
        .unwrap();
    let before = db.persisted_schema_map().await.unwrap();

    // Renaming Alpha onto an unmanaged table cannot succeed.
    let clash = Schema::new().collection(
        CollectionDefinition::new("Gamma")
            .key("a")
            .field(FieldDefinition::new("label", DataType::Text)),
    );
    let db = Database::new(pool.clone(), &clash, DatabaseOptions::new()).unwrap();
    let err = db.connect().await.unwrap_err();
    assert!(matches!(err, DbError::Sync(_)), "{err}");

    assert!(!db.is_locked("sync").await.unwrap());
    assert_eq!(db.persisted_schema_map().await.unwrap(), before);
    assert_eq!(indexes(&db, "Alpha").await.len(), 1);
}

#[tokio::test]
async fn test_sync_waits_for_lock() {
    let pool = memory_pool().await;
    let holder = Database::new(pool.clone(), &users(), DatabaseOptions::new().with_sync_on_connect(false)).unwrap();
    holder.connect().await.unwrap();
    assert!(holder.lock("sync", LockOptions::default()).await.unwrap());

    let options = DatabaseOptions::new().with_sync(
        SyncOptions::new()
            .with_lock_timeout(Duration::from_millis(100))
            .with_lock_interval(Duration::from_millis(10)),
    );
    let db = Database::new(pool.clone(), &users(), options).unwrap();
    assert!(matches!(db.connect().await, Err(DbError::Sync(_))));

    holder.unlock("sync").await.unwrap();
    assert_eq!(db.sync().await.unwrap(), SyncOutcome::Synchronized);
}
