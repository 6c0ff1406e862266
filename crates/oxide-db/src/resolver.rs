//! Identifier and schema-map resolution.
//!
//! Turns a declarative [`Schema`] into a validated [`ResolvedSchema`]: the
//! collections in foreign-key dependency order plus the canonical
//! [`SchemaMap`] that is persisted after every synchronization and compared
//! on the next one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::identifier::{validate_generated, validate_key, validate_name};
use crate::options::OPTIONS_TABLE;
use crate::schema::{DataType, ForeignKeyAction, Schema};
use crate::value::Value;

/// Reserved primary key column present in every table.
pub const ID_COLUMN: &str = "id";

/// Persisted description of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    /// Physical column name.
    pub column: String,
    /// Column data type.
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

/// Persisted description of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMap {
    /// Physical table name.
    pub table: String,
    /// Fields by logical key.
    pub fields: BTreeMap<String, FieldMap>,
    /// Index signatures.
    pub indexes: Vec<String>,
    /// Foreign key signatures.
    #[serde(rename = "foreignKeys")]
    pub foreign_keys: Vec<String>,
}

/// Canonical mapping from collection keys to physical structure.
///
/// Keys are ordered, so the JSON encoding is stable and two maps compare
/// structurally regardless of declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMap {
    collections: BTreeMap<String, CollectionMap>,
}

impl SchemaMap {
    /// Looks up a collection by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CollectionMap> {
        self.collections.get(key)
    }

    /// Iterates over `(key, collection)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CollectionMap)> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// Returns true if no collection is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Encodes the map as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a persisted map.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// An index ready to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name, which is also its signature.
    pub name: String,
    /// Table the index belongs to.
    pub table: String,
    /// Indexed columns in order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub unique: bool,
}

impl IndexSpec {
    fn new(table: &str, columns: Vec<String>, unique: bool) -> Self {
        let prefix = if unique { "uidx" } else { "idx" };
        Self {
            name: format!("{prefix}__{table}__{}", columns.join("__")),
            table: table.to_string(),
            columns,
            unique,
        }
    }
}

/// A foreign key ready to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeySpec {
    /// Constraint name.
    pub name: String,
    /// Source table.
    pub table: String,
    /// Source column.
    pub column: String,
    /// Referenced table.
    pub referenced_table: String,
    /// Referenced column.
    pub referenced_column: String,
    /// ON DELETE action.
    pub on_delete: ForeignKeyAction,
    /// ON UPDATE action.
    pub on_update: ForeignKeyAction,
}

impl ForeignKeySpec {
    /// Deterministic signature; changes whenever the target or actions do.
    #[must_use]
    pub fn signature(&self) -> String {
        format!(
            "{} -> {}({}) ON DELETE {} ON UPDATE {}",
            self.name,
            self.referenced_table,
            self.referenced_column,
            self.on_delete.to_sql(),
            self.on_update.to_sql()
        )
    }
}

/// A validated field.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField {
    /// Logical key.
    pub key: String,
    /// Physical column name.
    pub column: String,
    /// Column data type.
    pub data_type: DataType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Declared backfill value.
    pub default: Option<Value>,
}

impl ResolvedField {
    /// Value written into NULL cells before the column becomes NOT NULL.
    #[must_use]
    pub fn backfill_value(&self) -> Value {
        self.default
            .clone()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| self.data_type.zero_value())
    }
}

/// A validated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCollection {
    /// Logical key.
    pub key: String,
    /// Physical table name.
    pub table: String,
    /// Fields in declaration order.
    pub fields: Vec<ResolvedField>,
    /// Indexes to create.
    pub indexes: Vec<IndexSpec>,
    /// Foreign keys to create.
    pub foreign_keys: Vec<ForeignKeySpec>,
}

impl ResolvedCollection {
    /// Looks up a field by physical column name.
    #[must_use]
    pub fn field_by_column(&self, column: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.column == column)
    }
}

/// The validated schema: collections in dependency order plus the map.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSchema {
    collections: Vec<ResolvedCollection>,
    map: SchemaMap,
}

impl ResolvedSchema {
    /// Collections ordered so referenced collections come first.
    #[must_use]
    pub fn collections(&self) -> &[ResolvedCollection] {
        &self.collections
    }

    /// The canonical schema map.
    #[must_use]
    pub fn map(&self) -> &SchemaMap {
        &self.map
    }

    /// Looks up a collection by key.
    #[must_use]
    pub fn collection(&self, key: &str) -> Option<&ResolvedCollection> {
        self.collections.iter().find(|c| c.key == key)
    }
}

/// Validates a schema description and builds its resolved form.
///
/// Any invalid identifier, duplicate, or dangling reference is fatal.
pub fn resolve(schema: &Schema) -> Result<ResolvedSchema> {
    let mut collection_keys = BTreeSet::new();
    let mut tables = BTreeSet::new();
    let mut collections = Vec::with_capacity(schema.collections.len());

    // First pass: collections and fields.
    for definition in &schema.collections {
        let table = definition.name.as_str();
        let key = definition.resolved_key();
        validate_name("table", table)?;
        validate_key("collection key", key)?;
        if table == OPTIONS_TABLE {
            return Err(DbError::config(format!(
                "collection name {table:?} is reserved"
            )));
        }
        if !collection_keys.insert(key.to_string()) {
            return Err(DbError::config(format!("duplicate collection key {key:?}")));
        }
        if !tables.insert(table.to_string()) {
            return Err(DbError::config(format!("duplicate collection name {table:?}")));
        }

        let mut field_keys = BTreeSet::new();
        let mut columns = BTreeSet::new();
        let mut fields = Vec::with_capacity(definition.fields.len());
        for field in &definition.fields {
            let field_key = field.resolved_key();
            validate_name("column", &field.name)?;
            validate_key("field key", field_key)?;
            if field_key == ID_COLUMN || field.name == ID_COLUMN {
                return Err(DbError::config(format!(
                    "field {:?} in {table:?} uses the reserved name \"id\"",
                    field.name
                )));
            }
            if !field_keys.insert(field_key.to_string()) || !columns.insert(field.name.clone()) {
                return Err(DbError::config(format!(
                    "duplicate field {:?} in {table:?}",
                    field.name
                )));
            }
            if let Some(default) = &field.default {
                if !field.data_type.accepts(default) {
                    return Err(DbError::config(format!(
                        "default {default:?} of field {:?} in {table:?} is not a {} value",
                        field.name, field.data_type
                    )));
                }
            }
            fields.push(ResolvedField {
                key: field_key.to_string(),
                column: field.name.clone(),
                data_type: field.data_type,
                nullable: field.nullable,
                default: field.default.clone(),
            });
        }

        collections.push(ResolvedCollection {
            key: key.to_string(),
            table: table.to_string(),
            fields,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        });
    }

    // Second pass: indexes and foreign keys, which may refer to any collection.
    let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); collections.len()];
    for (position, definition) in schema.collections.iter().enumerate() {
        let table = definition.name.as_str();

        let mut indexes: Vec<IndexSpec> = Vec::new();
        for index in &definition.indexes {
            if index.fields.is_empty() {
                return Err(DbError::config(format!("index on {table:?} has no fields")));
            }
            for field in &index.fields {
                if collections[position].field_by_column(field).is_none() {
                    return Err(DbError::config(format!(
                        "index on {table:?} references unknown field {field:?}"
                    )));
                }
            }
            let spec = IndexSpec::new(table, index.fields.clone(), index.unique);
            validate_generated("index name", &spec.name)?;
            if !indexes.contains(&spec) {
                indexes.push(spec);
            }
        }

        let mut foreign_keys: Vec<ForeignKeySpec> = Vec::new();
        for fk in &definition.foreign_keys {
            if collections[position].field_by_column(&fk.field).is_none() {
                return Err(DbError::config(format!(
                    "foreign key on {table:?} references unknown field {:?}",
                    fk.field
                )));
            }
            let target = schema
                .collections
                .iter()
                .position(|c| c.name == fk.referenced_collection)
                .ok_or_else(|| {
                    DbError::config(format!(
                        "foreign key {table}.{} references unknown collection {:?}",
                        fk.field, fk.referenced_collection
                    ))
                })?;
            let referenced_column = fk.referenced_field.as_deref().unwrap_or(ID_COLUMN);
            if referenced_column != ID_COLUMN
                && collections[target].field_by_column(referenced_column).is_none()
            {
                return Err(DbError::config(format!(
                    "foreign key {table}.{} references unknown field {}.{referenced_column}",
                    fk.field, fk.referenced_collection
                )));
            }
            if foreign_keys.iter().any(|existing| existing.column == fk.field) {
                return Err(DbError::config(format!(
                    "duplicate foreign key on {table}.{}",
                    fk.field
                )));
            }
            if target != position {
                dependencies[position].insert(target);
            }
            let name = format!("fk__{table}__{}", fk.field);
            validate_generated("foreign key name", &name)?;
            foreign_keys.push(ForeignKeySpec {
                name,
                table: table.to_string(),
                column: fk.field.clone(),
                referenced_table: collections[target].table.clone(),
                referenced_column: referenced_column.to_string(),
                on_delete: fk.on_delete,
                on_update: fk.on_update,
            });
        }

        collections[position].indexes = indexes;
        collections[position].foreign_keys = foreign_keys;
    }

    let order = dependency_order(&collections, &dependencies);
    let mut slots: Vec<Option<ResolvedCollection>> = collections.into_iter().map(Some).collect();
    let collections: Vec<ResolvedCollection> = order
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect();

    let map = SchemaMap {
        collections: collections.iter().map(|c| (c.key.clone(), map_collection(c))).collect(),
    };

    Ok(ResolvedSchema { collections, map })
}

/// Orders collections so every referenced collection precedes its referrers.
///
/// Ties are broken by declaration order. Cycles cannot be satisfied; they are
/// broken by releasing the earliest-declared blocked collection.
fn dependency_order(
    collections: &[ResolvedCollection],
    dependencies: &[BTreeSet<usize>],
) -> Vec<usize> {
    let mut emitted = vec![false; collections.len()];
    let mut order = Vec::with_capacity(collections.len());

    while order.len() < collections.len() {
        let ready = (0..collections.len())
            .find(|&i| !emitted[i] && dependencies[i].iter().all(|&d| emitted[d]));
        let next = match ready {
            Some(i) => i,
            None => {
                let Some(blocked) = (0..collections.len()).find(|&i| !emitted[i]) else {
                    break;
                };
                debug!(
                    collection = %collections[blocked].key,
                    "Breaking foreign key cycle"
                );
                blocked
            }
        };
        emitted[next] = true;
        order.push(next);
    }
    order
}

fn map_collection(collection: &ResolvedCollection) -> CollectionMap {
    CollectionMap {
        table: collection.table.clone(),
        fields: collection
            .fields
            .iter()
            .map(|f| {
                (
                    f.key.clone(),
                    FieldMap {
                        column: f.column.clone(),
                        data_type: f.data_type,
                        nullable: f.nullable,
                    },
                )
            })
            .collect(),
        indexes: collection.indexes.iter().map(|i| i.name.clone()).collect(),
        foreign_keys: collection.foreign_keys.iter().map(ForeignKeySpec::signature).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionDefinition, FieldDefinition, ForeignKeyDefinition, IndexDefinition};

    fn users() -> CollectionDefinition {
        CollectionDefinition::new("Users")
            .field(FieldDefinition::new("email", DataType::Text).required())
            .field(FieldDefinition::new("role", DataType::Text))
            .index(IndexDefinition::unique(["email"]))
    }

    fn referencing(name: &str, target: &str) -> CollectionDefinition {
        CollectionDefinition::new(name)
            .field(FieldDefinition::new("parent", DataType::BigInt))
            .foreign_key(ForeignKeyDefinition::new("parent", target))
    }

    fn order(resolved: &ResolvedSchema) -> Vec<&str> {
        resolved.collections().iter().map(|c| c.table.as_str()).collect()
    }

    #[test]
    fn test_users_map() {
        let resolved = resolve(&Schema::new().collection(users())).unwrap();
        let users = resolved.map().get("Users").unwrap();
        assert_eq!(users.table, "Users");
        assert_eq!(users.indexes, vec!["uidx__Users__email".to_string()]);
        assert_eq!(
            users.fields["email"],
            FieldMap {
                column: "email".into(),
                data_type: DataType::Text,
                nullable: false,
            }
        );
        assert!(users.fields["role"].nullable);
    }

    #[test]
    fn test_map_json_is_stable() {
        let a = resolve(&Schema::new().collection(users()).collection(referencing("Posts", "Users")))
            .unwrap();
        let b = resolve(&Schema::new().collection(referencing("Posts", "Users")).collection(users()))
            .unwrap();
        assert_eq!(a.map(), b.map());
        assert_eq!(a.map().to_json().unwrap(), b.map().to_json().unwrap());

        let json = a.map().to_json().unwrap();
        assert!(json.contains(r#""dataType":"text""#));
        assert_eq!(SchemaMap::from_json(&json).unwrap(), *a.map());
    }

    #[test]
    fn test_keys_are_independent_of_names() {
        let resolved = resolve(
            &Schema::new().collection(
                CollectionDefinition::new("people")
                    .key("Users")
                    .field(FieldDefinition::new("email", DataType::Text).key("emailAddress")),
            ),
        )
        .unwrap();
        let users = resolved.map().get("Users").unwrap();
        assert_eq!(users.table, "people");
        assert_eq!(users.fields["emailAddress"].column, "email");
    }

    #[test]
    fn test_foreign_key_signature() {
        let resolved = resolve(
            &Schema::new().collection(users()).collection(
                CollectionDefinition::new("Posts")
                    .field(FieldDefinition::new("author", DataType::BigInt))
                    .foreign_key(
                        ForeignKeyDefinition::new("author", "Users")
                            .on_delete(ForeignKeyAction::Cascade),
                    ),
            ),
        )
        .unwrap();
        assert_eq!(
            resolved.map().get("Posts").unwrap().foreign_keys,
            vec!["fk__Posts__author -> Users(id) ON DELETE CASCADE ON UPDATE NO ACTION".to_string()]
        );
    }

    #[test]
    fn test_topological_order() {
        // C -> B -> A, declared in reverse.
        let schema = Schema::new()
            .collection(referencing("C", "B"))
            .collection(referencing("B", "A"))
            .collection(CollectionDefinition::new("A"));
        assert_eq!(order(&resolve(&schema).unwrap()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_independent_collections_keep_declaration_order() {
        let schema = Schema::new()
            .collection(CollectionDefinition::new("Zeta"))
            .collection(referencing("Posts", "Users"))
            .collection(users())
            .collection(CollectionDefinition::new("Alpha"));
        assert_eq!(
            order(&resolve(&schema).unwrap()),
            vec!["Zeta", "Users", "Posts", "Alpha"]
        );
    }

    #[test]
    fn test_cycles_and_self_references_resolve() {
        let schema = Schema::new()
            .collection(referencing("A", "B"))
            .collection(referencing("B", "A"))
            .collection(referencing("Tree", "Tree"));
        // Tree only references itself, so it is ready before the cycle is broken.
        assert_eq!(order(&resolve(&schema).unwrap()), vec!["Tree", "A", "B"]);
    }

    #[test]
    fn test_reserved_id_field() {
        let err = resolve(&Schema::new().collection(
            CollectionDefinition::new("Users").field(FieldDefinition::new("id", DataType::BigInt)),
        ))
        .unwrap_err();
        assert!(matches!(err, DbError::Config(_)));

        let err = resolve(&Schema::new().collection(
            CollectionDefinition::new("Users")
                .field(FieldDefinition::new("user_id", DataType::BigInt).key("id")),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = resolve(
            &Schema::new()
                .collection(CollectionDefinition::new("A").key("shared"))
                .collection(CollectionDefinition::new("B").key("shared")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate collection key"));

        let err = resolve(&Schema::new().collection(
            CollectionDefinition::new("A")
                .field(FieldDefinition::new("x", DataType::Text))
                .field(FieldDefinition::new("y", DataType::Text).key("x")),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate field"));
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        for name in ["bad name", "double__underscore", "1st"] {
            let err = resolve(&Schema::new().collection(CollectionDefinition::new(name))).unwrap_err();
            assert!(matches!(err, DbError::InvalidIdentifier { .. }), "{name}");
        }
        let err = resolve(&Schema::new().collection(CollectionDefinition::new("Options"))).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_dangling_references_rejected() {
        let err = resolve(&Schema::new().collection(
            CollectionDefinition::new("Users").index(IndexDefinition::new(["missing"])),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));

        let err = resolve(&Schema::new().collection(referencing("Posts", "Nowhere"))).unwrap_err();
        assert!(err.to_string().contains("unknown collection"));

        let err = resolve(
            &Schema::new().collection(users()).collection(
                CollectionDefinition::new("Posts")
                    .field(FieldDefinition::new("author", DataType::Text))
                    .foreign_key(ForeignKeyDefinition::new("author", "Users").references("nickname")),
            ),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Users.nickname"));
    }

    #[test]
    fn test_long_generated_names_rejected() {
        let table = format!("Archive{}", "x".repeat(30));
        let column = format!("reference{}", "y".repeat(20));
        let indexed = CollectionDefinition::new(table.as_str())
            .field(FieldDefinition::new(column.as_str(), DataType::BigInt))
            .index(IndexDefinition::unique([column.as_str()]));
        let err = resolve(&Schema::new().collection(indexed)).unwrap_err();
        match err {
            DbError::InvalidIdentifier { kind, name, .. } => {
                assert_eq!(kind, "index name");
                assert!(name.starts_with("uidx__Archive"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let referencing = CollectionDefinition::new(table.as_str())
            .field(FieldDefinition::new(column.as_str(), DataType::BigInt))
            .foreign_key(ForeignKeyDefinition::new(column.as_str(), table.as_str()));
        let err = resolve(&Schema::new().collection(referencing)).unwrap_err();
        assert!(matches!(err, DbError::InvalidIdentifier { kind: "foreign key name", .. }));
    }

    #[test]
    fn test_mismatched_default_rejected() {
        let err = resolve(&Schema::new().collection(
            CollectionDefinition::new("Counters")
                .field(FieldDefinition::new("hits", DataType::BigInt).default("none")),
        ))
        .unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
        assert!(err.to_string().contains("not a bigint value"));

        let resolved = resolve(&Schema::new().collection(
            CollectionDefinition::new("Counters")
                .field(FieldDefinition::new("ratio", DataType::Numeric).default(2))
                .field(FieldDefinition::new("label", DataType::Text).default(Value::Null)),
        ));
        assert!(resolved.is_ok());
    }

    #[test]
    fn test_backfill_value() {
        let field = |default: Option<Value>| ResolvedField {
            key: "n".into(),
            column: "n".into(),
            data_type: DataType::BigInt,
            nullable: false,
            default,
        };
        assert_eq!(field(None).backfill_value(), Value::Int(0));
        assert_eq!(field(Some(Value::Int(7))).backfill_value(), Value::Int(7));
        assert_eq!(field(Some(Value::Null)).backfill_value(), Value::Int(0));
    }
}
