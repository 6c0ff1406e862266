//! Declarative schema description.
//!
//! These types describe what the application expects the store to look like:
//! collections with fields, indexes and foreign keys. Each collection and
//! field has a physical name (table / column) and an optional logical key
//! that stays stable across renames.
//!
//! ```ignore
//! let schema = Schema::new()
//!     .collection(
//!         CollectionDefinition::new("Users")
//!             .field(FieldDefinition::new("email", DataType::Text).required())
//!             .field(FieldDefinition::new("role", DataType::Text))
//!             .index(IndexDefinition::unique(["email"])),
//!     );
//! ```

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Column data types managed by the synchronization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 64-bit integer.
    BigInt,
    /// Boolean.
    Boolean,
    /// Arbitrary precision number.
    Numeric,
    /// Text.
    Text,
}

impl DataType {
    /// The value used to backfill rows when a column becomes NOT NULL.
    #[must_use]
    pub fn zero_value(self) -> Value {
        match self {
            Self::BigInt => Value::Int(0),
            Self::Boolean => Value::Bool(false),
            Self::Numeric => Value::Float(0.0),
            Self::Text => Value::Text(String::new()),
        }
    }

    /// Returns whether `value` can be stored in a column of this type.
    ///
    /// NULL fits every type; integers also fit numeric columns.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::BigInt, Value::Int(_)) | (Self::Boolean, Value::Bool(_)) => true,
            (Self::Numeric, Value::Int(_)) => true,
            (Self::Numeric, Value::Float(f)) => f.is_finite(),
            (Self::Text, Value::Text(_)) => true,
            _ => false,
        }
    }

    /// Returns whether a column can be converted in place without data loss.
    ///
    /// Anything converts to text, and integers widen to numeric.
    #[must_use]
    pub fn converts_in_place(from: Self, to: Self) -> bool {
        from == to || to == Self::Text || (from == Self::BigInt && to == Self::Numeric)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::BigInt => "bigint",
            Self::Boolean => "boolean",
            Self::Numeric => "numeric",
            Self::Text => "text",
        })
    }
}

/// Foreign key action (ON DELETE, ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted/updated).
    #[default]
    NoAction,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Cascade the delete/update to referencing rows.
    Cascade,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// A field of a collection, stored as one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Physical column name.
    pub name: String,
    /// Logical key; defaults to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Column data type.
    #[serde(rename = "dataType", alias = "data_type")]
    pub data_type: DataType,
    /// Whether the column allows NULL values.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Value written into existing rows when the column becomes NOT NULL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_nullable() -> bool {
    true
}

impl FieldDefinition {
    /// Creates a nullable field.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            key: None,
            data_type,
            nullable: true,
            default: None,
        }
    }

    /// Sets a logical key distinct from the column name.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Marks the field as NOT NULL.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the backfill value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// The logical key (explicit key or the name).
    #[must_use]
    pub fn resolved_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

/// An index over one or more fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Field names (physical column names) in index order.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    /// Creates a non-unique index.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Creates a unique index.
    pub fn unique<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unique: true,
            ..Self::new(fields)
        }
    }
}

/// A foreign key from one field to a field of another collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDefinition {
    /// Source field name.
    pub field: String,
    /// Referenced collection name.
    #[serde(rename = "referencedCollection", alias = "referenced_collection")]
    pub referenced_collection: String,
    /// Referenced field name; `id` when omitted.
    #[serde(
        rename = "referencedField",
        alias = "referenced_field",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub referenced_field: Option<String>,
    /// ON DELETE action.
    #[serde(rename = "action", alias = "on_delete", default)]
    pub on_delete: ForeignKeyAction,
    /// ON UPDATE action.
    #[serde(rename = "onUpdate", alias = "on_update", default)]
    pub on_update: ForeignKeyAction,
}

impl ForeignKeyDefinition {
    /// Creates a foreign key referencing `collection.id`.
    #[must_use]
    pub fn new(field: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            referenced_collection: collection.into(),
            referenced_field: None,
            on_delete: ForeignKeyAction::default(),
            on_update: ForeignKeyAction::default(),
        }
    }

    /// References a field other than `id`.
    #[must_use]
    pub fn references(mut self, field: impl Into<String>) -> Self {
        self.referenced_field = Some(field.into());
        self
    }

    /// Sets the ON DELETE action.
    #[must_use]
    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Sets the ON UPDATE action.
    #[must_use]
    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }
}

/// A collection, stored as one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    /// Physical table name.
    pub name: String,
    /// Logical key; defaults to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Foreign keys.
    #[serde(default, rename = "foreignKeys", alias = "foreign_keys")]
    pub foreign_keys: Vec<ForeignKeyDefinition>,
}

impl CollectionDefinition {
    /// Creates an empty collection.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            fields: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Sets a logical key distinct from the table name.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKeyDefinition) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// The logical key (explicit key or the name).
    #[must_use]
    pub fn resolved_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }

    /// Gets a field by physical name.
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The complete schema description, collections in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// All collections.
    #[serde(default)]
    pub collections: Vec<CollectionDefinition>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collection.
    #[must_use]
    pub fn collection(mut self, collection: CollectionDefinition) -> Self {
        self.collections.push(collection);
        self
    }

    /// Gets a collection by physical name.
    #[must_use]
    pub fn get_collection(&self, name: &str) -> Option<&CollectionDefinition> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Parses a schema from its JSON representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
