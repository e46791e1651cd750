use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::UniversalType;

/// What kind of container a [`Schema`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Table,
    View,
    Partitioned,
    Collection,
    Bucket,
}

/// A reference from a column to a column of another container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub constraint_name: String,
    pub column: String,
    pub referenced_namespace: String,
    pub referenced_table: String,
    pub referenced_column: String,
    /// Referential action such as `CASCADE` or `SET NULL`.
    pub on_delete: Option<String>,
    pub on_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    pub method: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    /// One based position inside the container.
    pub ordinal_position: i32,
    pub native_type: String,
    pub universal_type: UniversalType,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub max_length: Option<i32>,
    #[serde(default)]
    pub numeric_precision: Option<i32>,
    #[serde(default)]
    pub numeric_scale: Option<i32>,
}

impl Column {
    /// A nullable, non key column. Mostly useful when declaring schemas by hand.
    pub fn new(
        name: impl Into<String>,
        ordinal_position: i32,
        native_type: impl Into<String>,
        universal_type: UniversalType,
    ) -> Self {
        Self {
            name: name.into(),
            ordinal_position,
            native_type: native_type.into(),
            universal_type,
            nullable: true,
            default_value: None,
            primary_key: false,
            foreign_keys: Vec::new(),
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
        }
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Discovered description of a container of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub system_id: String,
    pub namespace: String,
    pub name: String,
    pub kind: SchemaKind,
    /// Columns in ordinal order.
    pub columns: Vec<Column>,
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    pub comment: Option<String>,
    pub estimated_rows: Option<i64>,
    /// View definition, when the container is a view.
    #[serde(default)]
    pub definition: Option<String>,
}

impl Schema {
    /// Creates a new schema. Primary keys are taken from the columns flagged as such.
    pub fn new(
        system_id: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        kind: SchemaKind,
        columns: Vec<Column>,
    ) -> Self {
        let primary_keys = columns
            .iter()
            .filter(|column| column.primary_key)
            .map(|column| column.name.clone())
            .collect();

        Self {
            system_id: system_id.into(),
            namespace: namespace.into(),
            name: name.into(),
            kind,
            columns,
            primary_keys,
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            comment: None,
            estimated_rows: None,
            definition: None,
        }
    }

    /// Returns the column named `name`.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|column| column.name.as_str())
    }

    pub fn has_primary_keys(&self) -> bool {
        !self.primary_keys.is_empty()
    }

    pub fn schema_ref(&self) -> SchemaRef {
        SchemaRef::new(&self.system_id, &self.namespace, &self.name)
    }
}

/// Identifies a container in a given system, as referenced by mappings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRef {
    pub system_id: String,
    pub namespace: String,
    pub name: String,
}

impl SchemaRef {
    /// Creates a new reference to a container.
    pub fn new(
        system_id: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.system_id, self.namespace, self.name)
    }
}
