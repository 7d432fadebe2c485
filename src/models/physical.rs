//! Physical table layouts as the warehouse sees them
//!
//! A [`PhysicalSchema`] serializes to and from the warehouse's
//! `{"fields": [{"name", "type", "mode", "fields"}]}` JSON shape, so the schema
//! of an existing table can be compared directly with a generated one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column type of a physical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    #[serde(alias = "INT64")]
    Integer,
    #[serde(alias = "FLOAT64")]
    Float,
    #[serde(alias = "BOOL")]
    Boolean,
    Timestamp,
    Date,
    Time,
    #[serde(alias = "STRUCT")]
    Record,
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Record => "RECORD",
            FieldType::Json => "JSON",
        };
        write!(f, "{}", name)
    }
}

/// Nesting mode of a physical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// One column (or nested sub-field) of a physical schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalField {
    /// Column name
    pub name: String,
    /// Column type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Nesting mode
    #[serde(default)]
    pub mode: FieldMode,
    /// Sub-fields of a RECORD column
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<PhysicalField>,
}

impl PhysicalField {
    /// Create a leaf field
    pub fn new(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode,
            fields: Vec::new(),
        }
    }

    /// Create a RECORD field with the given sub-fields
    pub fn record(name: impl Into<String>, mode: FieldMode, fields: Vec<PhysicalField>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Record,
            mode,
            fields,
        }
    }

    /// Whether this field holds a list of values
    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Repeated
    }

    /// Look up a direct sub-field by name
    pub fn field(&self, name: &str) -> Option<&PhysicalField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Column layout of a target table.
///
/// Equality is structural and strict: names, types, modes and nesting must all
/// match, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSchema {
    /// Top-level columns
    pub fields: Vec<PhysicalField>,
}

impl PhysicalSchema {
    /// Create a schema from its top-level columns
    pub fn new(fields: Vec<PhysicalField>) -> Self {
        Self { fields }
    }

    /// Look up a top-level column by name
    pub fn field(&self, name: &str) -> Option<&PhysicalField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Number of top-level columns
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether any column, at any depth, has the given type
    pub fn contains_type(&self, field_type: FieldType) -> bool {
        fn walk(fields: &[PhysicalField], field_type: FieldType) -> bool {
            fields
                .iter()
                .any(|f| f.field_type == field_type || walk(&f.fields, field_type))
        }
        walk(&self.fields, field_type)
    }

    /// Parse a schema from the warehouse JSON representation
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the schema to the warehouse JSON representation
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Fully qualified target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Dataset containing the table
    pub dataset: String,
    /// Table name
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}
