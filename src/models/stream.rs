//! Stream identity and declared record schemas

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a stream within a sync: optional namespace plus stream name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Source namespace (maps to the target dataset when present)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Stream name (maps to the target table)
    pub name: String,
}

impl StreamKey {
    /// Create a key for a stream without a namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Create a key for a namespaced stream
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How the destination should treat rows already in the target table.
///
/// `Overwrite` replaces them when the stream commits. `AppendDedup` is written
/// like `Append`; deduplication happens downstream of the raw table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationSyncMode {
    #[default]
    Append,
    Overwrite,
    AppendDedup,
}

/// Declared schema of one stream for the duration of a sync.
///
/// The JSON Schema is kept as received; it is only interpreted by the
/// schema converter, so a malformed schema fails that stream alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSchema {
    /// Stream identity
    pub key: StreamKey,
    /// Declared JSON Schema of each record
    pub json_schema: Value,
    /// Decides whether the commit appends to or replaces the target rows
    #[serde(default)]
    pub destination_sync_mode: DestinationSyncMode,
}

impl StreamSchema {
    /// Create an appending stream schema
    pub fn new(key: StreamKey, json_schema: Value) -> Self {
        Self {
            key,
            json_schema,
            destination_sync_mode: DestinationSyncMode::default(),
        }
    }

    pub fn with_sync_mode(mut self, mode: DestinationSyncMode) -> Self {
        self.destination_sync_mode = mode;
        self
    }
}

/// Scalar kinds a declared field can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    String,
    Integer,
    Number,
    Boolean,
    Timestamp,
    Date,
    Time,
}

/// Parsed tree of a declared record schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    /// Explicit `null` type
    Null,
    /// Scalar leaf
    Scalar(ScalarKind),
    /// Object with declared properties, sorted by name
    Object(BTreeMap<String, SchemaNode>),
    /// Array of a single item schema
    Array(Box<SchemaNode>),
    /// `anyOf`/`oneOf` or a list of types
    Union(Vec<SchemaNode>),
    /// Free-form value (no type, or an object without properties)
    Any,
}

impl SchemaNode {
    /// Short label used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            SchemaNode::Null => "null",
            SchemaNode::Scalar(_) => "scalar",
            SchemaNode::Object(_) => "object",
            SchemaNode::Array(_) => "array",
            SchemaNode::Union(_) => "union",
            SchemaNode::Any => "free-form",
        }
    }
}
