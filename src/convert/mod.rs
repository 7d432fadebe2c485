//! Schema conversion
//!
//! Turns a stream's declared JSON Schema into the physical layout of its target
//! table:
//! - Denormalized: nested RECORD and REPEATED fields, as the warehouse supports natively
//! - Flattened: the legacy layout, with every list stored as a JSON-encoded STRING
//!
//! With the `staging` feature, [`columnar`] also derives the Arrow schema used for
//! staged bulk loads.

#[cfg(feature = "staging")]
pub mod columnar;
pub mod converter;
pub mod json_schema;
pub mod naming;

pub use converter::{SchemaConverter, convert};
pub use json_schema::JsonSchemaParser;
pub use naming::{sanitize_identifier, table_ref_for};

use crate::models::Strategy;

/// Name of the metadata column holding a generated record identifier
pub const RECORD_ID_COLUMN: &str = "_record_id";

/// Name of the metadata column holding the source emission time
pub const EMITTED_AT_COLUMN: &str = "_emitted_at";

/// Sub-field wrapping the inner list of an array of arrays
pub const NESTED_ARRAY_FIELD: &str = "nested_values";

/// Deepest RECORD nesting the warehouse accepts
pub const MAX_NESTING_DEPTH: usize = 15;

/// Physical layout flavour produced by the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionMode {
    /// Nested records and native repeated fields
    Denormalized,
    /// Lists encoded as JSON strings
    Flattened,
}

impl ConversionMode {
    /// Layout matching a formatter strategy
    pub fn for_strategy(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Modern => ConversionMode::Denormalized,
            Strategy::Legacy => ConversionMode::Flattened,
        }
    }
}

/// Error raised when a declared schema has no physical mapping.
///
/// Every variant carries the JSON path of the offending construct.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Invalid schema at {path}: {reason}")]
    InvalidSchema { path: String, reason: String },
    #[error("Unknown type '{type_name}' at {path}")]
    UnknownType { path: String, type_name: String },
    #[error("Unresolved reference '{reference}' at {path}")]
    UnresolvedReference { path: String, reference: String },
    #[error("Empty union at {path}")]
    EmptyUnion { path: String },
    #[error("Unrepresentable union at {path}: {reason}")]
    IncompatibleUnion { path: String, reason: String },
    #[error("Column '{name}' at {path} collides with another column after sanitizing")]
    DuplicateColumn { path: String, name: String },
    #[error("Nesting at {path} exceeds the maximum depth of {max}")]
    NestingTooDeep { path: String, max: usize },
    #[error("Column at {path} has no columnar encoding: {reason}")]
    NoColumnarMapping { path: String, reason: String },
}

/// Result type for schema conversion
pub type SchemaResult<T> = Result<T, SchemaError>;
