//! Declared schema to physical schema conversion.
//!
//! Conversion is pure: the same stream schema and mode always produce an equal
//! [`PhysicalSchema`].

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::json_schema::JsonSchemaParser;
use super::naming::sanitize_identifier;
use super::{
    ConversionMode, EMITTED_AT_COLUMN, MAX_NESTING_DEPTH, NESTED_ARRAY_FIELD, RECORD_ID_COLUMN,
    SchemaError, SchemaResult,
};
use crate::models::{
    FieldMode, FieldType, PhysicalField, PhysicalSchema, ScalarKind, SchemaNode, StreamSchema,
};

/// Convert a stream schema into its physical layout.
///
/// Shorthand for [`SchemaConverter::convert`].
pub fn convert(schema: &StreamSchema, mode: ConversionMode) -> SchemaResult<PhysicalSchema> {
    SchemaConverter::new().convert(schema, mode)
}

/// Converter from declared JSON Schemas to physical table layouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaConverter {
    parser: JsonSchemaParser,
}

impl SchemaConverter {
    pub fn new() -> Self {
        Self {
            parser: JsonSchemaParser::new(),
        }
    }

    /// Convert a stream schema into its physical layout.
    ///
    /// The two metadata columns come first, followed by one column per declared
    /// property in name order.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] when the schema contains a construct without a
    /// physical mapping (an unrepresentable union, an unknown type, a column name
    /// collision after sanitizing, or nesting beyond the warehouse limit).
    pub fn convert(
        &self,
        schema: &StreamSchema,
        mode: ConversionMode,
    ) -> SchemaResult<PhysicalSchema> {
        let root = self.parser.parse(&schema.json_schema)?;
        let root = normalize(&root, "$")?;

        let properties = match root {
            SchemaNode::Object(properties) => properties,
            SchemaNode::Any => BTreeMap::new(),
            other => {
                return Err(SchemaError::InvalidSchema {
                    path: "$".to_string(),
                    reason: format!("record schema must be an object, found {}", other.kind_name()),
                });
            }
        };

        let mut fields = vec![
            PhysicalField::new(RECORD_ID_COLUMN, FieldType::String, FieldMode::Required),
            PhysicalField::new(EMITTED_AT_COLUMN, FieldType::Timestamp, FieldMode::Required),
        ];
        let reserved = [RECORD_ID_COLUMN, EMITTED_AT_COLUMN];
        fields.extend(self.build_fields(&properties, mode, 0, "$", &reserved)?);

        debug!(
            "Converted schema of stream {} ({:?}) into {} columns",
            schema.key,
            mode,
            fields.len()
        );
        Ok(PhysicalSchema::new(fields))
    }

    fn build_fields(
        &self,
        properties: &BTreeMap<String, SchemaNode>,
        mode: ConversionMode,
        depth: usize,
        path: &str,
        reserved: &[&str],
    ) -> SchemaResult<Vec<PhysicalField>> {
        let mut seen: HashSet<String> = reserved.iter().map(|s| s.to_string()).collect();
        let mut fields = Vec::with_capacity(properties.len());

        for (raw_name, node) in properties {
            let child_path = format!("{}.{}", path, raw_name);
            let name = sanitize_identifier(raw_name);
            if !seen.insert(name.clone()) {
                return Err(SchemaError::DuplicateColumn {
                    path: child_path,
                    name,
                });
            }
            fields.push(self.build_field(name, node, mode, depth, &child_path)?);
        }
        Ok(fields)
    }

    fn build_field(
        &self,
        name: String,
        node: &SchemaNode,
        mode: ConversionMode,
        depth: usize,
        path: &str,
    ) -> SchemaResult<PhysicalField> {
        let field = match node {
            SchemaNode::Null => PhysicalField::new(name, FieldType::String, FieldMode::Nullable),
            SchemaNode::Scalar(kind) => {
                PhysicalField::new(name, scalar_field_type(*kind), FieldMode::Nullable)
            }
            SchemaNode::Any => {
                let field_type = match mode {
                    ConversionMode::Denormalized => FieldType::Json,
                    ConversionMode::Flattened => FieldType::String,
                };
                PhysicalField::new(name, field_type, FieldMode::Nullable)
            }
            SchemaNode::Object(properties) => {
                check_depth(depth, path)?;
                let fields = self.build_fields(properties, mode, depth + 1, path, &[])?;
                PhysicalField::record(name, FieldMode::Nullable, fields)
            }
            SchemaNode::Array(items) => match mode {
                ConversionMode::Flattened => {
                    PhysicalField::new(name, FieldType::String, FieldMode::Nullable)
                }
                ConversionMode::Denormalized => self.build_repeated(name, items, depth, path)?,
            },
            SchemaNode::Union(_) => {
                return Err(SchemaError::InvalidSchema {
                    path: path.to_string(),
                    reason: "union was not resolved".to_string(),
                });
            }
        };
        Ok(field)
    }

    /// Repeated field for a denormalized array. Arrays of arrays are wrapped in a
    /// single-field repeated RECORD, since repeated fields cannot nest directly.
    fn build_repeated(
        &self,
        name: String,
        items: &SchemaNode,
        depth: usize,
        path: &str,
    ) -> SchemaResult<PhysicalField> {
        if let SchemaNode::Array(inner) = items {
            check_depth(depth, path)?;
            let inner_path = format!("{}[]", path);
            let inner_field =
                self.build_repeated(NESTED_ARRAY_FIELD.to_string(), inner, depth + 1, &inner_path)?;
            return Ok(PhysicalField::record(
                name,
                FieldMode::Repeated,
                vec![inner_field],
            ));
        }

        let mut field = self.build_field(name, items, ConversionMode::Denormalized, depth, path)?;
        field.mode = FieldMode::Repeated;
        Ok(field)
    }
}

fn check_depth(depth: usize, path: &str) -> SchemaResult<()> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(SchemaError::NestingTooDeep {
            path: path.to_string(),
            max: MAX_NESTING_DEPTH,
        });
    }
    Ok(())
}

fn scalar_field_type(kind: ScalarKind) -> FieldType {
    match kind {
        ScalarKind::String => FieldType::String,
        ScalarKind::Integer => FieldType::Integer,
        ScalarKind::Number => FieldType::Float,
        ScalarKind::Boolean => FieldType::Boolean,
        ScalarKind::Timestamp => FieldType::Timestamp,
        ScalarKind::Date => FieldType::Date,
        ScalarKind::Time => FieldType::Time,
    }
}

/// Resolve every union in the tree into a single node.
///
/// `null` members only make a field nullable, and every column is nullable
/// already, so they are dropped. A union made of `null` alone stays `Null`.
fn normalize(node: &SchemaNode, path: &str) -> SchemaResult<SchemaNode> {
    match node {
        SchemaNode::Null | SchemaNode::Scalar(_) | SchemaNode::Any => Ok(node.clone()),
        SchemaNode::Object(properties) => {
            let mut normalized = BTreeMap::new();
            for (name, child) in properties {
                normalized.insert(
                    name.clone(),
                    normalize(child, &format!("{}.{}", path, name))?,
                );
            }
            Ok(SchemaNode::Object(normalized))
        }
        SchemaNode::Array(items) => Ok(SchemaNode::Array(Box::new(normalize(
            items,
            &format!("{}[]", path),
        )?))),
        SchemaNode::Union(members) => {
            if members.is_empty() {
                return Err(SchemaError::EmptyUnion {
                    path: path.to_string(),
                });
            }
            let mut resolved: Option<SchemaNode> = None;
            for member in members {
                let member = normalize(member, path)?;
                if member == SchemaNode::Null {
                    continue;
                }
                resolved = Some(match resolved {
                    None => member,
                    Some(previous) => merge(previous, member, path)?,
                });
            }
            Ok(resolved.unwrap_or(SchemaNode::Null))
        }
    }
}

/// Widen two normalized union members into one.
fn merge(left: SchemaNode, right: SchemaNode, path: &str) -> SchemaResult<SchemaNode> {
    match (left, right) {
        (SchemaNode::Scalar(a), SchemaNode::Scalar(b)) => Ok(SchemaNode::Scalar(widen(a, b))),
        (SchemaNode::Array(a), SchemaNode::Array(b)) => {
            let items = match (*a, *b) {
                (SchemaNode::Null, other) | (other, SchemaNode::Null) => other,
                (a, b) => merge(a, b, &format!("{}[]", path))?,
            };
            Ok(SchemaNode::Array(Box::new(items)))
        }
        (SchemaNode::Object(a), SchemaNode::Object(b)) => {
            if a == b {
                Ok(SchemaNode::Object(a))
            } else {
                Err(SchemaError::IncompatibleUnion {
                    path: path.to_string(),
                    reason: "object members declare different shapes".to_string(),
                })
            }
        }
        (SchemaNode::Any, SchemaNode::Any) => Ok(SchemaNode::Any),
        (left, right) => Err(SchemaError::IncompatibleUnion {
            path: path.to_string(),
            reason: format!(
                "cannot combine {} with {}",
                left.kind_name(),
                right.kind_name()
            ),
        }),
    }
}

/// Common scalar for two union members: integers widen to numbers, any other
/// mix widens to string.
fn widen(a: ScalarKind, b: ScalarKind) -> ScalarKind {
    match (a, b) {
        (a, b) if a == b => a,
        (ScalarKind::Integer, ScalarKind::Number) | (ScalarKind::Number, ScalarKind::Integer) => {
            ScalarKind::Number
        }
        _ => ScalarKind::String,
    }
}
