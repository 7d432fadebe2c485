//! JSON Schema parser producing the [`SchemaNode`] tree the converter works on.
//!
//! Supported keywords: `type` (single or list), `properties`, `items`
//! (single schema or tuple), `anyOf`, `oneOf`, `format`, `airbyte_type`, and
//! `$ref` to the well-known scalar type definitions.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::{SchemaError, SchemaResult};
use crate::models::{ScalarKind, SchemaNode};

/// Parser for stream JSON Schemas.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaParser;

impl JsonSchemaParser {
    /// Create a new parser instance.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bigquery_denormalized::convert::JsonSchemaParser;
    /// use bigquery_denormalized::models::SchemaNode;
    /// use serde_json::json;
    ///
    /// let parser = JsonSchemaParser::new();
    /// let node = parser
    ///     .parse(&json!({"type": "object", "properties": {"id": {"type": "integer"}}}))
    ///     .unwrap();
    /// assert!(matches!(node, SchemaNode::Object(_)));
    /// ```
    pub fn new() -> Self {
        Self
    }

    /// Parse a stream's root schema.
    pub fn parse(&self, schema: &Value) -> SchemaResult<SchemaNode> {
        self.parse_node(schema, "$")
    }

    fn parse_node(&self, schema: &Value, path: &str) -> SchemaResult<SchemaNode> {
        let obj = match schema {
            Value::Bool(true) => return Ok(SchemaNode::Any),
            Value::Object(obj) => obj,
            _ => {
                return Err(SchemaError::InvalidSchema {
                    path: path.to_string(),
                    reason: "schema must be an object".to_string(),
                });
            }
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            return well_known_reference(reference, path);
        }

        for keyword in ["anyOf", "oneOf"] {
            if let Some(members) = obj.get(keyword) {
                let members = members.as_array().ok_or_else(|| SchemaError::InvalidSchema {
                    path: path.to_string(),
                    reason: format!("{} must be a list", keyword),
                })?;
                let nodes = members
                    .iter()
                    .enumerate()
                    .map(|(idx, member)| {
                        self.parse_node(member, &format!("{}.{}[{}]", path, keyword, idx))
                    })
                    .collect::<SchemaResult<Vec<_>>>()?;
                return Ok(SchemaNode::Union(nodes));
            }
        }

        match obj.get("type") {
            None => {
                if obj.contains_key("properties") {
                    self.parse_object(obj, path)
                } else if obj.contains_key("items") {
                    self.parse_array(obj, path)
                } else {
                    Ok(SchemaNode::Any)
                }
            }
            Some(Value::String(type_name)) => self.parse_typed(type_name, obj, path),
            Some(Value::Array(type_names)) => {
                let mut nodes = Vec::with_capacity(type_names.len());
                for type_name in type_names {
                    let type_name = type_name.as_str().ok_or_else(|| SchemaError::InvalidSchema {
                        path: path.to_string(),
                        reason: "type list entries must be strings".to_string(),
                    })?;
                    nodes.push(self.parse_typed(type_name, obj, path)?);
                }
                if nodes.len() == 1 {
                    Ok(nodes.remove(0))
                } else {
                    Ok(SchemaNode::Union(nodes))
                }
            }
            Some(_) => Err(SchemaError::InvalidSchema {
                path: path.to_string(),
                reason: "type must be a string or a list of strings".to_string(),
            }),
        }
    }

    fn parse_typed(
        &self,
        type_name: &str,
        obj: &Map<String, Value>,
        path: &str,
    ) -> SchemaResult<SchemaNode> {
        let airbyte_type = obj.get("airbyte_type").and_then(Value::as_str);
        match type_name {
            "null" => Ok(SchemaNode::Null),
            "string" => Ok(SchemaNode::Scalar(string_kind(obj))),
            "integer" => Ok(SchemaNode::Scalar(ScalarKind::Integer)),
            "number" => match airbyte_type {
                Some("integer") => Ok(SchemaNode::Scalar(ScalarKind::Integer)),
                _ => Ok(SchemaNode::Scalar(ScalarKind::Number)),
            },
            "boolean" => Ok(SchemaNode::Scalar(ScalarKind::Boolean)),
            "object" => self.parse_object(obj, path),
            "array" => self.parse_array(obj, path),
            other => Err(SchemaError::UnknownType {
                path: path.to_string(),
                type_name: other.to_string(),
            }),
        }
    }

    fn parse_object(&self, obj: &Map<String, Value>, path: &str) -> SchemaResult<SchemaNode> {
        let properties = match obj.get("properties") {
            None | Some(Value::Null) => return Ok(SchemaNode::Any),
            Some(Value::Object(properties)) => properties,
            Some(_) => {
                return Err(SchemaError::InvalidSchema {
                    path: path.to_string(),
                    reason: "properties must be an object".to_string(),
                });
            }
        };
        if properties.is_empty() {
            debug!("Object at {} declares no properties, keeping it free-form", path);
            return Ok(SchemaNode::Any);
        }

        let mut fields = BTreeMap::new();
        for (name, child) in properties {
            let child_path = format!("{}.{}", path, name);
            fields.insert(name.clone(), self.parse_node(child, &child_path)?);
        }
        Ok(SchemaNode::Object(fields))
    }

    fn parse_array(&self, obj: &Map<String, Value>, path: &str) -> SchemaResult<SchemaNode> {
        let item_path = format!("{}[]", path);
        let items = match obj.get("items") {
            None | Some(Value::Null) => SchemaNode::Scalar(ScalarKind::String),
            Some(Value::Array(tuple)) if tuple.is_empty() => SchemaNode::Scalar(ScalarKind::String),
            Some(Value::Array(tuple)) => SchemaNode::Union(
                tuple
                    .iter()
                    .map(|item| self.parse_node(item, &item_path))
                    .collect::<SchemaResult<Vec<_>>>()?,
            ),
            Some(items) => self.parse_node(items, &item_path)?,
        };
        Ok(SchemaNode::Array(Box::new(items)))
    }
}

/// Scalar kind of a `string` schema, refined by `format` / `airbyte_type`.
fn string_kind(obj: &Map<String, Value>) -> ScalarKind {
    let format = obj.get("format").and_then(Value::as_str);
    let airbyte_type = obj.get("airbyte_type").and_then(Value::as_str);
    match (format, airbyte_type) {
        (Some("date-time"), _)
        | (_, Some("timestamp_with_timezone"))
        | (_, Some("timestamp_without_timezone")) => ScalarKind::Timestamp,
        (Some("date"), _) => ScalarKind::Date,
        (Some("time"), _)
        | (_, Some("time_with_timezone"))
        | (_, Some("time_without_timezone")) => ScalarKind::Time,
        _ => ScalarKind::String,
    }
}

/// Resolve a `$ref` to one of the well-known scalar type definitions.
fn well_known_reference(reference: &str, path: &str) -> SchemaResult<SchemaNode> {
    let definition = reference.rsplit('/').next().unwrap_or(reference);
    let kind = match definition {
        "String" | "BinaryData" => ScalarKind::String,
        "Integer" => ScalarKind::Integer,
        "Number" => ScalarKind::Number,
        "Boolean" => ScalarKind::Boolean,
        "Date" => ScalarKind::Date,
        "TimestampWithTimezone" | "TimestampWithoutTimezone" => ScalarKind::Timestamp,
        "TimeWithTimezone" | "TimeWithoutTimezone" => ScalarKind::Time,
        _ => {
            return Err(SchemaError::UnresolvedReference {
                path: path.to_string(),
                reference: reference.to_string(),
            });
        }
    };
    Ok(SchemaNode::Scalar(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(schema: Value) -> SchemaResult<SchemaNode> {
        JsonSchemaParser::new().parse(&schema)
    }

    #[test]
    fn test_parse_scalars_and_formats() {
        let node = parse(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "created": {"type": "string", "format": "date-time"},
                "day": {"type": "string", "format": "date"},
                "at": {"type": "string", "airbyte_type": "time_without_timezone"},
                "count": {"type": "number", "airbyte_type": "integer"},
                "ratio": {"type": "number"}
            }
        }))
        .unwrap();

        let SchemaNode::Object(fields) = node else {
            panic!("expected object");
        };
        assert_eq!(fields["name"], SchemaNode::Scalar(ScalarKind::String));
        assert_eq!(fields["created"], SchemaNode::Scalar(ScalarKind::Timestamp));
        assert_eq!(fields["day"], SchemaNode::Scalar(ScalarKind::Date));
        assert_eq!(fields["at"], SchemaNode::Scalar(ScalarKind::Time));
        assert_eq!(fields["count"], SchemaNode::Scalar(ScalarKind::Integer));
        assert_eq!(fields["ratio"], SchemaNode::Scalar(ScalarKind::Number));
    }

    #[test]
    fn test_type_list_becomes_union() {
        let node = parse(json!({"type": ["null", "integer"]})).unwrap();
        assert_eq!(
            node,
            SchemaNode::Union(vec![
                SchemaNode::Null,
                SchemaNode::Scalar(ScalarKind::Integer)
            ])
        );
    }

    #[test]
    fn test_array_items_variants() {
        assert_eq!(
            parse(json!({"type": "array"})).unwrap(),
            SchemaNode::Array(Box::new(SchemaNode::Scalar(ScalarKind::String)))
        );
        assert_eq!(
            parse(json!({"type": "array", "items": [{"type": "integer"}, {"type": "number"}]}))
                .unwrap(),
            SchemaNode::Array(Box::new(SchemaNode::Union(vec![
                SchemaNode::Scalar(ScalarKind::Integer),
                SchemaNode::Scalar(ScalarKind::Number),
            ])))
        );
    }

    #[test]
    fn test_object_without_properties_is_free_form() {
        assert_eq!(parse(json!({"type": "object"})).unwrap(), SchemaNode::Any);
        assert_eq!(parse(json!({})).unwrap(), SchemaNode::Any);
    }

    #[test]
    fn test_well_known_reference() {
        assert_eq!(
            parse(json!({"$ref": "WellKnownTypes.json#/definitions/TimestampWithTimezone"}))
                .unwrap(),
            SchemaNode::Scalar(ScalarKind::Timestamp)
        );
        assert!(matches!(
            parse(json!({"$ref": "#/definitions/Customer"})),
            Err(SchemaError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_unknown_type_reports_path() {
        let err = parse(json!({
            "type": "object",
            "properties": {"blob": {"type": "binary"}}
        }))
        .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownType {
                path: "$.blob".to_string(),
                type_name: "binary".to_string()
            }
        );
    }
}
