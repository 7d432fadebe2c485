//! Row rendering for the modern and legacy strategies.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::{FormatError, FormatResult};
use crate::convert::naming::sanitize_identifier;
use crate::convert::{EMITTED_AT_COLUMN, NESTED_ARRAY_FIELD, RECORD_ID_COLUMN};
use crate::models::{
    FieldType, PhysicalField, PhysicalSchema, RawRecord, StreamKey, Strategy, UploadRecord,
};

/// Renders raw records into rows of one physical schema.
///
/// The formatter holds no mutable state, so one instance can be shared between
/// tasks. Under [`Strategy::Modern`] arrays stay native lists; under
/// [`Strategy::Legacy`] they are written as JSON text.
#[derive(Debug, Clone)]
pub struct RecordFormatter {
    stream: StreamKey,
    schema: PhysicalSchema,
    strategy: Strategy,
}

impl RecordFormatter {
    /// Create a formatter.
    ///
    /// `schema` must be the layout produced for `strategy`: denormalized for
    /// modern, flattened for legacy.
    pub fn new(stream: StreamKey, schema: PhysicalSchema, strategy: Strategy) -> Self {
        Self {
            stream,
            schema,
            strategy,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn schema(&self) -> &PhysicalSchema {
        &self.schema
    }

    /// Render one record.
    ///
    /// Keys are sanitized the same way column names are; keys with no matching
    /// column are dropped. The metadata columns are always filled in last.
    pub fn render(&self, record: &RawRecord) -> FormatResult<UploadRecord> {
        let data = record.data.as_object().ok_or_else(|| FormatError::NotAnObject {
            stream: self.stream.clone(),
            found: json_kind(&record.data),
        })?;

        let mut row = self.render_object(&self.schema.fields, data);
        row.insert(
            RECORD_ID_COLUMN.to_string(),
            Value::String(Uuid::new_v4().to_string()),
        );
        row.insert(
            EMITTED_AT_COLUMN.to_string(),
            Value::String(
                record
                    .emitted_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        );

        Ok(UploadRecord {
            strategy: self.strategy,
            row,
        })
    }

    fn render_object(&self, fields: &[PhysicalField], data: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, value) in data {
            let name = sanitize_identifier(key);
            match fields.iter().find(|f| f.name == name) {
                Some(field) => {
                    if let Some(rendered) = self.render_field(field, value) {
                        out.insert(name, rendered);
                    }
                }
                None => debug!(
                    "Dropping field '{}' of stream {}: not declared in the schema",
                    key, self.stream
                ),
            }
        }
        out
    }

    /// Render one column value; `None` leaves the column out of the row.
    fn render_field(&self, field: &PhysicalField, value: &Value) -> Option<Value> {
        if value.is_null() {
            // null is not a valid list value; an absent column reads as empty
            return (!field.is_repeated()).then_some(Value::Null);
        }

        match self.strategy {
            Strategy::Legacy if value.is_array() => {
                return Some(Value::String(value.to_string()));
            }
            Strategy::Legacy | Strategy::Modern => {}
        }

        if field.is_repeated() {
            let items = match value {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                single => vec![single],
            };
            let rendered = items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(|item| self.render_item(field, item))
                .collect();
            return Some(Value::Array(rendered));
        }

        Some(self.render_single(field, value))
    }

    fn render_item(&self, field: &PhysicalField, item: &Value) -> Value {
        if item.is_array()
            && let Some(inner) = nested_array_field(field)
        {
            let mut wrapper = Map::new();
            if let Some(rendered) = self.render_field(inner, item) {
                wrapper.insert(inner.name.clone(), rendered);
            }
            return Value::Object(wrapper);
        }
        self.render_single(field, item)
    }

    fn render_single(&self, field: &PhysicalField, value: &Value) -> Value {
        match (field.field_type, value) {
            (FieldType::Record, Value::Object(obj)) => {
                Value::Object(self.render_object(&field.fields, obj))
            }
            (FieldType::String, Value::String(_)) => value.clone(),
            (FieldType::String, other) | (FieldType::Json, other) => {
                Value::String(other.to_string())
            }
            (FieldType::Timestamp, Value::String(raw)) => normalize_timestamp(raw),
            (FieldType::Integer, Value::String(raw)) => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| value.clone()),
            (FieldType::Float, Value::String(raw)) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone()),
            (FieldType::Boolean, Value::String(raw)) => match raw.trim() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => value.clone(),
            },
            _ => value.clone(),
        }
    }
}

/// The wrapped inner list of an array-of-arrays column, if `field` is one.
fn nested_array_field(field: &PhysicalField) -> Option<&PhysicalField> {
    match field.fields.as_slice() {
        [inner] if field.field_type == FieldType::Record && inner.name == NESTED_ARRAY_FIELD => {
            Some(inner)
        }
        _ => None,
    }
}

/// Normalize a timestamp to UTC with microsecond precision. Values without an
/// offset are read as UTC; unparseable values pass through unchanged.
fn normalize_timestamp(raw: &str) -> Value {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|ts| ts.and_utc())
        });
    match parsed {
        Ok(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
