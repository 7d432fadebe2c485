//! Columnar (Arrow) encoding schema for staged bulk loads.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};

use super::{SchemaError, SchemaResult};
use crate::models::{FieldMode, FieldType, PhysicalField, PhysicalSchema};

/// Time zone of every TIMESTAMP column
pub const UTC_OFFSET: &str = "+00:00";

/// Derive the Arrow schema matching a physical schema.
///
/// RECORD columns become structs and REPEATED columns become lists. JSON columns
/// have no columnar encoding, so streams that declare one cannot be staged.
pub fn arrow_schema(schema: &PhysicalSchema) -> SchemaResult<SchemaRef> {
    let fields = schema
        .fields
        .iter()
        .map(|field| arrow_field(field, &field.name))
        .collect::<SchemaResult<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

/// Whether rows of this schema can be written in the columnar format
pub fn supports_columnar(schema: &PhysicalSchema) -> bool {
    !schema.contains_type(FieldType::Json)
}

fn arrow_field(field: &PhysicalField, path: &str) -> SchemaResult<Field> {
    let data_type = match field.field_type {
        FieldType::String => DataType::Utf8,
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
        // offset form; named zones need arrow's chrono-tz feature
        FieldType::Timestamp => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_OFFSET.into()))
        }
        FieldType::Date => DataType::Date32,
        FieldType::Time => DataType::Time64(TimeUnit::Microsecond),
        FieldType::Record => {
            let children = field
                .fields
                .iter()
                .map(|child| arrow_field(child, &format!("{}.{}", path, child.name)))
                .collect::<SchemaResult<Vec<_>>>()?;
            DataType::Struct(Fields::from(children))
        }
        FieldType::Json => {
            return Err(SchemaError::NoColumnarMapping {
                path: path.to_string(),
                reason: "JSON columns cannot be bulk loaded".to_string(),
            });
        }
    };

    let field = match field.mode {
        FieldMode::Repeated => Field::new(
            &field.name,
            DataType::List(Arc::new(Field::new("item", data_type, true))),
            true,
        ),
        FieldMode::Nullable => Field::new(&field.name, data_type, true),
        FieldMode::Required => Field::new(&field.name, data_type, false),
    };
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrow_schema_maps_nested_and_repeated_fields() {
        let schema = PhysicalSchema::new(vec![
            PhysicalField::new("_record_id", FieldType::String, FieldMode::Required),
            PhysicalField::new("_emitted_at", FieldType::Timestamp, FieldMode::Required),
            PhysicalField::new("tags", FieldType::String, FieldMode::Repeated),
            PhysicalField::record(
                "address",
                FieldMode::Nullable,
                vec![PhysicalField::new("zip", FieldType::Integer, FieldMode::Nullable)],
            ),
        ]);
        let arrow = arrow_schema(&schema).unwrap();

        let id = arrow.field_with_name("_record_id").unwrap();
        assert!(!id.is_nullable());
        assert_eq!(id.data_type(), &DataType::Utf8);

        let tags = arrow.field_with_name("tags").unwrap();
        assert!(matches!(tags.data_type(), DataType::List(item) if item.data_type() == &DataType::Utf8));

        let seen = arrow.field_with_name("_emitted_at").unwrap();
        assert_eq!(
            seen.data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("+00:00".into()))
        );

        let address = arrow.field_with_name("address").unwrap();
        let DataType::Struct(children) = address.data_type() else {
            panic!("expected struct");
        };
        assert_eq!(children[0].name(), "zip");
        assert_eq!(children[0].data_type(), &DataType::Int64);
    }

    #[test]
    fn test_json_columns_have_no_columnar_mapping() {
        let schema = PhysicalSchema::new(vec![PhysicalField::record(
            "payload",
            FieldMode::Nullable,
            vec![PhysicalField::new("raw", FieldType::Json, FieldMode::Nullable)],
        )]);
        let err = arrow_schema(&schema).unwrap_err();
        assert!(matches!(err, SchemaError::NoColumnarMapping { ref path, .. } if path == "payload.raw"));
        assert!(!supports_columnar(&schema));
    }
}
