//! Strategy selection from an existing table snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{PhysicalSchema, Strategy};
use crate::warehouse::ExistingTableDescriptor;

/// Why a strategy was selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DetectionReason {
    /// No table yet; it will be created with the modern layout
    TableAbsent,
    /// The table exists but its schema could not be read
    SchemaUnreadable,
    /// The existing schema equals the modern candidate
    SchemaMatches,
    /// The existing schema differs from the modern candidate
    SchemaMismatch {
        /// Top-level columns that are missing, extra or different
        columns: Vec<String>,
    },
}

impl fmt::Display for DetectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionReason::TableAbsent => write!(f, "table-absent"),
            DetectionReason::SchemaUnreadable => write!(f, "compatibility-ambiguous"),
            DetectionReason::SchemaMatches => write!(f, "schema-matches"),
            DetectionReason::SchemaMismatch { .. } => write!(f, "existing-schema-mismatch"),
        }
    }
}

/// Outcome of compatibility detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub strategy: Strategy,
    pub reason: DetectionReason,
}

impl Detection {
    /// Whether the outcome should be reported as a warning
    pub fn is_warning(&self) -> bool {
        matches!(
            self.reason,
            DetectionReason::SchemaUnreadable | DetectionReason::SchemaMismatch { .. }
        )
    }
}

/// Select the formatting strategy for a stream.
///
/// See [`detect`] for the rules.
pub fn select_strategy(existing: &ExistingTableDescriptor, candidate: &PhysicalSchema) -> Strategy {
    detect(existing, candidate).strategy
}

/// Compare an existing table with the modern candidate schema.
///
/// - table absent: modern
/// - schema unreadable: modern, flagged as a warning
/// - schemas equal: modern
/// - schemas differ: legacy, flagged as a warning
///
/// Equality is strict (see [`PhysicalSchema`]), so an additive change such as a
/// new nullable column also selects legacy.
pub fn detect(existing: &ExistingTableDescriptor, candidate: &PhysicalSchema) -> Detection {
    let (strategy, reason) = match existing {
        ExistingTableDescriptor::Absent => (Strategy::Modern, DetectionReason::TableAbsent),
        ExistingTableDescriptor::Present { schema: None } => {
            (Strategy::Modern, DetectionReason::SchemaUnreadable)
        }
        ExistingTableDescriptor::Present {
            schema: Some(current),
        } if current == candidate => (Strategy::Modern, DetectionReason::SchemaMatches),
        ExistingTableDescriptor::Present {
            schema: Some(current),
        } => (
            Strategy::Legacy,
            DetectionReason::SchemaMismatch {
                columns: differing_columns(current, candidate),
            },
        ),
    };
    Detection { strategy, reason }
}

fn differing_columns(current: &PhysicalSchema, candidate: &PhysicalSchema) -> Vec<String> {
    let mut columns: Vec<String> = candidate
        .fields
        .iter()
        .filter(|field| current.field(&field.name) != Some(*field))
        .map(|field| field.name.clone())
        .collect();
    columns.extend(
        current
            .fields
            .iter()
            .filter(|field| candidate.field(&field.name).is_none())
            .map(|field| field.name.clone()),
    );
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldMode, FieldType, PhysicalField};

    fn modern() -> PhysicalSchema {
        PhysicalSchema::new(vec![
            PhysicalField::new("_record_id", FieldType::String, FieldMode::Required),
            PhysicalField::new("tags", FieldType::String, FieldMode::Repeated),
        ])
    }

    fn flattened() -> PhysicalSchema {
        PhysicalSchema::new(vec![
            PhysicalField::new("_record_id", FieldType::String, FieldMode::Required),
            PhysicalField::new("tags", FieldType::String, FieldMode::Nullable),
            PhysicalField::new("old_column", FieldType::Integer, FieldMode::Nullable),
        ])
    }

    #[test]
    fn test_absent_table_selects_modern() {
        let detection = detect(&ExistingTableDescriptor::Absent, &modern());
        assert_eq!(detection.strategy, Strategy::Modern);
        assert_eq!(detection.reason, DetectionReason::TableAbsent);
        assert!(!detection.is_warning());
    }

    #[test]
    fn test_equal_schema_selects_modern() {
        let detection = detect(&ExistingTableDescriptor::present(modern()), &modern());
        assert_eq!(detection.strategy, Strategy::Modern);
        assert_eq!(detection.reason, DetectionReason::SchemaMatches);
        assert!(!detection.is_warning());
    }

    #[test]
    fn test_different_schema_selects_legacy() {
        let detection = detect(&ExistingTableDescriptor::present(flattened()), &modern());
        assert_eq!(detection.strategy, Strategy::Legacy);
        assert_eq!(
            detection.reason,
            DetectionReason::SchemaMismatch {
                columns: vec!["tags".to_string(), "old_column".to_string()]
            }
        );
        assert!(detection.is_warning());
        assert_eq!(detection.reason.to_string(), "existing-schema-mismatch");
    }

    #[test]
    fn test_unreadable_schema_selects_modern_with_warning() {
        let detection = detect(&ExistingTableDescriptor::unreadable(), &modern());
        assert_eq!(detection.strategy, Strategy::Modern);
        assert!(detection.is_warning());
    }

    #[test]
    fn test_additive_change_still_selects_legacy() {
        let mut existing = modern();
        existing.fields.pop();
        assert_eq!(
            select_strategy(&ExistingTableDescriptor::present(existing), &modern()),
            Strategy::Legacy
        );
    }

    #[test]
    fn test_detection_is_pure() {
        let existing = ExistingTableDescriptor::present(flattened());
        assert_eq!(detect(&existing, &modern()), detect(&existing, &modern()));
    }
}
