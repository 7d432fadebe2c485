//! Models module
//!
//! Defines the data structures shared by the converter, formatter, detector,
//! uploaders and router.

pub mod catalog;
pub mod physical;
pub mod record;
pub mod stream;

pub use catalog::{CatalogError, ConfiguredCatalog, ConfiguredStream, StreamDescriptor};
pub use physical::{FieldMode, FieldType, PhysicalField, PhysicalSchema, TableRef};
pub use record::{RawRecord, Strategy, UploadRecord};
pub use stream::{DestinationSyncMode, ScalarKind, SchemaNode, StreamKey, StreamSchema};
