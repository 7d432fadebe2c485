//! BigQuery denormalized destination core
//!
//! Writes records of a sync into warehouse tables that keep nested objects and
//! arrays as native RECORD and REPEATED columns. Provides:
//! - Schema conversion from declared JSON Schemas to physical table layouts
//! - Compatibility detection against tables created by older destinations
//! - Record formatting for the modern and legacy layouts
//! - Streaming and staged (Parquet) uploaders
//! - A sync-scoped stream router and sync session
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bigquery_denormalized::{
//!     DestinationConfig, InMemoryWarehouse, RawRecord, StreamKey, StreamSchema, SyncSession,
//!     TracingSink,
//! };
//! use serde_json::json;
//!
//! # tokio_test_block(async {
//! let schema = StreamSchema::new(
//!     StreamKey::new("users"),
//!     json!({"type": "object", "properties": {"tags": {"type": "array", "items": {"type": "string"}}}}),
//! );
//! let session = SyncSession::new(
//!     DestinationConfig::new("my-project", "raw"),
//!     vec![schema],
//!     Arc::new(InMemoryWarehouse::new()),
//!     Arc::new(TracingSink),
//! )
//! .unwrap();
//! session
//!     .process(RawRecord::new(StreamKey::new("users"), json!({"tags": ["a", "b"]})))
//!     .await
//!     .unwrap();
//! let summary = session.close().await.unwrap();
//! assert_eq!(summary.rows_written(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod compat;
pub mod config;
pub mod convert;
pub mod diagnostics;
pub mod format;
pub mod models;
pub mod router;
pub mod sync;
pub mod upload;
pub mod warehouse;

pub use compat::{Detection, DetectionReason, detect, select_strategy};
pub use config::{ConfigError, DestinationConfig, LoadingMethod, StagingSection};
pub use convert::{ConversionMode, SchemaConverter, SchemaError, convert};
pub use diagnostics::{
    CollectingSink, Diagnostic, DiagnosticKind, DiagnosticLevel, DiagnosticSink, TracingSink,
};
pub use format::{FormatError, FormatterBinding, RecordFormatter};
pub use models::{
    ConfiguredCatalog, DestinationSyncMode, FieldMode, FieldType, PhysicalField, PhysicalSchema,
    RawRecord, StreamKey, StreamSchema, Strategy, TableRef, UploadRecord,
};
pub use router::{RouteError, StreamOutcome, StreamReport, StreamRoute, StreamRouter};
pub use sync::{RecordOutcome, SyncError, SyncSession, SyncSummary};
#[cfg(feature = "staging")]
pub use upload::StagedUploader;
pub use upload::{
    LifecycleError, StreamUploader, StreamingUploader, UploadError, UploadSummary, UploaderKind,
    select_uploader,
};
pub use warehouse::{
    ExistingTableDescriptor, InMemoryWarehouse, StagedFile, WarehouseClient, WarehouseError,
    WriteDisposition,
};
