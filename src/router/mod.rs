//! Stream router
//!
//! Sync-scoped registry holding, per stream, one formatter binding and one
//! uploader. The first record of a stream resolves everything the stream needs:
//!
//! 1. convert the declared schema to the denormalized layout
//! 2. read the existing table once
//! 3. detect the strategy
//! 4. convert to the flattened layout, only for the legacy strategy
//! 5. create the dataset and table when the table is absent
//! 6. build the formatter and select the uploader, committing with the
//!    stream's write disposition
//!
//! Later records reuse the result. Resolution runs once per stream even when
//! several tasks race on its first record, and failures are cached too, so a
//! broken stream is never retried within a sync.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info, warn};

use crate::compat::{Detection, DetectionReason, detect};
use crate::config::DestinationConfig;
use crate::convert::{ConversionMode, SchemaConverter, SchemaError, table_ref_for};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::format::{FormatError, FormatterBinding, RecordFormatter};
use crate::models::{PhysicalSchema, RawRecord, StreamKey, StreamSchema, Strategy, TableRef};
use crate::upload::{StreamUploader, UploadError, UploadSummary, UploaderKind, select_uploader};
use crate::warehouse::{WarehouseClient, WarehouseError, WriteDisposition};

/// Error type for routing records
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Stream {0} is not part of the configured catalog")]
    UnknownStream(StreamKey),

    #[error("Schema of stream {stream} is not supported: {source}")]
    Schema {
        stream: StreamKey,
        #[source]
        source: SchemaError,
    },

    #[error("Warehouse request for stream {stream} failed: {source}")]
    Warehouse {
        stream: StreamKey,
        #[source]
        source: WarehouseError,
    },

    #[error("Record of stream {stream} rejected: {source}")]
    Format {
        stream: StreamKey,
        #[source]
        source: FormatError,
    },

    #[error("Upload for stream {stream} failed: {source}")]
    Upload {
        stream: StreamKey,
        #[source]
        source: UploadError,
    },

    #[error("Stream {stream} was aborted earlier: {reason}")]
    StreamAborted { stream: StreamKey, reason: String },
}

impl RouteError {
    /// Whether the error must abort the whole sync rather than one stream
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouteError::Upload { source, .. } if source.is_fatal())
    }

    /// Stream the error belongs to
    pub fn stream(&self) -> &StreamKey {
        match self {
            RouteError::UnknownStream(stream) => stream,
            RouteError::Schema { stream, .. }
            | RouteError::Warehouse { stream, .. }
            | RouteError::Format { stream, .. }
            | RouteError::Upload { stream, .. }
            | RouteError::StreamAborted { stream, .. } => stream,
        }
    }
}

/// Result type for routing
pub type RouteResult<T> = Result<T, RouteError>;

/// Resolved write path of one stream
pub struct StreamRoute {
    binding: FormatterBinding,
    detection: Detection,
    uploader_kind: UploaderKind,
    uploader: AsyncMutex<RouteUploader>,
}

struct RouteUploader {
    uploader: Box<dyn StreamUploader>,
    /// Set once the stream was aborted; later records are refused
    failure: Option<RouteError>,
}

impl StreamRoute {
    pub fn binding(&self) -> &FormatterBinding {
        &self.binding
    }

    pub fn detection(&self) -> &Detection {
        &self.detection
    }

    pub fn strategy(&self) -> Strategy {
        self.binding.strategy()
    }

    pub fn uploader_kind(&self) -> UploaderKind {
        self.uploader_kind
    }
}

#[derive(Default)]
struct RouteSlot {
    route: OnceCell<RouteResult<Arc<StreamRoute>>>,
}

/// Final state of a stream at the end of a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Everything accepted was committed
    Completed { summary: UploadSummary },
    /// The stream was aborted and nothing buffered was committed
    Aborted { reason: String },
    /// The stream never got a write path
    Disabled { reason: String },
}

/// Per-stream line of a sync report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReport {
    pub stream: StreamKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<UploaderKind>,
    pub outcome: StreamOutcome,
}

/// Registry of stream write paths for one sync.
///
/// The registry lock is held only to find or insert a stream's slot, never
/// across warehouse calls.
pub struct StreamRouter {
    config: Arc<DestinationConfig>,
    schemas: HashMap<StreamKey, StreamSchema>,
    warehouse: Arc<dyn WarehouseClient>,
    sink: Arc<dyn DiagnosticSink>,
    converter: SchemaConverter,
    slots: Mutex<HashMap<StreamKey, Arc<RouteSlot>>>,
}

impl StreamRouter {
    pub fn new(
        config: Arc<DestinationConfig>,
        schemas: Vec<StreamSchema>,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let schemas = schemas
            .into_iter()
            .map(|schema| (schema.key.clone(), schema))
            .collect();
        Self {
            config,
            schemas,
            warehouse,
            sink,
            converter: SchemaConverter::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Number of streams that received at least one record
    pub fn stream_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Resolve, or reuse, the write path of a stream
    pub async fn binding(&self, key: &StreamKey) -> RouteResult<Arc<StreamRoute>> {
        let slot = self.slot(key);
        let route = slot.route.get_or_init(|| self.build_route(key)).await;
        route.clone()
    }

    /// Format a record and hand it to its stream's uploader.
    ///
    /// Records of one stream must be routed one at a time by the caller to keep
    /// their order; the per-stream uploader lock serializes concurrent callers.
    pub async fn route(&self, record: RawRecord) -> RouteResult<()> {
        let route = self.binding(&record.stream).await?;
        let mut state = route.uploader.lock().await;
        if let Some(failure) = &state.failure {
            return Err(RouteError::StreamAborted {
                stream: record.stream.clone(),
                reason: failure.to_string(),
            });
        }

        let rendered = match route.binding.render(&record) {
            Ok(rendered) => rendered,
            Err(source) => {
                let err = RouteError::Format {
                    stream: record.stream.clone(),
                    source,
                };
                return Err(self.abort_stream(&mut state, err).await);
            }
        };

        if let Err(source) = state.uploader.accept(rendered).await {
            let err = RouteError::Upload {
                stream: record.stream.clone(),
                source,
            };
            if err.is_fatal() {
                return Err(err);
            }
            return Err(self.abort_stream(&mut state, err).await);
        }
        Ok(())
    }

    /// Finalize every stream and report its outcome, in stream order.
    ///
    /// # Errors
    ///
    /// Only a fatal error stops finalization; stream-scoped failures are
    /// reported as [`StreamOutcome::Aborted`].
    pub async fn finalize_all(&self) -> RouteResult<Vec<StreamReport>> {
        let mut reports = Vec::new();
        for (key, slot) in self.snapshot() {
            let route = match slot.route.get() {
                Some(Ok(route)) => route.clone(),
                Some(Err(err)) => {
                    reports.push(StreamReport {
                        stream: key,
                        table: None,
                        strategy: None,
                        uploader: None,
                        outcome: StreamOutcome::Disabled {
                            reason: err.to_string(),
                        },
                    });
                    continue;
                }
                None => continue,
            };

            let mut state = route.uploader.lock().await;
            let earlier_failure = state.failure.as_ref().map(ToString::to_string);
            let outcome = match earlier_failure {
                Some(reason) => StreamOutcome::Aborted { reason },
                None => match state.uploader.finalize().await {
                    Ok(summary) => StreamOutcome::Completed { summary },
                    Err(source) => {
                        let err = RouteError::Upload {
                            stream: key.clone(),
                            source,
                        };
                        if err.is_fatal() {
                            return Err(err);
                        }
                        let err = self.abort_stream(&mut state, err).await;
                        StreamOutcome::Aborted {
                            reason: err.to_string(),
                        }
                    }
                },
            };
            reports.push(StreamReport {
                stream: key,
                table: Some(route.binding.table().clone()),
                strategy: Some(route.strategy()),
                uploader: Some(route.uploader_kind),
                outcome,
            });
        }
        Ok(reports)
    }

    /// Abort every stream, discarding whatever is still buffered
    pub async fn abort_all(&self) {
        for (key, slot) in self.snapshot() {
            if let Some(Ok(route)) = slot.route.get() {
                let mut state = route.uploader.lock().await;
                state.uploader.abort().await;
                debug!("Aborted stream {}", key);
            }
        }
    }

    fn slot(&self, key: &StreamKey) -> Arc<RouteSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    fn snapshot(&self) -> Vec<(StreamKey, Arc<RouteSlot>)> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = slots
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    async fn build_route(&self, key: &StreamKey) -> RouteResult<Arc<StreamRoute>> {
        let Some(schema) = self.schemas.get(key) else {
            self.sink.emit(Diagnostic::warning(
                DiagnosticKind::UnknownStream,
                key,
                "records received for a stream that is not in the catalog",
            ));
            return Err(RouteError::UnknownStream(key.clone()));
        };
        let table = table_ref_for(key, &self.config.dataset_id);

        let modern = self.convert(schema, ConversionMode::Denormalized)?;
        let existing = self
            .warehouse
            .get_existing_table(&table)
            .await
            .map_err(|source| self.warehouse_failure(key, source))?;
        let detection = detect(&existing, &modern);
        self.report_detection(key, &table, &detection);

        let physical = match detection.strategy {
            Strategy::Modern => modern,
            Strategy::Legacy => self.convert(schema, ConversionMode::Flattened)?,
        };

        if existing.is_absent() {
            self.warehouse
                .create_dataset(&table.dataset, &self.config.dataset_location)
                .await
                .map_err(|source| self.warehouse_failure(key, source))?;
            self.warehouse
                .create_table(&table, &physical)
                .await
                .map_err(|source| self.warehouse_failure(key, source))?;
            info!("Created table {} with {} columns", table, physical.len());
        }

        let formatter = RecordFormatter::new(key.clone(), physical, detection.strategy);
        let binding = FormatterBinding::new(key.clone(), table, formatter);
        let disposition = WriteDisposition::from(schema.destination_sync_mode);
        let uploader = select_uploader(&self.config, &binding, disposition, self.warehouse.clone());
        let uploader_kind = uploader.kind();

        info!(
            "Bound stream {} to {} ({} strategy, {} uploader, {})",
            key,
            binding.table(),
            binding.strategy(),
            uploader_kind,
            disposition
        );
        self.sink.emit(Diagnostic::info(
            DiagnosticKind::StreamBound,
            key,
            format!(
                "writing to {} with the {} strategy through the {} uploader",
                binding.table(),
                binding.strategy(),
                uploader_kind
            ),
        ));

        Ok(Arc::new(StreamRoute {
            binding,
            detection,
            uploader_kind,
            uploader: AsyncMutex::new(RouteUploader {
                uploader,
                failure: None,
            }),
        }))
    }

    fn convert(&self, schema: &StreamSchema, mode: ConversionMode) -> RouteResult<PhysicalSchema> {
        self.converter.convert(schema, mode).map_err(|source| {
            self.sink.emit(Diagnostic::fatal(
                DiagnosticKind::UnsupportedSchema,
                Some(&schema.key),
                format!("stream disabled: {}", source),
            ));
            RouteError::Schema {
                stream: schema.key.clone(),
                source,
            }
        })
    }

    fn warehouse_failure(&self, key: &StreamKey, source: WarehouseError) -> RouteError {
        self.sink.emit(Diagnostic::fatal(
            DiagnosticKind::StreamAborted,
            Some(key),
            format!("stream aborted: {}", source),
        ));
        RouteError::Warehouse {
            stream: key.clone(),
            source,
        }
    }

    fn report_detection(&self, key: &StreamKey, table: &TableRef, detection: &Detection) {
        match &detection.reason {
            DetectionReason::TableAbsent => info!("Table {} does not exist yet", table),
            DetectionReason::SchemaMatches => {
                info!("Table {} matches the denormalized layout", table)
            }
            DetectionReason::SchemaUnreadable => {
                warn!("Schema of table {} could not be read", table);
                self.sink.emit(Diagnostic::warning(
                    DiagnosticKind::SchemaUnreadable,
                    key,
                    format!(
                        "{}: schema of {} could not be read, using the denormalized layout",
                        detection.reason, table
                    ),
                ));
            }
            DetectionReason::SchemaMismatch { columns } => {
                warn!(
                    "Table {} differs from the denormalized layout in {:?}, writing arrays as JSON strings",
                    table, columns
                );
                self.sink.emit(Diagnostic::warning(
                    DiagnosticKind::LegacyFallback,
                    key,
                    format!(
                        "{}: {} differs in columns [{}], writing arrays as JSON strings",
                        detection.reason,
                        table,
                        columns.join(", ")
                    ),
                ));
            }
        }
    }

    async fn abort_stream(&self, state: &mut RouteUploader, err: RouteError) -> RouteError {
        state.uploader.abort().await;
        warn!("Aborting stream {}: {}", err.stream(), err);
        self.sink.emit(Diagnostic::fatal(
            DiagnosticKind::StreamAborted,
            Some(err.stream()),
            format!("stream aborted: {}", err),
        ));
        state.failure = Some(err.clone());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::warehouse::InMemoryWarehouse;
    use serde_json::json;

    fn schema(name: &str) -> StreamSchema {
        StreamSchema::new(
            StreamKey::new(name),
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                }
            }),
        )
    }

    fn router(warehouse: Arc<InMemoryWarehouse>, sink: Arc<CollectingSink>) -> StreamRouter {
        StreamRouter::new(
            Arc::new(DestinationConfig::new("p", "ds")),
            vec![schema("users")],
            warehouse,
            sink,
        )
    }

    #[tokio::test]
    async fn test_binding_is_resolved_once() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let router = router(warehouse.clone(), Arc::new(CollectingSink::new()));
        let key = StreamKey::new("users");

        let first = router.binding(&key).await.unwrap();
        let second = router.binding(&key).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(warehouse.lookup_count(&TableRef::new("ds", "users")), 1);
        assert_eq!(first.strategy(), Strategy::Modern);
        assert_eq!(first.detection().reason, DetectionReason::TableAbsent);
        assert!(warehouse.has_table(&TableRef::new("ds", "users")));
    }

    #[tokio::test]
    async fn test_unknown_stream_is_rejected() {
        let sink = Arc::new(CollectingSink::new());
        let router = router(Arc::new(InMemoryWarehouse::new()), sink.clone());
        let err = router
            .route(RawRecord::new(StreamKey::new("ghost"), json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::UnknownStream(StreamKey::new("ghost")));
        assert!(!err.is_fatal());
        assert_eq!(sink.of_kind(DiagnosticKind::UnknownStream).len(), 1);
    }

    #[tokio::test]
    async fn test_format_error_aborts_stream() {
        let sink = Arc::new(CollectingSink::new());
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let router = router(warehouse.clone(), sink.clone());
        let key = StreamKey::new("users");

        router
            .route(RawRecord::new(key.clone(), json!({"id": 1})))
            .await
            .unwrap();
        let err = router
            .route(RawRecord::new(key.clone(), json!("not an object")))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Format { .. }));

        let err = router
            .route(RawRecord::new(key.clone(), json!({"id": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::StreamAborted { .. }));

        let reports = router.finalize_all().await.unwrap();
        assert!(matches!(reports[0].outcome, StreamOutcome::Aborted { .. }));
        assert!(warehouse.rows(&TableRef::new("ds", "users")).is_empty());
        assert_eq!(sink.of_kind(DiagnosticKind::StreamAborted).len(), 1);
    }
}
