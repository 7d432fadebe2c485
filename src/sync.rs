//! Sync session
//!
//! Drives one sync: records go through the [`StreamRouter`], stream-scoped
//! failures disable their stream, and a fatal failure aborts everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{ConfigError, DestinationConfig};
use crate::convert::table_ref_for;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::models::{
    CatalogError, ConfiguredCatalog, RawRecord, StreamKey, StreamSchema, TableRef,
};
use crate::router::{RouteError, StreamOutcome, StreamReport, StreamRouter};
use crate::warehouse::WarehouseClient;

/// Records buffered per stream worker in [`SyncSession::run`]
const WORKER_QUEUE_SIZE: usize = 1024;

/// Error type for a sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// Two streams would write the same table
    #[error("Streams {first} and {second} both map to table {table}")]
    TableCollision {
        first: StreamKey,
        second: StreamKey,
        table: TableRef,
    },

    /// A fatal error in one stream aborted the sync
    #[error("Sync aborted by stream {stream}: {source}")]
    Fatal {
        stream: StreamKey,
        #[source]
        source: RouteError,
    },

    #[error("Sync was already aborted")]
    Aborted,

    #[error("Stream worker failed: {0}")]
    Worker(String),
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Handed to the stream's uploader
    Accepted,
    /// Dropped because its stream is disabled or was aborted
    Skipped { reason: String },
}

/// Result of a completed sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_accepted: usize,
    pub records_skipped: usize,
    /// One entry per stream that received records, in stream order
    pub streams: Vec<StreamReport>,
}

impl SyncSummary {
    pub fn stream(&self, key: &StreamKey) -> Option<&StreamReport> {
        self.streams.iter().find(|report| &report.stream == key)
    }

    /// Rows committed across all completed streams
    pub fn rows_written(&self) -> usize {
        self.streams
            .iter()
            .map(|report| match &report.outcome {
                StreamOutcome::Completed { summary } => summary.rows,
                _ => 0,
            })
            .sum()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// One sync from first record to close or abort.
pub struct SyncSession {
    router: StreamRouter,
    sink: Arc<dyn DiagnosticSink>,
    started_at: DateTime<Utc>,
    accepted: AtomicUsize,
    skipped: AtomicUsize,
    aborted: AtomicBool,
}

impl SyncSession {
    /// Start a sync after validating the configuration
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, or when two streams sanitize to the
    /// same target table.
    pub fn new(
        config: DestinationConfig,
        schemas: Vec<StreamSchema>,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        check_table_collisions(&config, &schemas)?;
        info!(
            "Starting sync into {}.{} with {} streams",
            config.project_id,
            config.dataset_id,
            schemas.len()
        );
        let router = StreamRouter::new(Arc::new(config), schemas, warehouse, sink.clone());
        Ok(Self {
            router,
            sink,
            started_at: Utc::now(),
            accepted: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        })
    }

    /// Start a sync for every stream of a configured catalog
    pub fn from_catalog(
        config: DestinationConfig,
        catalog: &ConfiguredCatalog,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, SyncError> {
        Self::new(config, catalog.stream_schemas()?, warehouse, sink)
    }

    pub fn router(&self) -> &StreamRouter {
        &self.router
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Route one record.
    ///
    /// Stream-scoped failures skip the record and leave other streams running.
    ///
    /// # Errors
    ///
    /// A fatal error aborts every stream and is returned as
    /// [`SyncError::Fatal`]; any later call fails with [`SyncError::Aborted`].
    pub async fn process(&self, record: RawRecord) -> Result<RecordOutcome, SyncError> {
        if self.is_aborted() {
            return Err(SyncError::Aborted);
        }

        match self.router.route(record).await {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(RecordOutcome::Accepted)
            }
            Err(err) if err.is_fatal() => {
                let stream = err.stream().clone();
                self.fail(&stream, &err).await;
                Err(SyncError::Fatal {
                    stream,
                    source: err,
                })
            }
            Err(err) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Skipping record: {}", err);
                Ok(RecordOutcome::Skipped {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Consume a record channel to the end, then close the sync.
    ///
    /// Each stream gets its own worker task, so streams progress concurrently
    /// while records of one stream keep their channel order.
    pub async fn run(self, mut records: mpsc::Receiver<RawRecord>) -> Result<SyncSummary, SyncError> {
        let session = Arc::new(self);
        let mut workers: HashMap<StreamKey, mpsc::Sender<RawRecord>> = HashMap::new();
        let mut tasks = JoinSet::new();

        while let Some(record) = records.recv().await {
            if session.is_aborted() {
                break;
            }
            let sender = workers.entry(record.stream.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE_SIZE);
                tasks.spawn(session.clone().drain(rx));
                tx
            });
            if sender.send(record).await.is_err() {
                // the worker stopped on a fatal error
                break;
            }
        }
        drop(workers);

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(SyncError::Worker(e.to_string())));
            if let Err(err) = result {
                failure.get_or_insert(err);
            }
        }

        if let Some(err) = failure {
            if !session.is_aborted() {
                session.router.abort_all().await;
                session.aborted.store(true, Ordering::SeqCst);
            }
            return Err(err);
        }

        let session = Arc::into_inner(session)
            .ok_or_else(|| SyncError::Worker("stream worker still running".to_string()))?;
        session.close().await
    }

    /// Finalize every stream and report the sync
    pub async fn close(self) -> Result<SyncSummary, SyncError> {
        if self.is_aborted() {
            return Err(SyncError::Aborted);
        }

        let streams = match self.router.finalize_all().await {
            Ok(streams) => streams,
            Err(err) => {
                let stream = err.stream().clone();
                self.fail(&stream, &err).await;
                return Err(SyncError::Fatal {
                    stream,
                    source: err,
                });
            }
        };

        let summary = SyncSummary {
            started_at: self.started_at,
            finished_at: Utc::now(),
            records_accepted: self.accepted.load(Ordering::Relaxed),
            records_skipped: self.skipped.load(Ordering::Relaxed),
            streams,
        };
        info!(
            "Sync finished: {} rows written across {} streams, {} records skipped",
            summary.rows_written(),
            summary.streams.len(),
            summary.records_skipped
        );
        Ok(summary)
    }

    /// Abort the sync, discarding every buffered row
    pub async fn abort(self) {
        if !self.is_aborted() {
            self.router.abort_all().await;
            self.aborted.store(true, Ordering::SeqCst);
        }
        info!("Sync aborted after {} accepted records", self.accepted.load(Ordering::Relaxed));
    }

    async fn drain(self: Arc<Self>, mut records: mpsc::Receiver<RawRecord>) -> Result<(), SyncError> {
        while let Some(record) = records.recv().await {
            self.process(record).await?;
        }
        Ok(())
    }

    async fn fail(&self, stream: &StreamKey, err: &RouteError) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Aborting sync after fatal error in stream {}: {}", stream, err);
        self.router.abort_all().await;
        self.sink.emit(Diagnostic::fatal(
            DiagnosticKind::SyncAborted,
            Some(stream),
            format!("sync aborted: {}", err),
        ));
    }
}

fn check_table_collisions(
    config: &DestinationConfig,
    schemas: &[StreamSchema],
) -> Result<(), SyncError> {
    let mut owners: HashMap<TableRef, &StreamKey> = HashMap::new();
    for schema in schemas {
        let table = table_ref_for(&schema.key, &config.dataset_id);
        if let Some(first) = owners.insert(table.clone(), &schema.key) {
            return Err(SyncError::TableCollision {
                first: first.clone(),
                second: schema.key.clone(),
                table,
            });
        }
    }
    Ok(())
}
