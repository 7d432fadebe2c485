//! Uploaders
//!
//! An uploader owns the write path of one stream. Two implementations exist:
//! - [`StreamingUploader`]: batched streaming inserts
//! - [`StagedUploader`]: rows encoded to one Parquet file, loaded at finalize
//!   (requires the `staging` feature)
//!
//! Every uploader follows the same lifecycle: any number of `accept` calls,
//! then exactly one effective `finalize` or `abort`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod selector;
#[cfg(feature = "staging")]
pub mod staged;
pub mod streaming;

pub use selector::select_uploader;
#[cfg(feature = "staging")]
pub use staged::StagedUploader;
pub use streaming::StreamingUploader;

use crate::models::{TableRef, UploadRecord};
use crate::warehouse::WarehouseError;

/// Write path used by an uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploaderKind {
    Streaming,
    StagedBulk,
}

impl fmt::Display for UploaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploaderKind::Streaming => write!(f, "streaming"),
            UploaderKind::StagedBulk => write!(f, "staged-bulk"),
        }
    }
}

/// Lifecycle state of an uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderState {
    Open,
    Finalized,
    Aborted,
}

impl fmt::Display for UploaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploaderState::Open => write!(f, "open"),
            UploaderState::Finalized => write!(f, "finalized"),
            UploaderState::Aborted => write!(f, "aborted"),
        }
    }
}

/// An uploader was used after it was closed.
///
/// This is a programming error in the caller and aborts the whole sync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot {operation} on the uploader for {table}: uploader is {state}")]
pub struct LifecycleError {
    pub table: TableRef,
    pub state: UploaderState,
    pub operation: &'static str,
}

/// Error type for uploads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    /// Rows could not be encoded for a staged load
    #[error("Encoding rows for {table} failed: {reason}")]
    Encoding { table: TableRef, reason: String },
}

impl UploadError {
    /// Whether the error must abort the whole sync rather than one stream
    pub fn is_fatal(&self) -> bool {
        matches!(self, UploadError::Lifecycle(_))
    }
}

/// Result type for uploads
pub type UploadResult<T> = Result<T, UploadError>;

/// What an uploader wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub table: TableRef,
    pub kind: UploaderKind,
    /// Rows handed to the warehouse
    pub rows: usize,
    /// Insert calls or encoded batches
    pub batches: usize,
    /// Name of the staged file, for staged loads that wrote one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_file: Option<String>,
}

/// Write path of one stream.
///
/// Calls for one stream are serialized by the router, so implementations hold
/// plain mutable buffers.
#[async_trait]
pub trait StreamUploader: Send {
    fn kind(&self) -> UploaderKind;

    fn table(&self) -> &TableRef;

    fn state(&self) -> UploaderState;

    /// Buffer a row, flushing when a batch is full
    ///
    /// # Errors
    ///
    /// [`LifecycleError`] after `finalize` or `abort`; a warehouse or encoding
    /// error when a flush fails.
    async fn accept(&mut self, record: UploadRecord) -> UploadResult<()>;

    /// Flush and commit everything buffered
    ///
    /// Only the first call writes; later calls return the same summary.
    /// Finalizing an aborted uploader is a [`LifecycleError`].
    async fn finalize(&mut self) -> UploadResult<UploadSummary>;

    /// Discard buffered rows without committing them
    ///
    /// Aborting a closed uploader has no effect.
    async fn abort(&mut self);
}

/// Guard shared by uploader implementations: fail unless still open.
pub(crate) fn ensure_open(
    state: UploaderState,
    table: &TableRef,
    operation: &'static str,
) -> Result<(), LifecycleError> {
    match state {
        UploaderState::Open => Ok(()),
        closed => Err(LifecycleError {
            table: table.clone(),
            state: closed,
            operation,
        }),
    }
}
