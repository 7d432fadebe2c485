//! Warehouse client abstraction
//!
//! The destination core reads and creates tables, streams rows into temporary
//! tables, copies them into their targets, and loads staged files. Retries and
//! authentication belong to the client implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod memory;

pub use memory::InMemoryWarehouse;

use crate::models::{DestinationSyncMode, PhysicalSchema, TableRef, UploadRecord};

/// Error type for warehouse operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarehouseError {
    /// Target table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(TableRef),

    /// Table creation raced with another writer
    #[error("Table already exists: {0}")]
    TableAlreadyExists(TableRef),

    /// Streaming insert was rejected
    #[error("Insert into {table} failed: {reason}")]
    InsertFailed { table: TableRef, reason: String },

    /// Staged load job failed
    #[error("Load into {table} failed: {reason}")]
    LoadFailed { table: TableRef, reason: String },

    /// Copy job from a temporary table failed
    #[error("Copy into {table} failed: {reason}")]
    CopyFailed { table: TableRef, reason: String },

    /// Any other request failure
    #[error("Warehouse request failed: {0}")]
    RequestFailed(String),
}

/// Result type for warehouse operations
pub type WarehouseResult<T> = Result<T, WarehouseError>;

/// Snapshot of a target table, read once per stream per sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingTableDescriptor {
    /// The table does not exist yet
    Absent,
    /// The table exists; `schema` is `None` when it could not be read
    Present { schema: Option<PhysicalSchema> },
}

impl ExistingTableDescriptor {
    pub fn present(schema: PhysicalSchema) -> Self {
        Self::Present {
            schema: Some(schema),
        }
    }

    pub fn unreadable() -> Self {
        Self::Present { schema: None }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// How a commit treats rows already in the target table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Keep existing rows
    #[default]
    Append,
    /// Replace existing rows
    Truncate,
}

impl From<DestinationSyncMode> for WriteDisposition {
    fn from(mode: DestinationSyncMode) -> Self {
        match mode {
            DestinationSyncMode::Overwrite => WriteDisposition::Truncate,
            DestinationSyncMode::Append | DestinationSyncMode::AppendDedup => {
                WriteDisposition::Append
            }
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteDisposition::Append => write!(f, "WRITE_APPEND"),
            WriteDisposition::Truncate => write!(f, "WRITE_TRUNCATE"),
        }
    }
}

/// File format of a staged load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedFormat {
    Parquet,
}

impl fmt::Display for StagedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagedFormat::Parquet => write!(f, "parquet"),
        }
    }
}

/// An encoded file handed to the warehouse for a bulk load.
#[derive(Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Object name, `<prefix>/<table>_<uuid>.<format>`
    pub name: String,
    pub format: StagedFormat,
    pub bytes: Vec<u8>,
    /// Number of rows encoded in `bytes`
    pub row_count: usize,
    /// Leave the staged object in the bucket after the load
    pub keep_after_load: bool,
    pub disposition: WriteDisposition,
}

impl fmt::Debug for StagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedFile")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("bytes", &self.bytes.len())
            .field("row_count", &self.row_count)
            .field("keep_after_load", &self.keep_after_load)
            .field("disposition", &self.disposition)
            .finish()
    }
}

/// Warehouse operations used by the router and uploaders.
///
/// Implementations are shared between stream tasks, so they must be
/// `Send + Sync` and handle their own interior synchronization.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Read the current state of a table
    ///
    /// A table whose schema cannot be read is reported as
    /// [`ExistingTableDescriptor::Present`] with no schema, not as an error.
    async fn get_existing_table(&self, table: &TableRef)
    -> WarehouseResult<ExistingTableDescriptor>;

    /// Create a dataset in `location` unless it already exists
    async fn create_dataset(&self, dataset: &str, location: &str) -> WarehouseResult<()>;

    /// Create a table with the given schema
    async fn create_table(&self, table: &TableRef, schema: &PhysicalSchema)
    -> WarehouseResult<()>;

    /// Stream a batch of rows into a table
    async fn insert_rows(&self, table: &TableRef, rows: Vec<UploadRecord>)
    -> WarehouseResult<()>;

    /// Copy every row of `source` into `destination` in one job
    async fn copy_table(
        &self,
        source: &TableRef,
        destination: &TableRef,
        disposition: WriteDisposition,
    ) -> WarehouseResult<()>;

    /// Delete a table
    async fn drop_table(&self, table: &TableRef) -> WarehouseResult<()>;

    /// Stage a file and load it into a table in one job, honouring the file's
    /// write disposition
    async fn stage_and_load(&self, table: &TableRef, file: StagedFile) -> WarehouseResult<()>;
}
