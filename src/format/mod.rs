//! Record formatting
//!
//! A [`RecordFormatter`] renders raw records against one physical schema and one
//! [`Strategy`](crate::models::Strategy), both fixed at construction. A
//! [`FormatterBinding`] ties a formatter to its stream and target table for the
//! duration of a sync.

pub mod formatter;

pub use formatter::RecordFormatter;

use crate::models::{
    PhysicalSchema, RawRecord, StreamKey, Strategy, TableRef, UploadRecord,
};

/// Error raised when a record cannot be rendered
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("Record of stream {stream} is not a JSON object (found {found})")]
    NotAnObject {
        stream: StreamKey,
        found: &'static str,
    },
    #[error("Record of stream {record_stream} sent to the formatter of stream {bound_stream}")]
    WrongStream {
        bound_stream: StreamKey,
        record_stream: StreamKey,
    },
}

/// Result type for record formatting
pub type FormatResult<T> = Result<T, FormatError>;

/// The formatter resolved for one stream, with the table it writes to.
///
/// Strategy and physical schema never change once the binding exists.
#[derive(Debug, Clone)]
pub struct FormatterBinding {
    stream: StreamKey,
    table: TableRef,
    formatter: RecordFormatter,
}

impl FormatterBinding {
    pub fn new(stream: StreamKey, table: TableRef, formatter: RecordFormatter) -> Self {
        Self {
            stream,
            table,
            formatter,
        }
    }

    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn strategy(&self) -> Strategy {
        self.formatter.strategy()
    }

    pub fn schema(&self) -> &PhysicalSchema {
        self.formatter.schema()
    }

    /// Render a record of the bound stream
    pub fn render(&self, record: &RawRecord) -> FormatResult<UploadRecord> {
        if record.stream != self.stream {
            return Err(FormatError::WrongStream {
                bound_stream: self.stream.clone(),
                record_stream: record.stream.clone(),
            });
        }
        self.formatter.render(record)
    }
}
