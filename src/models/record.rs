//! Raw and rendered records

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::stream::StreamKey;

/// How array-valued fields are laid out in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Arrays stay native repeated values
    Modern,
    /// Arrays are written as JSON-encoded strings, matching tables created
    /// before nested-field support
    Legacy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Modern => write!(f, "modern"),
            Strategy::Legacy => write!(f, "legacy"),
        }
    }
}

/// A record as received from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stream the record belongs to
    pub stream: StreamKey,
    /// Record payload
    pub data: Value,
    /// When the source emitted the record
    pub emitted_at: DateTime<Utc>,
}

impl RawRecord {
    /// Create a record emitted now
    pub fn new(stream: StreamKey, data: Value) -> Self {
        Self {
            stream,
            data,
            emitted_at: Utc::now(),
        }
    }

    /// Create a record with an emission time in epoch milliseconds
    pub fn with_emitted_millis(stream: StreamKey, data: Value, emitted_at_ms: i64) -> Self {
        let emitted_at = Utc
            .timestamp_millis_opt(emitted_at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            stream,
            data,
            emitted_at,
        }
    }
}

/// A rendered row, ready for an uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Strategy the row was rendered with
    pub strategy: Strategy,
    /// Column values keyed by physical column name
    pub row: Map<String, Value>,
}

impl UploadRecord {
    /// Value of a top-level column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }
}
