//! Diagnostics reported to the sync control plane
//!
//! The router and the sync session never log user-facing problems directly;
//! they emit [`Diagnostic`]s into a [`DiagnosticSink`] supplied by the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

use crate::models::StreamKey;

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Fatal,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Info => write!(f, "info"),
            DiagnosticLevel::Warning => write!(f, "warning"),
            DiagnosticLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// What a diagnostic is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A stream was bound to its table, strategy and uploader
    StreamBound,
    /// The stream is written with the legacy layout
    LegacyFallback,
    /// The existing schema could not be read; the modern layout is used
    SchemaUnreadable,
    /// The stream schema has no physical mapping; the stream is disabled
    UnsupportedSchema,
    /// Records arrived for a stream missing from the catalog
    UnknownStream,
    /// The stream was aborted after a warehouse or record failure
    StreamAborted,
    /// The whole sync was aborted
    SyncAborted,
}

/// One diagnostic event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub kind: DiagnosticKind,
    /// Stream the event concerns, if any
    pub stream: Option<StreamKey>,
    pub message: String,
}

impl Diagnostic {
    pub fn info(kind: DiagnosticKind, stream: &StreamKey, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            kind,
            stream: Some(stream.clone()),
            message: message.into(),
        }
    }

    pub fn warning(kind: DiagnosticKind, stream: &StreamKey, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            kind,
            stream: Some(stream.clone()),
            message: message.into(),
        }
    }

    pub fn fatal(kind: DiagnosticKind, stream: Option<&StreamKey>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Fatal,
            kind,
            stream: stream.cloned(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stream {
            Some(stream) => write!(f, "[{}] {}: {}", self.level, stream, self.message),
            None => write!(f, "[{}] {}", self.level, self.message),
        }
    }
}

/// Receiver of diagnostics
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Sink forwarding every diagnostic to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        let stream = diagnostic
            .stream
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match diagnostic.level {
            DiagnosticLevel::Info => info!(stream = %stream, kind = ?diagnostic.kind, "{}", diagnostic.message),
            DiagnosticLevel::Warning => warn!(stream = %stream, kind = ?diagnostic.kind, "{}", diagnostic.message),
            DiagnosticLevel::Fatal => error!(stream = %stream, kind = ?diagnostic.kind, "{}", diagnostic.message),
        }
    }
}

/// Sink keeping every diagnostic in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All diagnostics emitted so far, in emission order
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Diagnostics of one kind
    pub fn of_kind(&self, kind: DiagnosticKind) -> Vec<Diagnostic> {
        self.diagnostics()
            .into_iter()
            .filter(|d| d.kind == kind)
            .collect()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        let stream = StreamKey::new("users");
        sink.emit(Diagnostic::warning(
            DiagnosticKind::LegacyFallback,
            &stream,
            "existing-schema-mismatch",
        ));
        sink.emit(Diagnostic::fatal(DiagnosticKind::SyncAborted, None, "stopped"));

        let all = sink.diagnostics();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].level, DiagnosticLevel::Warning);
        assert_eq!(all[0].to_string(), "[warning] users: existing-schema-mismatch");
        assert_eq!(all[1].to_string(), "[fatal] stopped");
        assert_eq!(sink.of_kind(DiagnosticKind::SyncAborted).len(), 1);
    }
}
