//! Compatibility detection between existing tables and generated schemas
//!
//! Decides, once per stream per sync, whether rows are written with the modern
//! (nested) layout or the legacy (JSON-encoded list) layout. Tables are never
//! migrated.

pub mod detector;

pub use detector::{Detection, DetectionReason, detect, select_strategy};
