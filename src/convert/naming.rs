//! Warehouse identifier sanitizing.
//!
//! # Rules
//!
//! - Characters outside `[A-Za-z0-9_]` become `_`
//! - A leading digit gets a `_` prefix
//! - Empty names become `_`
//! - Names are cut to 300 characters

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{StreamKey, TableRef};

/// Maximum identifier length accepted by the warehouse
pub const MAX_IDENTIFIER_LENGTH: usize = 300;

static RE_INVALID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("Invalid regex"));

/// Sanitize a name into a valid warehouse identifier.
///
/// # Examples
///
/// ```
/// use bigquery_denormalized::convert::naming::sanitize_identifier;
///
/// assert_eq!(sanitize_identifier("first-name"), "first_name");
/// assert_eq!(sanitize_identifier("2fa"), "_2fa");
/// assert_eq!(sanitize_identifier("user_id"), "user_id");
/// ```
pub fn sanitize_identifier(name: &str) -> String {
    let mut sanitized = RE_INVALID_CHARS.replace_all(name, "_").into_owned();
    if sanitized.is_empty() {
        return "_".to_string();
    }
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    if sanitized.len() > MAX_IDENTIFIER_LENGTH {
        sanitized.truncate(MAX_IDENTIFIER_LENGTH);
    }
    sanitized
}

/// Target table for a stream: the sanitized namespace (or the default dataset)
/// and the sanitized stream name.
pub fn table_ref_for(key: &StreamKey, default_dataset: &str) -> TableRef {
    let dataset = match key.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => sanitize_identifier(ns),
        _ => sanitize_identifier(default_dataset),
    };
    TableRef::new(dataset, sanitize_identifier(&key.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_identifier("order.total"), "order_total");
        assert_eq!(sanitize_identifier("a b-c"), "a_b_c");
        assert_eq!(sanitize_identifier("café"), "caf_");
    }

    #[test]
    fn test_sanitize_edge_cases() {
        assert_eq!(sanitize_identifier(""), "_");
        assert_eq!(sanitize_identifier("9lives"), "_9lives");
        let long = "x".repeat(400);
        assert_eq!(sanitize_identifier(&long).len(), MAX_IDENTIFIER_LENGTH);
    }

    #[test]
    fn test_table_ref_uses_namespace_or_default_dataset() {
        let key = StreamKey::namespaced("sales-eu", "orders v2");
        assert_eq!(
            table_ref_for(&key, "default_ds"),
            TableRef::new("sales_eu", "orders_v2")
        );

        let key = StreamKey::new("orders");
        assert_eq!(
            table_ref_for(&key, "default_ds"),
            TableRef::new("default_ds", "orders")
        );
    }
}
