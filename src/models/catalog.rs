//! Configured catalog handed over by the sync control plane

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::info;

use super::stream::{DestinationSyncMode, StreamKey, StreamSchema};

/// Error while reading a configured catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to parse catalog: {0}")]
    ParseError(String),
    #[error("Stream declared twice in catalog: {0}")]
    DuplicateStream(StreamKey),
    #[error("Stream has an empty name")]
    EmptyStreamName,
}

/// Stream declaration inside the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub json_schema: Value,
}

/// One configured stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamDescriptor,
    #[serde(default)]
    pub destination_sync_mode: DestinationSyncMode,
}

/// The set of streams a sync writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Parse a catalog from its JSON representation
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        serde_json::from_str(json).map_err(|e| CatalogError::ParseError(e.to_string()))
    }

    /// Convert the catalog into per-stream schemas, rejecting duplicate keys
    pub fn stream_schemas(&self) -> Result<Vec<StreamSchema>, CatalogError> {
        let mut seen = HashSet::new();
        let mut schemas = Vec::with_capacity(self.streams.len());

        for configured in &self.streams {
            if configured.stream.name.is_empty() {
                return Err(CatalogError::EmptyStreamName);
            }
            let key = StreamKey {
                namespace: configured.stream.namespace.clone(),
                name: configured.stream.name.clone(),
            };
            if !seen.insert(key.clone()) {
                return Err(CatalogError::DuplicateStream(key));
            }
            schemas.push(StreamSchema {
                key,
                json_schema: configured.stream.json_schema.clone(),
                destination_sync_mode: configured.destination_sync_mode,
            });
        }

        info!("Loaded catalog with {} streams", schemas.len());
        Ok(schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog() {
        let json = r#"{
            "streams": [{
                "stream": {
                    "name": "users",
                    "namespace": "crm",
                    "json_schema": {"type": "object", "properties": {"id": {"type": "integer"}}}
                },
                "destination_sync_mode": "append_dedup",
                "cursor_field": ["updated_at"],
                "primary_key": [["id"]]
            }]
        }"#;
        let catalog = ConfiguredCatalog::from_json(json).unwrap();
        let schemas = catalog.stream_schemas().unwrap();

        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].key, StreamKey::namespaced("crm", "users"));
        assert_eq!(
            schemas[0].destination_sync_mode,
            DestinationSyncMode::AppendDedup
        );
    }

    #[test]
    fn test_sync_mode_defaults_to_append() {
        let json = r#"{"streams": [
            {"stream": {"name": "users", "json_schema": {}}},
            {"stream": {"name": "orders", "json_schema": {}}, "destination_sync_mode": "overwrite"}
        ]}"#;
        let schemas = ConfiguredCatalog::from_json(json)
            .unwrap()
            .stream_schemas()
            .unwrap();
        assert_eq!(schemas[0].destination_sync_mode, DestinationSyncMode::Append);
        assert_eq!(schemas[1].destination_sync_mode, DestinationSyncMode::Overwrite);
    }

    #[test]
    fn test_duplicate_stream_rejected() {
        let json = r#"{"streams": [
            {"stream": {"name": "users", "json_schema": {}}},
            {"stream": {"name": "users", "json_schema": {}}}
        ]}"#;
        let catalog = ConfiguredCatalog::from_json(json).unwrap();
        assert!(matches!(
            catalog.stream_schemas(),
            Err(CatalogError::DuplicateStream(_))
        ));
    }

    #[test]
    fn test_same_name_in_different_namespaces_is_allowed() {
        let json = r#"{"streams": [
            {"stream": {"name": "users", "namespace": "a", "json_schema": {}}},
            {"stream": {"name": "users", "namespace": "b", "json_schema": {}}}
        ]}"#;
        let catalog = ConfiguredCatalog::from_json(json).unwrap();
        assert_eq!(catalog.stream_schemas().unwrap().len(), 2);
    }
}
