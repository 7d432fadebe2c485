//! Destination configuration
//!
//! Handles parsing of `destination.toml` files and of the connector's JSON
//! configuration, plus environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Default configuration filename
pub const CONFIG_FILENAME: &str = "destination.toml";

/// Environment variable for the project id
pub const ENV_PROJECT_ID: &str = "BQ_DESTINATION_PROJECT_ID";

/// Environment variable for the default dataset
pub const ENV_DATASET_ID: &str = "BQ_DESTINATION_DATASET_ID";

/// Environment variable for the loading method (`standard` or `staged`)
pub const ENV_LOADING_METHOD: &str = "BQ_DESTINATION_LOADING_METHOD";

/// Environment variable for the streaming batch size
pub const ENV_BATCH_SIZE: &str = "BQ_DESTINATION_BATCH_SIZE";

/// Error type for configuration handling
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Staging bucket settings for staged bulk loads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSection {
    /// Bucket receiving the staged files
    #[serde(default, alias = "gcs_bucket_name")]
    pub bucket: String,

    /// Object prefix inside the bucket
    #[serde(default, alias = "gcs_bucket_path")]
    pub path_prefix: String,

    /// Keep staged files after the load job
    #[serde(default)]
    pub keep_files: bool,
}

/// How rows reach the warehouse
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum LoadingMethod {
    /// Streaming inserts in batches
    #[default]
    #[serde(alias = "Standard")]
    Standard,
    /// Columnar files staged in a bucket and loaded once per stream
    #[serde(alias = "GCS Staging")]
    Staged(StagingSection),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Warehouse project
    #[serde(default)]
    pub project_id: String,

    /// Dataset used for streams without a namespace
    #[serde(default)]
    pub dataset_id: String,

    /// Location of newly created datasets
    #[serde(default = "default_dataset_location")]
    pub dataset_location: String,

    #[serde(default)]
    pub loading_method: LoadingMethod,

    /// Rows per streaming insert
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows per columnar batch in a staged file
    #[serde(default = "default_staged_batch_size")]
    pub staged_batch_size: usize,
}

fn default_dataset_location() -> String {
    "US".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_staged_batch_size() -> usize {
    10_000
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: String::new(),
            dataset_location: default_dataset_location(),
            loading_method: LoadingMethod::default(),
            batch_size: default_batch_size(),
            staged_batch_size: default_staged_batch_size(),
        }
    }
}

impl DestinationConfig {
    /// Create a streaming configuration
    pub fn new(project_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            ..Default::default()
        }
    }

    /// Switch to staged loading through `bucket`
    pub fn with_staging(mut self, bucket: impl Into<String>) -> Self {
        self.loading_method = LoadingMethod::Staged(StagingSection {
            bucket: bucket.into(),
            ..Default::default()
        });
        self
    }

    /// Load configuration from a file
    ///
    /// Files ending in `.json` are read as connector JSON, anything else as
    /// TOML. Environment variable overrides are applied afterwards.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content)?,
            _ => Self::parse(&content)?,
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Parse configuration from the connector's JSON
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Save configuration as TOML
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteFailed {
            path: path.display().to_string(),
            source,
        })
    }

    /// Convert configuration to a TOML string
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(project_id) = lookup(ENV_PROJECT_ID) {
            self.project_id = project_id;
        }

        if let Some(dataset_id) = lookup(ENV_DATASET_ID) {
            self.dataset_id = dataset_id;
        }

        if let Some(method) = lookup(ENV_LOADING_METHOD) {
            match method.to_lowercase().as_str() {
                "standard" => self.loading_method = LoadingMethod::Standard,
                "staged" => {
                    if !self.prefers_staging() {
                        self.loading_method = LoadingMethod::Staged(StagingSection::default());
                    }
                }
                other => warn!("Ignoring unknown {} value '{}'", ENV_LOADING_METHOD, other),
            }
        }

        if let Some(size) = lookup(ENV_BATCH_SIZE) {
            match size.parse() {
                Ok(size) => self.batch_size = size,
                Err(_) => warn!("Ignoring non-numeric {} value '{}'", ENV_BATCH_SIZE, size),
            }
        }
    }

    /// Check the configuration for values the destination cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project_id must not be empty".to_string()));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(ConfigError::Invalid("dataset_id must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".to_string()));
        }
        if self.staged_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "staged_batch_size must be positive".to_string(),
            ));
        }
        if let LoadingMethod::Staged(staging) = &self.loading_method
            && staging.bucket.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "staged loading requires a bucket".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether staged bulk loads are preferred over streaming inserts
    pub fn prefers_staging(&self) -> bool {
        matches!(self.loading_method, LoadingMethod::Staged(_))
    }

    /// Staging settings, when staged loading is configured
    pub fn staging(&self) -> Option<&StagingSection> {
        match &self.loading_method {
            LoadingMethod::Staged(staging) => Some(staging),
            LoadingMethod::Standard => None,
        }
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# BigQuery denormalized destination configuration

project_id = "my-project"

# Dataset for streams without a namespace
dataset_id = "raw"
dataset_location = "US"

# Rows per streaming insert
batch_size = 500

# Rows per columnar batch in a staged file
staged_batch_size = 10000

[loading_method]
# "standard" (streaming inserts) or "staged" (bulk load through a bucket)
method = "standard"
# bucket = "my-staging-bucket"
# path_prefix = "airbyte"
# keep_files = false
"#
}
