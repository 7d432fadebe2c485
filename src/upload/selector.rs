//! Uploader selection per stream.

use std::sync::Arc;
#[cfg(feature = "staging")]
use tracing::info;
#[cfg(not(feature = "staging"))]
use tracing::warn;

#[cfg(feature = "staging")]
use super::StagedUploader;
use super::{StreamUploader, StreamingUploader};
use crate::config::DestinationConfig;
#[cfg(feature = "staging")]
use crate::convert::columnar::supports_columnar;
use crate::format::FormatterBinding;
use crate::warehouse::{WarehouseClient, WriteDisposition};

/// Pick the write path for a stream.
///
/// Staged bulk loading is used when the configuration asks for it and the
/// stream's physical schema has a columnar encoding; every other stream uses
/// streaming inserts. The strategy of the binding plays no part.
///
/// `disposition` is applied when the uploader commits.
pub fn select_uploader(
    config: &DestinationConfig,
    binding: &FormatterBinding,
    disposition: WriteDisposition,
    warehouse: Arc<dyn WarehouseClient>,
) -> Box<dyn StreamUploader> {
    if let Some(uploader) = staged_uploader(config, binding, disposition, &warehouse) {
        return uploader;
    }
    Box::new(StreamingUploader::new(
        binding.table().clone(),
        binding.schema().clone(),
        disposition,
        config.batch_size,
        warehouse,
    ))
}

#[cfg(feature = "staging")]
fn staged_uploader(
    config: &DestinationConfig,
    binding: &FormatterBinding,
    disposition: WriteDisposition,
    warehouse: &Arc<dyn WarehouseClient>,
) -> Option<Box<dyn StreamUploader>> {
    let staging = config.staging()?;
    if !supports_columnar(binding.schema()) {
        info!(
            "Stream {} has JSON columns, falling back to streaming inserts",
            binding.stream()
        );
        return None;
    }
    match StagedUploader::new(
        binding.table().clone(),
        binding.schema(),
        staging.clone(),
        disposition,
        config.staged_batch_size,
        warehouse.clone(),
    ) {
        Ok(uploader) => Some(Box::new(uploader)),
        Err(e) => {
            info!(
                "Stream {} cannot be staged, falling back to streaming inserts: {}",
                binding.stream(),
                e
            );
            None
        }
    }
}

#[cfg(not(feature = "staging"))]
fn staged_uploader(
    config: &DestinationConfig,
    binding: &FormatterBinding,
    _disposition: WriteDisposition,
    _warehouse: &Arc<dyn WarehouseClient>,
) -> Option<Box<dyn StreamUploader>> {
    if config.prefers_staging() {
        warn!(
            "Staged loading requested for stream {} but the staging feature is disabled",
            binding.stream()
        );
    }
    None
}
