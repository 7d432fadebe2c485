//! Batched streaming inserts through a temporary table.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    StreamUploader, UploadResult, UploadSummary, UploaderKind, UploaderState, ensure_open,
};
use crate::models::{PhysicalSchema, TableRef, UploadRecord};
use crate::warehouse::{WarehouseClient, WriteDisposition};

/// Name prefix of the per-sync temporary tables
pub const TMP_TABLE_PREFIX: &str = "_airbyte_tmp_";

/// Uploader sending rows with streaming inserts of `batch_size` rows.
///
/// Batches land in a temporary table next to the target. `finalize` copies
/// that table into the target in one job and `abort` drops it, so the target
/// only ever sees a whole stream or nothing.
pub struct StreamingUploader {
    table: TableRef,
    tmp_table: TableRef,
    schema: PhysicalSchema,
    disposition: WriteDisposition,
    warehouse: Arc<dyn WarehouseClient>,
    batch_size: usize,
    buffer: Vec<UploadRecord>,
    tmp_created: bool,
    rows: usize,
    batches: usize,
    state: UploaderState,
    summary: Option<UploadSummary>,
}

impl StreamingUploader {
    pub fn new(
        table: TableRef,
        schema: PhysicalSchema,
        disposition: WriteDisposition,
        batch_size: usize,
        warehouse: Arc<dyn WarehouseClient>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let tmp_table = TableRef::new(
            table.dataset.clone(),
            format!("{}{}_{}", TMP_TABLE_PREFIX, Uuid::new_v4().simple(), table.table),
        );
        Self {
            table,
            tmp_table,
            schema,
            disposition,
            warehouse,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            tmp_created: false,
            rows: 0,
            batches: 0,
            state: UploaderState::Open,
            summary: None,
        }
    }

    /// Rows buffered but not yet inserted
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Temporary table receiving the streamed batches
    pub fn tmp_table(&self) -> &TableRef {
        &self.tmp_table
    }

    async fn ensure_tmp_table(&mut self) -> UploadResult<()> {
        if !self.tmp_created {
            self.warehouse
                .create_table(&self.tmp_table, &self.schema)
                .await?;
            self.tmp_created = true;
            debug!("Created temporary table {} for {}", self.tmp_table, self.table);
        }
        Ok(())
    }

    async fn flush(&mut self) -> UploadResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.ensure_tmp_table().await?;
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let count = batch.len();
        self.warehouse.insert_rows(&self.tmp_table, batch).await?;
        self.rows += count;
        self.batches += 1;
        debug!("Inserted {} rows into {}", count, self.tmp_table);
        Ok(())
    }

    async fn commit(&mut self) -> UploadResult<()> {
        self.flush().await?;
        // an empty overwrite still has to clear the target
        if self.rows == 0 && self.disposition == WriteDisposition::Append {
            debug!("No rows streamed for {}, skipping copy", self.table);
            return Ok(());
        }
        self.ensure_tmp_table().await?;
        self.warehouse
            .copy_table(&self.tmp_table, &self.table, self.disposition)
            .await?;
        Ok(())
    }

    async fn drop_tmp_table(&mut self) {
        if !self.tmp_created {
            return;
        }
        match self.warehouse.drop_table(&self.tmp_table).await {
            Ok(()) => debug!("Dropped temporary table {}", self.tmp_table),
            Err(e) => warn!("Failed to drop temporary table {}: {}", self.tmp_table, e),
        }
        self.tmp_created = false;
    }
}

#[async_trait]
impl StreamUploader for StreamingUploader {
    fn kind(&self) -> UploaderKind {
        UploaderKind::Streaming
    }

    fn table(&self) -> &TableRef {
        &self.table
    }

    fn state(&self) -> UploaderState {
        self.state
    }

    async fn accept(&mut self, record: UploadRecord) -> UploadResult<()> {
        ensure_open(self.state, &self.table, "accept")?;
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> UploadResult<UploadSummary> {
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }
        ensure_open(self.state, &self.table, "finalize")?;

        let committed = self.commit().await;
        self.drop_tmp_table().await;
        if let Err(e) = committed {
            self.buffer.clear();
            self.state = UploaderState::Aborted;
            return Err(e);
        }

        self.state = UploaderState::Finalized;
        let summary = UploadSummary {
            table: self.table.clone(),
            kind: UploaderKind::Streaming,
            rows: self.rows,
            batches: self.batches,
            staged_file: None,
        };
        info!(
            "Committed {} rows streamed in {} batches into {} ({})",
            summary.rows, summary.batches, self.table, self.disposition
        );
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    async fn abort(&mut self) {
        if self.state != UploaderState::Open {
            return;
        }
        if !self.buffer.is_empty() || self.rows > 0 {
            debug!(
                "Discarding {} rows for {}",
                self.rows + self.buffer.len(),
                self.table
            );
        }
        self.buffer.clear();
        self.drop_tmp_table().await;
        self.state = UploaderState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldMode, FieldType, PhysicalField, Strategy};
    use crate::upload::{LifecycleError, UploadError};
    use crate::warehouse::{InMemoryWarehouse, WarehouseError};
    use serde_json::{Map, json};

    fn record(id: i64) -> UploadRecord {
        let mut row = Map::new();
        row.insert("id".to_string(), json!(id));
        UploadRecord {
            strategy: Strategy::Modern,
            row,
        }
    }

    fn schema() -> PhysicalSchema {
        PhysicalSchema::new(vec![PhysicalField::new(
            "id",
            FieldType::Integer,
            FieldMode::Nullable,
        )])
    }

    async fn setup_with(
        batch_size: usize,
        disposition: WriteDisposition,
    ) -> (Arc<InMemoryWarehouse>, StreamingUploader) {
        let table = TableRef::new("ds", "events");
        let warehouse = Arc::new(InMemoryWarehouse::new());
        warehouse.create_table(&table, &schema()).await.unwrap();
        let uploader =
            StreamingUploader::new(table, schema(), disposition, batch_size, warehouse.clone());
        (warehouse, uploader)
    }

    async fn setup(batch_size: usize) -> (Arc<InMemoryWarehouse>, StreamingUploader) {
        setup_with(batch_size, WriteDisposition::Append).await
    }

    fn ids(warehouse: &InMemoryWarehouse, table: &TableRef) -> Vec<serde_json::Value> {
        warehouse
            .rows(table)
            .iter()
            .map(|row| row["id"].clone())
            .collect()
    }

    #[tokio::test]
    async fn test_batches_reach_target_only_at_finalize() {
        let (warehouse, mut uploader) = setup(2).await;
        for id in 0..5 {
            uploader.accept(record(id)).await.unwrap();
        }
        assert!(warehouse.rows(uploader.table()).is_empty());
        assert_eq!(warehouse.rows(uploader.tmp_table()).len(), 4);
        assert_eq!(uploader.buffered(), 1);

        let summary = uploader.finalize().await.unwrap();
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.batches, 3);
        assert_eq!(
            ids(&warehouse, uploader.table()),
            vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
        );
        assert!(!warehouse.has_table(uploader.tmp_table()));
        assert!(uploader.tmp_table().table.starts_with(TMP_TABLE_PREFIX));
        assert!(uploader.tmp_table().table.ends_with("_events"));
    }

    #[tokio::test]
    async fn test_second_finalize_is_a_no_op() {
        let (warehouse, mut uploader) = setup(10).await;
        uploader.accept(record(1)).await.unwrap();
        let first = uploader.finalize().await.unwrap();
        let second = uploader.finalize().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(warehouse.rows(uploader.table()).len(), 1);
    }

    #[tokio::test]
    async fn test_accept_after_finalize_fails() {
        let (_, mut uploader) = setup(10).await;
        uploader.finalize().await.unwrap();
        let err = uploader.accept(record(1)).await.unwrap_err();
        assert_eq!(
            err,
            UploadError::Lifecycle(LifecycleError {
                table: TableRef::new("ds", "events"),
                state: UploaderState::Finalized,
                operation: "accept",
            })
        );
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_abort_after_flushed_batches_commits_nothing() {
        let (warehouse, mut uploader) = setup(2).await;
        for id in 0..5 {
            uploader.accept(record(id)).await.unwrap();
        }
        assert!(warehouse.has_table(uploader.tmp_table()));
        uploader.abort().await;

        assert!(warehouse.rows(uploader.table()).is_empty());
        assert_eq!(warehouse.tables_in("ds"), vec![TableRef::new("ds", "events")]);
        assert_eq!(uploader.state(), UploaderState::Aborted);
        assert!(uploader.accept(record(9)).await.unwrap_err().is_fatal());
        assert!(uploader.finalize().await.is_err());
    }

    #[tokio::test]
    async fn test_insert_failure_is_stream_scoped() {
        let (warehouse, mut uploader) = setup(1).await;
        warehouse.fail_writes_to(uploader.tmp_table().clone());
        let err = uploader.accept(record(1)).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Warehouse(WarehouseError::InsertFailed { .. })
        ));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_failed_copy_drops_tmp_table() {
        let (warehouse, mut uploader) = setup(1).await;
        uploader.accept(record(1)).await.unwrap();
        warehouse.fail_writes_to(uploader.table().clone());

        let err = uploader.finalize().await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Warehouse(WarehouseError::CopyFailed { .. })
        ));
        assert_eq!(uploader.state(), UploaderState::Aborted);
        assert!(!warehouse.has_table(uploader.tmp_table()));
        assert!(warehouse.rows(uploader.table()).is_empty());
    }

    #[tokio::test]
    async fn test_truncate_replaces_existing_rows() {
        let (warehouse, mut uploader) = setup_with(2, WriteDisposition::Truncate).await;
        warehouse
            .insert_rows(uploader.table(), vec![record(100), record(101)])
            .await
            .unwrap();

        uploader.accept(record(1)).await.unwrap();
        uploader.finalize().await.unwrap();
        assert_eq!(ids(&warehouse, uploader.table()), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_empty_overwrite_clears_target() {
        let (warehouse, mut uploader) = setup_with(2, WriteDisposition::Truncate).await;
        warehouse
            .insert_rows(uploader.table(), vec![record(100)])
            .await
            .unwrap();

        let summary = uploader.finalize().await.unwrap();
        assert_eq!(summary.rows, 0);
        assert!(warehouse.rows(uploader.table()).is_empty());
        assert!(!warehouse.has_table(uploader.tmp_table()));
    }

    #[tokio::test]
    async fn test_empty_append_touches_nothing() {
        let (warehouse, mut uploader) = setup(2).await;
        warehouse
            .insert_rows(uploader.table(), vec![record(100)])
            .await
            .unwrap();

        uploader.finalize().await.unwrap();
        assert_eq!(ids(&warehouse, uploader.table()), vec![json!(100)]);
        assert_eq!(warehouse.tables_in("ds").len(), 1);
    }
}
