//! Staged bulk loads through one Parquet file per stream.

use arrow::datatypes::SchemaRef;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    StreamUploader, UploadError, UploadResult, UploadSummary, UploaderKind, UploaderState,
    ensure_open,
};
use crate::config::StagingSection;
use crate::convert::SchemaResult;
use crate::convert::columnar::arrow_schema;
use crate::models::{PhysicalSchema, TableRef, UploadRecord};
use crate::warehouse::{StagedFile, StagedFormat, WarehouseClient, WriteDisposition};

/// Uploader encoding rows into columnar batches and loading them once.
///
/// Nothing reaches the warehouse before [`finalize`](StreamUploader::finalize),
/// so an abort leaves the table untouched.
pub struct StagedUploader {
    table: TableRef,
    warehouse: Arc<dyn WarehouseClient>,
    staging: StagingSection,
    disposition: WriteDisposition,
    schema: SchemaRef,
    batch_size: usize,
    pending: Vec<Map<String, Value>>,
    batches: Vec<RecordBatch>,
    rows: usize,
    state: UploaderState,
    summary: Option<UploadSummary>,
}

impl StagedUploader {
    /// Create an uploader for `table`.
    ///
    /// Fails when the physical schema has no columnar encoding.
    pub fn new(
        table: TableRef,
        schema: &PhysicalSchema,
        staging: StagingSection,
        disposition: WriteDisposition,
        batch_size: usize,
        warehouse: Arc<dyn WarehouseClient>,
    ) -> SchemaResult<Self> {
        Ok(Self {
            table,
            warehouse,
            staging,
            disposition,
            schema: arrow_schema(schema)?,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            batches: Vec::new(),
            rows: 0,
            state: UploaderState::Open,
            summary: None,
        })
    }

    /// Rows accepted so far, encoded or pending
    pub fn buffered(&self) -> usize {
        self.rows + self.pending.len()
    }

    fn encode_pending(&mut self) -> UploadResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending);
        let mut decoder = ReaderBuilder::new(self.schema.clone())
            .with_batch_size(rows.len())
            .build_decoder()
            .map_err(|e| self.encoding_error(e))?;
        decoder.serialize(&rows).map_err(|e| self.encoding_error(e))?;
        if let Some(batch) = decoder.flush().map_err(|e| self.encoding_error(e))? {
            self.rows += batch.num_rows();
            self.batches.push(batch);
        }
        Ok(())
    }

    fn write_parquet(&self) -> UploadResult<Vec<u8>> {
        let props = WriterProperties::builder()
            .set_max_row_group_size(self.batch_size)
            .build();
        let mut buffer = Vec::new();
        {
            let mut writer = ArrowWriter::try_new(&mut buffer, self.schema.clone(), Some(props))
                .map_err(|e| self.encoding_error(e))?;
            for batch in &self.batches {
                writer.write(batch).map_err(|e| self.encoding_error(e))?;
            }
            writer.close().map_err(|e| self.encoding_error(e))?;
        }
        Ok(buffer)
    }

    fn staged_name(&self) -> String {
        let file = format!("{}_{}.{}", self.table.table, Uuid::new_v4(), StagedFormat::Parquet);
        let prefix = self.staging.path_prefix.trim_matches('/');
        if prefix.is_empty() {
            file
        } else {
            format!("{}/{}", prefix, file)
        }
    }

    fn encoding_error(&self, err: impl std::fmt::Display) -> UploadError {
        UploadError::Encoding {
            table: self.table.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl StreamUploader for StagedUploader {
    fn kind(&self) -> UploaderKind {
        UploaderKind::StagedBulk
    }

    fn table(&self) -> &TableRef {
        &self.table
    }

    fn state(&self) -> UploaderState {
        self.state
    }

    async fn accept(&mut self, record: UploadRecord) -> UploadResult<()> {
        ensure_open(self.state, &self.table, "accept")?;
        self.pending.push(record.row);
        if self.pending.len() >= self.batch_size {
            self.encode_pending()?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> UploadResult<UploadSummary> {
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }
        ensure_open(self.state, &self.table, "finalize")?;

        self.encode_pending()?;
        // an empty overwrite still loads, leaving the target empty
        let staged_file = if self.rows == 0 && self.disposition == WriteDisposition::Append {
            debug!("No rows staged for {}, skipping load", self.table);
            None
        } else {
            let file = StagedFile {
                name: self.staged_name(),
                format: StagedFormat::Parquet,
                bytes: self.write_parquet()?,
                row_count: self.rows,
                keep_after_load: self.staging.keep_files,
                disposition: self.disposition,
            };
            let name = file.name.clone();
            info!(
                "Loading {} rows into {} from gs://{}/{} ({})",
                self.rows, self.table, self.staging.bucket, name, self.disposition
            );
            self.warehouse.stage_and_load(&self.table, file).await?;
            Some(name)
        };

        self.state = UploaderState::Finalized;
        self.batches.clear();
        let summary = UploadSummary {
            table: self.table.clone(),
            kind: UploaderKind::StagedBulk,
            rows: self.rows,
            batches: if staged_file.is_some() { 1 } else { 0 },
            staged_file,
        };
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    async fn abort(&mut self) {
        if self.state != UploaderState::Open {
            return;
        }
        debug!("Discarding {} staged rows for {}", self.buffered(), self.table);
        self.pending.clear();
        self.batches.clear();
        self.state = UploaderState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{ConversionMode, SchemaError, convert};
    use crate::format::RecordFormatter;
    use crate::models::{
        FieldMode, FieldType, PhysicalField, RawRecord, StreamKey, StreamSchema, Strategy,
    };
    use crate::warehouse::InMemoryWarehouse;
    use arrow::array::{Array, AsArray};
    use arrow::compute::concat_batches;
    use arrow::datatypes::{
        Date32Type, Float64Type, Int64Type, Time64MicrosecondType, TimestampMicrosecondType,
    };
    use arrow::record_batch::RecordBatchReader;
    use chrono::{DateTime, NaiveDate};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;
    use std::io::Write;

    fn schema() -> PhysicalSchema {
        PhysicalSchema::new(vec![
            PhysicalField::new("_record_id", FieldType::String, FieldMode::Required),
            PhysicalField::new("_emitted_at", FieldType::Timestamp, FieldMode::Required),
            PhysicalField::new("id", FieldType::Integer, FieldMode::Nullable),
            PhysicalField::new("tags", FieldType::String, FieldMode::Repeated),
        ])
    }

    fn record(id: i64) -> UploadRecord {
        let row = json!({
            "_record_id": format!("r{}", id),
            "_emitted_at": "2024-03-01T12:00:00.000000Z",
            "id": id,
            "tags": ["a", "b"]
        });
        UploadRecord {
            strategy: Strategy::Modern,
            row: row.as_object().cloned().unwrap_or_default(),
        }
    }

    fn staging() -> StagingSection {
        StagingSection {
            bucket: "bucket".to_string(),
            path_prefix: "/loads/".to_string(),
            keep_files: false,
        }
    }

    async fn setup_with(
        schema: &PhysicalSchema,
        batch_size: usize,
        disposition: WriteDisposition,
    ) -> (Arc<InMemoryWarehouse>, StagedUploader) {
        let table = TableRef::new("ds", "events");
        let warehouse = Arc::new(InMemoryWarehouse::new());
        warehouse.create_table(&table, schema).await.unwrap();
        let uploader = StagedUploader::new(
            table,
            schema,
            staging(),
            disposition,
            batch_size,
            warehouse.clone(),
        )
        .unwrap();
        (warehouse, uploader)
    }

    async fn setup(batch_size: usize) -> (Arc<InMemoryWarehouse>, StagedUploader) {
        setup_with(&schema(), batch_size, WriteDisposition::Append).await
    }

    /// Decode a staged Parquet file back into one record batch
    fn read_back(file: &StagedFile) -> RecordBatch {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&file.bytes).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(tmp)
            .unwrap()
            .build()
            .unwrap();
        let schema = reader.schema();
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();
        concat_batches(&schema, &batches).unwrap()
    }

    #[tokio::test]
    async fn test_single_load_at_finalize() {
        let (warehouse, mut uploader) = setup(2).await;
        for id in 0..5 {
            uploader.accept(record(id)).await.unwrap();
        }
        assert!(warehouse.loads(uploader.table()).is_empty());

        let summary = uploader.finalize().await.unwrap();
        assert_eq!(summary.kind, UploaderKind::StagedBulk);
        assert_eq!(summary.rows, 5);

        let loads = warehouse.loads(uploader.table());
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].row_count, 5);
        assert!(loads[0].name.starts_with("loads/events_"));
        assert!(loads[0].name.ends_with(".parquet"));
        assert_eq!(&loads[0].bytes[..4], b"PAR1");
        assert_eq!(summary.staged_file.as_deref(), Some(loads[0].name.as_str()));

        uploader.finalize().await.unwrap();
        assert_eq!(warehouse.loads(uploader.table()).len(), 1);
    }

    #[tokio::test]
    async fn test_rendered_rows_survive_the_parquet_round_trip() {
        let stream = StreamSchema::new(
            StreamKey::new("events"),
            json!({
                "type": "object",
                "properties": {
                    "day": {"type": "string", "format": "date"},
                    "at": {"type": "string", "format": "time"},
                    "seen": {"type": "string", "format": "date-time"},
                    "matrix": {"type": "array", "items": {"type": "array", "items": {"type": "number"}}},
                    "items": {"type": "array", "items": {
                        "type": "object",
                        "properties": {"sku": {"type": "string"}, "qty": {"type": "integer"}}
                    }}
                }
            }),
        );
        let physical = convert(&stream, ConversionMode::Denormalized).unwrap();
        let formatter = RecordFormatter::new(stream.key.clone(), physical.clone(), Strategy::Modern);
        let rendered = formatter
            .render(&RawRecord::new(
                stream.key.clone(),
                json!({
                    "day": "2024-03-01",
                    "at": "12:30:00",
                    "seen": "2024-03-01T10:00:00+02:00",
                    "matrix": [[1.5, 2.0], [3.0]],
                    "items": [{"sku": "A-1", "qty": 2}, {"sku": "B-7", "qty": 1}]
                }),
            ))
            .unwrap();

        let (warehouse, mut uploader) =
            setup_with(&physical, 10, WriteDisposition::Append).await;
        uploader.accept(rendered).await.unwrap();
        let summary = uploader.finalize().await.unwrap();
        assert_eq!(summary.rows, 1);

        let loads = warehouse.loads(uploader.table());
        let batch = read_back(&loads[0]);
        assert_eq!(batch.num_rows(), 1);

        let day = batch.column_by_name("day").unwrap().as_primitive::<Date32Type>();
        assert_eq!(day.value_as_date(0), NaiveDate::from_ymd_opt(2024, 3, 1));

        let at = batch
            .column_by_name("at")
            .unwrap()
            .as_primitive::<Time64MicrosecondType>();
        assert_eq!(at.value(0), (12 * 3600 + 30 * 60) * 1_000_000);

        let seen = batch
            .column_by_name("seen")
            .unwrap()
            .as_primitive::<TimestampMicrosecondType>();
        let expected = DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z").unwrap();
        assert_eq!(seen.value(0), expected.timestamp_micros());

        let matrix = batch.column_by_name("matrix").unwrap().as_list::<i32>();
        let rows = matrix.value(0);
        let wrappers = rows.as_struct();
        assert_eq!(wrappers.len(), 2);
        let inner = wrappers
            .column_by_name("nested_values")
            .unwrap()
            .as_list::<i32>();
        let first = inner.value(0);
        let first = first.as_primitive::<Float64Type>();
        assert_eq!(first.values().to_vec(), vec![1.5, 2.0]);

        let items = batch.column_by_name("items").unwrap().as_list::<i32>();
        let items = items.value(0);
        let items = items.as_struct();
        assert_eq!(items.len(), 2);
        let qty = items.column_by_name("qty").unwrap().as_primitive::<Int64Type>();
        assert_eq!(qty.values().to_vec(), vec![2, 1]);
        let sku = items.column_by_name("sku").unwrap().as_string::<i32>();
        assert_eq!(sku.value(1), "B-7");
    }

    #[tokio::test]
    async fn test_empty_overwrite_still_loads() {
        let (warehouse, mut uploader) = setup_with(&schema(), 2, WriteDisposition::Truncate).await;
        let summary = uploader.finalize().await.unwrap();
        assert_eq!(summary.rows, 0);

        let loads = warehouse.loads(uploader.table());
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].row_count, 0);
        assert_eq!(loads[0].disposition, WriteDisposition::Truncate);
        assert_eq!(read_back(&loads[0]).num_rows(), 0);
    }

    #[tokio::test]
    async fn test_abort_never_loads() {
        let (warehouse, mut uploader) = setup(2).await;
        for id in 0..3 {
            uploader.accept(record(id)).await.unwrap();
        }
        uploader.abort().await;
        assert!(warehouse.loads(uploader.table()).is_empty());
        assert!(uploader.accept(record(9)).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_empty_stream_skips_load() {
        let (warehouse, mut uploader) = setup(2).await;
        let summary = uploader.finalize().await.unwrap();
        assert_eq!(summary.rows, 0);
        assert!(summary.staged_file.is_none());
        assert!(warehouse.loads(uploader.table()).is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_an_encoding_error() {
        let (_, mut uploader) = setup(1).await;
        let mut bad = record(1);
        bad.row.insert("id".to_string(), json!("not a number"));
        let err = uploader.accept(bad).await.unwrap_err();
        assert!(matches!(err, UploadError::Encoding { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_json_columns_cannot_be_staged() {
        let schema = PhysicalSchema::new(vec![PhysicalField::new(
            "payload",
            FieldType::Json,
            FieldMode::Nullable,
        )]);
        let result = StagedUploader::new(
            TableRef::new("ds", "t"),
            &schema,
            StagingSection::default(),
            WriteDisposition::Append,
            10,
            Arc::new(InMemoryWarehouse::new()),
        );
        assert!(matches!(result, Err(SchemaError::NoColumnarMapping { .. })));
    }
}
