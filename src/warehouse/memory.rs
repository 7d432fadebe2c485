//! In-memory warehouse for tests and dry runs.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{
    ExistingTableDescriptor, StagedFile, WarehouseClient, WarehouseError, WarehouseResult,
    WriteDisposition,
};
use crate::models::{PhysicalSchema, TableRef, UploadRecord};

#[derive(Debug, Default)]
struct MemoryTable {
    /// `None` models a table whose schema cannot be read
    schema: Option<PhysicalSchema>,
    rows: Vec<Map<String, Value>>,
    loads: Vec<StagedFile>,
}

/// Warehouse keeping tables, rows and staged loads in memory.
///
/// Every call is recorded, so tests can assert how often a table was looked up
/// and what was written to it.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    /// Dataset name to location
    datasets: Mutex<HashMap<String, String>>,
    tables: Mutex<HashMap<TableRef, MemoryTable>>,
    lookups: Mutex<HashMap<TableRef, usize>>,
    failing: Mutex<HashSet<TableRef>>,
    lookup_delay: Option<Duration>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing table with a readable schema
    pub fn with_table(mut self, table: TableRef, schema: PhysicalSchema) -> Self {
        relock(self.tables.get_mut()).insert(
            table,
            MemoryTable {
                schema: Some(schema),
                ..Default::default()
            },
        );
        self
    }

    /// Add an existing table whose schema cannot be read
    pub fn with_unreadable_table(mut self, table: TableRef) -> Self {
        relock(self.tables.get_mut()).insert(table, MemoryTable::default());
        self
    }

    /// Delay every table lookup, widening the window for concurrent callers
    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    /// Make every later insert, copy or load into `table` fail
    pub fn fail_writes_to(&self, table: TableRef) {
        guard(&self.failing).insert(table);
    }

    /// How many times `table` was looked up
    pub fn lookup_count(&self, table: &TableRef) -> usize {
        guard(&self.lookups).get(table).copied().unwrap_or(0)
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        guard(&self.tables).contains_key(table)
    }

    /// Tables of a dataset, in name order
    pub fn tables_in(&self, dataset: &str) -> Vec<TableRef> {
        let mut tables: Vec<_> = guard(&self.tables)
            .keys()
            .filter(|table| table.dataset == dataset)
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    /// Location a dataset was created in
    pub fn dataset_location(&self, dataset: &str) -> Option<String> {
        guard(&self.datasets).get(dataset).cloned()
    }

    /// Schema of a table, if it exists and is readable
    pub fn table_schema(&self, table: &TableRef) -> Option<PhysicalSchema> {
        guard(&self.tables)
            .get(table)
            .and_then(|t| t.schema.clone())
    }

    /// Rows streamed into a table, in insertion order
    pub fn rows(&self, table: &TableRef) -> Vec<Map<String, Value>> {
        guard(&self.tables)
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Files loaded into a table, in load order
    pub fn loads(&self, table: &TableRef) -> Vec<StagedFile> {
        guard(&self.tables)
            .get(table)
            .map(|t| t.loads.clone())
            .unwrap_or_default()
    }

    fn check_writable(&self, table: &TableRef) -> Option<String> {
        guard(&self.failing)
            .contains(table)
            .then(|| "writes to this table are disabled".to_string())
    }
}

/// A panic in another test thread must not hide the recorded state.
fn relock<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

fn guard<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    relock(mutex.lock())
}

#[async_trait]
impl WarehouseClient for InMemoryWarehouse {
    async fn get_existing_table(
        &self,
        table: &TableRef,
    ) -> WarehouseResult<ExistingTableDescriptor> {
        *guard(&self.lookups).entry(table.clone()).or_insert(0) += 1;
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }

        let descriptor = match guard(&self.tables).get(table) {
            None => ExistingTableDescriptor::Absent,
            Some(existing) => ExistingTableDescriptor::Present {
                schema: existing.schema.clone(),
            },
        };
        Ok(descriptor)
    }

    async fn create_dataset(&self, dataset: &str, location: &str) -> WarehouseResult<()> {
        let mut datasets = guard(&self.datasets);
        if let Some(existing) = datasets.get(dataset) {
            if existing != location {
                debug!(
                    "Dataset {} already exists in {}, not {}",
                    dataset, existing, location
                );
            }
            return Ok(());
        }
        debug!("Creating in-memory dataset {} in {}", dataset, location);
        datasets.insert(dataset.to_string(), location.to_string());
        Ok(())
    }

    async fn create_table(&self, table: &TableRef, schema: &PhysicalSchema) -> WarehouseResult<()> {
        let mut tables = guard(&self.tables);
        if tables.contains_key(table) {
            return Err(WarehouseError::TableAlreadyExists(table.clone()));
        }
        debug!("Creating in-memory table {} with {} columns", table, schema.len());
        tables.insert(
            table.clone(),
            MemoryTable {
                schema: Some(schema.clone()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn insert_rows(&self, table: &TableRef, rows: Vec<UploadRecord>) -> WarehouseResult<()> {
        if let Some(reason) = self.check_writable(table) {
            return Err(WarehouseError::InsertFailed {
                table: table.clone(),
                reason,
            });
        }
        let mut tables = guard(&self.tables);
        let target = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        target.rows.extend(rows.into_iter().map(|record| record.row));
        Ok(())
    }

    async fn copy_table(
        &self,
        source: &TableRef,
        destination: &TableRef,
        disposition: WriteDisposition,
    ) -> WarehouseResult<()> {
        if let Some(reason) = self.check_writable(destination) {
            return Err(WarehouseError::CopyFailed {
                table: destination.clone(),
                reason,
            });
        }
        let mut tables = guard(&self.tables);
        let rows = tables
            .get(source)
            .map(|t| t.rows.clone())
            .ok_or_else(|| WarehouseError::TableNotFound(source.clone()))?;
        let target = tables
            .get_mut(destination)
            .ok_or_else(|| WarehouseError::TableNotFound(destination.clone()))?;
        if disposition == WriteDisposition::Truncate {
            target.rows.clear();
            target.loads.clear();
        }
        debug!("Copying {} rows from {} into {}", rows.len(), source, destination);
        target.rows.extend(rows);
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> WarehouseResult<()> {
        guard(&self.tables)
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))
    }

    async fn stage_and_load(&self, table: &TableRef, file: StagedFile) -> WarehouseResult<()> {
        if let Some(reason) = self.check_writable(table) {
            return Err(WarehouseError::LoadFailed {
                table: table.clone(),
                reason,
            });
        }
        let mut tables = guard(&self.tables);
        let target = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        if file.disposition == WriteDisposition::Truncate {
            target.rows.clear();
            target.loads.clear();
        }
        target.loads.push(file);
        Ok(())
    }
}
