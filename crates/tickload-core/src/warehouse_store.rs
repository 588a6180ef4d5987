//! [`RecordStore`] backed by the DuckDB warehouse.

use tickload_warehouse::{IngestLogRow, MarketRecordRow, Warehouse, WarehouseError};
use tokio::task;
use tracing::debug;

use crate::store::{ItemLogEntry, RecordStore, StoreError, StoreFuture};
use crate::{Record, RecordKey};

/// Writes records of one dataset into `market_records`.
#[derive(Clone)]
pub struct WarehouseRecordStore {
    warehouse: Warehouse,
    dataset: String,
    source: String,
}

impl WarehouseRecordStore {
    pub fn new(warehouse: Warehouse, dataset: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            warehouse,
            dataset: dataset.into(),
            source: source.into(),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    fn to_row(&self, record: &Record) -> Result<MarketRecordRow, StoreError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|error| StoreError::backend(format!("payload encoding failed: {error}")))?;
        Ok(MarketRecordRow {
            dataset: self.dataset.clone(),
            entity_id: record.entity_id.to_string(),
            occurred_on: record.occurred_on.format_iso(),
            kind: record.payload.kind().to_string(),
            payload,
            source: Some(self.source.clone()),
        })
    }
}

async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, WarehouseError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|error| StoreError::backend(format!("warehouse task failed: {error}")))?
        .map_err(|error| StoreError::backend(error.to_string()))
}

impl RecordStore for WarehouseRecordStore {
    fn exists<'a>(&'a self, key: &'a RecordKey) -> StoreFuture<'a, bool> {
        let warehouse = self.warehouse.clone();
        let dataset = self.dataset.clone();
        let entity_id = key.entity_id.to_string();
        let occurred_on = key.occurred_on.format_iso();
        Box::pin(async move {
            blocking(move || warehouse.record_exists(&dataset, &entity_id, &occurred_on)).await
        })
    }

    fn save<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let row = self.to_row(record)?;
            let warehouse = self.warehouse.clone();
            let inserted = blocking(move || warehouse.insert_record_if_absent(&row)).await?;
            if inserted {
                Ok(())
            } else {
                debug!(key = %record.key(), "warehouse already held record");
                Err(StoreError::DuplicateKey { key: record.key() })
            }
        })
    }

    fn log_item<'a>(&'a self, entry: &'a ItemLogEntry) -> StoreFuture<'a, ()> {
        let row = IngestLogRow {
            run_id: entry.run_id.clone(),
            dataset: self.dataset.clone(),
            entity_id: entry.entity_id.to_string(),
            status: entry.status.as_str().to_string(),
            records_received: entry.records_received as u64,
            saved: entry.saved as u64,
            existing: entry.existing as u64,
            invalid: entry.invalid as u64,
            detail: entry.detail.clone(),
            latency_ms: Some(u64::try_from(entry.latency.as_millis()).unwrap_or(u64::MAX)),
        };
        let warehouse = self.warehouse.clone();
        Box::pin(async move { blocking(move || warehouse.append_ingest_log(&row)).await })
    }
}
