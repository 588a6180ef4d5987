//! Record store contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::provider::OperationClass;
use crate::{EntityId, Record, RecordKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another writer persisted the same key first.
    #[error("record {key} already exists")]
    DuplicateKey { key: RecordKey },

    #[error("store backend failure: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Per-item audit status, matching the values written to `ingest_log`.
///
/// `Invalid` marks an item whose fetched records all failed validation, so
/// nothing was saved or found existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemLogStatus {
    Success,
    NoData,
    Invalid,
    Error,
}

impl ItemLogStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NoData => "NO_DATA",
            Self::Invalid => "INVALID",
            Self::Error => "ERROR",
        }
    }
}

impl Display for ItemLogStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry produced once per processed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemLogEntry {
    pub run_id: String,
    pub operation: OperationClass,
    pub entity_id: EntityId,
    pub status: ItemLogStatus,
    pub records_received: usize,
    pub saved: usize,
    pub existing: usize,
    pub invalid: usize,
    pub detail: Option<String>,
    pub latency: Duration,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistence collaborator of the ingestion pipeline.
///
/// `save` must be insert-if-absent: a key that is already present yields
/// [`StoreError::DuplicateKey`] and leaves the stored record untouched.
/// `exists` is only an optimisation; the pipeline still relies on `save` to
/// reject duplicates written by concurrent workers.
pub trait RecordStore: Send + Sync {
    fn exists<'a>(&'a self, key: &'a RecordKey) -> StoreFuture<'a, bool>;

    fn save<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, ()>;

    /// Persists an audit entry. Stores without an audit trail ignore it.
    fn log_item<'a>(&'a self, entry: &'a ItemLogEntry) -> StoreFuture<'a, ()> {
        let _ = entry;
        Box::pin(async { Ok(()) })
    }
}

/// Mutex-guarded in-memory store, used by tests and `--in-memory` runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<RecordKey, Record>>,
    log: Mutex<Vec<ItemLogEntry>>,
    save_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`, as if an earlier run saved them.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        {
            let mut stored = store.lock_records();
            for record in records {
                stored.entry(record.key()).or_insert(record);
            }
        }
        store
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordKey, Record>> {
        self.records
            .lock()
            .expect("memory store records mutex poisoned")
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.lock_records().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored records ordered by key.
    pub fn records(&self) -> Vec<Record> {
        self.lock_records().values().cloned().collect()
    }

    /// Number of `save` calls, including rejected duplicates.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn log_entries(&self) -> Vec<ItemLogEntry> {
        self.log
            .lock()
            .expect("memory store log mutex poisoned")
            .clone()
    }
}

impl RecordStore for MemoryRecordStore {
    fn exists<'a>(&'a self, key: &'a RecordKey) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.contains(key)) })
    }

    fn save<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            let key = record.key();
            let mut records = self.lock_records();
            if records.contains_key(&key) {
                return Err(StoreError::DuplicateKey { key });
            }
            records.insert(key, record.clone());
            Ok(())
        })
    }

    fn log_item<'a>(&'a self, entry: &'a ItemLogEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.log
                .lock()
                .expect("memory store log mutex poisoned")
                .push(entry.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, TradingDate};

    fn close(entity: &str, day: &str, price: f64) -> Record {
        Record::new(
            EntityId::parse(entity).expect("entity"),
            TradingDate::parse(day).expect("day"),
            Payload::ClosePrice {
                price,
                currency: String::from("USD"),
            },
        )
    }

    #[tokio::test]
    async fn save_is_insert_if_absent() {
        let store = MemoryRecordStore::new();
        let first = close("AAPL", "2024-03-01", 180.0);
        let second = close("AAPL", "2024-03-01", 999.0);

        store.save(&first).await.expect("first save");
        let error = store.save(&second).await.expect_err("duplicate");

        assert_eq!(error, StoreError::DuplicateKey { key: first.key() });
        assert_eq!(store.records(), vec![first.clone()]);
        assert_eq!(store.save_calls(), 2);
        assert!(store.exists(&first.key()).await.expect("exists"));
    }

    #[test]
    fn seeded_store_keeps_first_record_per_key() {
        let store = MemoryRecordStore::with_records([
            close("MSFT", "2024-03-01", 1.0),
            close("MSFT", "2024-03-01", 2.0),
            close("MSFT", "2024-03-04", 3.0),
        ]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.save_calls(), 0);
    }
}
