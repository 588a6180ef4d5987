//! DuckDB persistence for ingested market records.
//!
//! The warehouse owns the authoritative uniqueness invariant for records: the
//! `market_records` table is keyed by `(dataset, entity_id, occurred_on)` and
//! every write goes through [`Warehouse::insert_record_if_absent`], so a
//! concurrent duplicate is reported as "not inserted" instead of an error.

pub mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::{params, Connection};
use serde::Serialize;
use thiserror::Error;

pub use duckdb::{DuckDbConnectionManager, PooledConnection};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub tickload_home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let tickload_home = resolve_tickload_home();
        let db_path = tickload_home.join("warehouse.duckdb");
        Self {
            tickload_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl WarehouseConfig {
    /// Default configuration pointed at an explicit database file.
    #[must_use]
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

/// One row of `market_records`. `occurred_on` is an ISO `YYYY-MM-DD` string
/// and `payload` is the JSON-encoded record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketRecordRow {
    pub dataset: String,
    pub entity_id: String,
    pub occurred_on: String,
    pub kind: String,
    pub payload: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestLogRow {
    pub run_id: String,
    pub dataset: String,
    pub entity_id: String,
    pub status: String,
    pub records_received: u64,
    pub saved: u64,
    pub existing: u64,
    pub invalid: u64,
    pub detail: Option<String>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetCount {
    pub dataset: String,
    pub records: u64,
    pub entities: u64,
    pub first_day: Option<String>,
    pub last_day: Option<String>,
}

#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
    // DuckDB resolves concurrent primary-key inserts with optimistic
    // transaction conflicts; writes are serialised instead.
    write_lock: Arc<Mutex<()>>,
}

impl Warehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = DuckDbConnectionManager::open(config.db_path, config.max_pool_size)?;
        Self::from_manager(manager)
    }

    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let manager = DuckDbConnectionManager::in_memory(4)?;
        Self::from_manager(manager)
    }

    fn from_manager(manager: DuckDbConnectionManager) -> Result<Self, WarehouseError> {
        let warehouse = Self {
            manager,
            write_lock: Arc::new(Mutex::new(())),
        };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.manager.db_path()
    }

    /// Insert the row unless a row with the same composite key exists.
    ///
    /// Returns `true` when the row was written and `false` when the key was
    /// already present.
    ///
    /// # Panics
    /// Panics if the write lock is poisoned.
    pub fn insert_record_if_absent(&self, row: &MarketRecordRow) -> Result<bool, WarehouseError> {
        let _guard = self
            .write_lock
            .lock()
            .expect("warehouse write lock poisoned");
        let connection = self.manager.acquire()?;

        if key_exists(&connection, &row.dataset, &row.entity_id, &row.occurred_on)? {
            return Ok(false);
        }

        let inserted = connection.execute(
            r#"
INSERT INTO market_records (dataset, entity_id, occurred_on, kind, payload, source)
VALUES (?, ?, CAST(? AS DATE), ?, ?, ?)
ON CONFLICT DO NOTHING
"#,
            params![
                row.dataset,
                row.entity_id,
                row.occurred_on,
                row.kind,
                row.payload,
                row.source,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn record_exists(
        &self,
        dataset: &str,
        entity_id: &str,
        occurred_on: &str,
    ) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        Ok(key_exists(&connection, dataset, entity_id, occurred_on)?)
    }

    /// # Panics
    /// Panics if the write lock is poisoned.
    pub fn append_ingest_log(&self, row: &IngestLogRow) -> Result<(), WarehouseError> {
        let _guard = self
            .write_lock
            .lock()
            .expect("warehouse write lock poisoned");
        let connection = self.manager.acquire()?;
        connection.execute(
            r#"
INSERT INTO ingest_log (
    run_id, dataset, entity_id, status, records_received, saved, existing, invalid,
    detail, latency_ms, timestamp
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
"#,
            params![
                row.run_id,
                row.dataset,
                row.entity_id,
                row.status,
                to_i64(row.records_received),
                to_i64(row.saved),
                to_i64(row.existing),
                to_i64(row.invalid),
                row.detail,
                row.latency_ms.map(to_i64),
            ],
        )?;
        Ok(())
    }

    pub fn ingest_log_for_run(&self, run_id: &str) -> Result<Vec<IngestLogRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            r#"
SELECT run_id, dataset, entity_id, status, records_received, saved, existing, invalid,
       detail, latency_ms
FROM ingest_log
WHERE run_id = ?
ORDER BY entity_id
"#,
        )?;
        let rows = statement.query_map([run_id], |row| {
            Ok(IngestLogRow {
                run_id: row.get(0)?,
                dataset: row.get(1)?,
                entity_id: row.get(2)?,
                status: row.get(3)?,
                records_received: from_i64(row.get(4)?),
                saved: from_i64(row.get(5)?),
                existing: from_i64(row.get(6)?),
                invalid: from_i64(row.get(7)?),
                detail: row.get(8)?,
                latency_ms: row.get::<_, Option<i64>>(9)?.map(from_i64),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn dataset_counts(&self) -> Result<Vec<DatasetCount>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            r#"
SELECT dataset,
       COUNT(*) AS records,
       COUNT(DISTINCT entity_id) AS entities,
       CAST(MIN(occurred_on) AS VARCHAR) AS first_day,
       CAST(MAX(occurred_on) AS VARCHAR) AS last_day
FROM market_records
GROUP BY dataset
ORDER BY dataset
"#,
        )?;
        let rows = statement.query_map([], |row| {
            Ok(DatasetCount {
                dataset: row.get(0)?,
                records: from_i64(row.get(1)?),
                entities: from_i64(row.get(2)?),
                first_day: row.get(3)?,
                last_day: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Records of a dataset ordered by entity and day, optionally narrowed to
    /// one entity.
    pub fn load_records(
        &self,
        dataset: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<MarketRecordRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut sql = String::from(
            r#"
SELECT dataset, entity_id, CAST(occurred_on AS VARCHAR), kind, payload, source
FROM market_records
WHERE dataset = ?"#,
        );
        if entity_id.is_some() {
            sql.push_str(" AND entity_id = ?");
        }
        sql.push_str(" ORDER BY entity_id, occurred_on");

        let mut statement = connection.prepare(sql.as_str())?;
        let map_row = |row: &::duckdb::Row<'_>| -> ::duckdb::Result<MarketRecordRow> {
            Ok(MarketRecordRow {
                dataset: row.get(0)?,
                entity_id: row.get(1)?,
                occurred_on: row.get(2)?,
                kind: row.get(3)?,
                payload: row.get(4)?,
                source: row.get(5)?,
            })
        };
        let rows = match entity_id {
            Some(entity_id) => statement
                .query_map(params![dataset, entity_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => statement
                .query_map(params![dataset], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }
}

fn key_exists(
    connection: &Connection,
    dataset: &str,
    entity_id: &str,
    occurred_on: &str,
) -> Result<bool, ::duckdb::Error> {
    let count: i64 = connection.query_row(
        r#"
SELECT COUNT(*) FROM market_records
WHERE dataset = ? AND entity_id = ? AND occurred_on = CAST(? AS DATE)
"#,
        params![dataset, entity_id, occurred_on],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn resolve_tickload_home() -> PathBuf {
    if let Some(path) = env::var_os("TICKLOAD_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".tickload");
    }

    PathBuf::from(".tickload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn close_row(entity_id: &str, day: &str) -> MarketRecordRow {
        MarketRecordRow {
            dataset: String::from("close_prices"),
            entity_id: entity_id.to_string(),
            occurred_on: day.to_string(),
            kind: String::from("close_price"),
            payload: String::from(r#"{"kind":"close_price","price":101.5,"currency":"USD"}"#),
            source: Some(String::from("fixture")),
        }
    }

    #[test]
    fn initializes_tables_on_disk() {
        let temp = tempdir().expect("tempdir");
        let tickload_home = temp.path().join("tickload-home");
        let db_path = tickload_home.join("warehouse.duckdb");

        let warehouse = Warehouse::open(WarehouseConfig {
            tickload_home,
            db_path: db_path.clone(),
            max_pool_size: 2,
        })
        .expect("warehouse open");

        assert_eq!(warehouse.db_path(), Some(db_path.as_path()));
        assert!(db_path.exists());
        assert!(warehouse.dataset_counts().expect("counts").is_empty());
    }

    #[test]
    fn open_default_creates_the_file_under_tickload_home() {
        let temp = tempdir().expect("tempdir");
        let tickload_home = temp.path().join("home");
        // only test in this binary that touches TICKLOAD_HOME
        env::set_var("TICKLOAD_HOME", &tickload_home);
        let opened = Warehouse::open_default();
        env::remove_var("TICKLOAD_HOME");

        let warehouse = opened.expect("warehouse open");
        let db_path = tickload_home.join("warehouse.duckdb");
        assert_eq!(warehouse.db_path(), Some(db_path.as_path()));
        assert!(db_path.exists());
    }

    #[test]
    fn second_insert_of_same_key_is_ignored() {
        let warehouse = Warehouse::open_in_memory().expect("warehouse");
        let row = close_row("BBG000B9XRY4", "2024-03-01");

        assert!(warehouse.insert_record_if_absent(&row).expect("first insert"));
        assert!(!warehouse.insert_record_if_absent(&row).expect("second insert"));
        assert!(warehouse
            .record_exists("close_prices", "BBG000B9XRY4", "2024-03-01")
            .expect("exists"));
        assert!(!warehouse
            .record_exists("close_prices", "BBG000B9XRY4", "2024-03-04")
            .expect("exists"));

        let counts = warehouse.dataset_counts().expect("counts");
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].records, 1);
        assert_eq!(counts[0].first_day.as_deref(), Some("2024-03-01"));
    }

    #[test]
    fn same_key_in_different_datasets_is_distinct() {
        let warehouse = Warehouse::open_in_memory().expect("warehouse");
        let close = close_row("AAPL", "2024-03-01");
        let mut candle = close.clone();
        candle.dataset = String::from("daily_candles");
        candle.kind = String::from("candle");

        assert!(warehouse.insert_record_if_absent(&close).expect("close"));
        assert!(warehouse.insert_record_if_absent(&candle).expect("candle"));

        let loaded = warehouse
            .load_records("daily_candles", Some("AAPL"))
            .expect("load");
        assert_eq!(loaded, vec![candle]);
        assert!(warehouse
            .load_records("daily_candles", Some("MSFT"))
            .expect("load")
            .is_empty());
    }

    #[test]
    fn ingest_log_rows_are_queryable_by_run() {
        let warehouse = Warehouse::open_in_memory().expect("warehouse");
        let row = IngestLogRow {
            run_id: String::from("run-1"),
            dataset: String::from("close_prices"),
            entity_id: String::from("AAPL"),
            status: String::from("SUCCESS"),
            records_received: 2,
            saved: 1,
            existing: 1,
            invalid: 0,
            detail: None,
            latency_ms: Some(12),
        };
        warehouse.append_ingest_log(&row).expect("append");

        let rows = warehouse.ingest_log_for_run("run-1").expect("rows");
        assert_eq!(rows, vec![row]);
        assert!(warehouse.ingest_log_for_run("run-2").expect("rows").is_empty());
    }

    #[test]
    fn file_backed_records_survive_reopen() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("warehouse.duckdb");
        let config = WarehouseConfig {
            tickload_home: temp.path().to_path_buf(),
            db_path,
            max_pool_size: 1,
        };

        {
            let warehouse = Warehouse::open(config.clone()).expect("open");
            warehouse
                .insert_record_if_absent(&close_row("MSFT", "2024-01-02"))
                .expect("insert");
        }

        let warehouse = Warehouse::open(config).expect("reopen");
        assert!(!warehouse
            .insert_record_if_absent(&close_row("MSFT", "2024-01-02"))
            .expect("insert after reopen"));
    }
}
