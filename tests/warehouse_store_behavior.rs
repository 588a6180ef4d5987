//! Behavior-driven tests for ingesting into the DuckDB warehouse
//!
//! These tests verify HOW runs land in `market_records` and `ingest_log`
//! and that re-runs against the same warehouse stay idempotent.

use tempfile::tempdir;
use tickload_core::{
    ProviderErrorKind, Warehouse, WarehouseConfig, WarehouseRecordStore,
};
use tickload_tests::*;

fn provider() -> FixtureProvider {
    FixtureProvider::new("fixture")
        .with_records([
            candle("AAPL", "2024-03-01", 180.0),
            candle("AAPL", "2024-03-04", 182.0),
            candle("MSFT", "2024-03-04", 410.0),
        ])
        .fail_always(entity("GOOG"), ProviderErrorKind::Unavailable)
}

fn items() -> Vec<Item> {
    items_on("2024-03-05", &["AAPL", "MSFT", "GOOG"])
}

fn warehouse_config() -> PipelineConfig {
    PipelineConfig {
        max_retry_attempts: 2,
        max_retry_delay_ms: 2,
        ..fast_config()
    }
}

fn pipeline(warehouse: &Warehouse) -> IngestionPipeline {
    let store = WarehouseRecordStore::new(warehouse.clone(), "daily_candles", "fixture");
    IngestionPipeline::new(Arc::new(provider()), Arc::new(store), warehouse_config())
        .expect("valid config")
}

// =============================================================================
// Warehouse Store: Persistence
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn when_a_run_completes_records_and_audit_rows_are_written() {
    // Given: An empty in-memory warehouse
    let warehouse = Warehouse::open_in_memory().expect("warehouse");

    // When: Daily candles are ingested for three entities
    let summary = pipeline(&warehouse)
        .run(OperationClass::DailyCandles, items())
        .await
        .expect("run");

    // Then: Three candles are stored under the dataset
    assert_eq!(summary.new_saved, 3);
    assert_eq!(summary.fetch_failed, 1);
    let counts = warehouse.dataset_counts().expect("counts");
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].dataset, "daily_candles");
    assert_eq!(counts[0].records, 3);
    assert_eq!(counts[0].entities, 2);
    assert_eq!(counts[0].first_day.as_deref(), Some("2024-03-01"));
    assert_eq!(counts[0].last_day.as_deref(), Some("2024-03-04"));

    // And: Each item has one audit row with its own status
    let mut log = warehouse
        .ingest_log_for_run(&summary.run_id)
        .expect("ingest log");
    log.sort_by(|left, right| left.entity_id.cmp(&right.entity_id));
    let statuses: Vec<(&str, &str)> = log
        .iter()
        .map(|row| (row.entity_id.as_str(), row.status.as_str()))
        .collect();
    assert_eq!(
        statuses,
        vec![("AAPL", "SUCCESS"), ("GOOG", "ERROR"), ("MSFT", "SUCCESS")]
    );
    assert_eq!(log[0].records_received, 2);
    assert_eq!(log[0].saved, 2);
    assert!(log[1].detail.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn when_a_run_repeats_against_a_file_warehouse_nothing_is_duplicated() {
    // Given: A warehouse file loaded by a first run
    let temp = tempdir().expect("tempdir");
    let config = WarehouseConfig::with_db_path(temp.path().join("candles.duckdb"));
    let warehouse = Warehouse::open(config.clone()).expect("warehouse");
    pipeline(&warehouse)
        .run(OperationClass::DailyCandles, items())
        .await
        .expect("first run");
    drop(warehouse);

    // When: The warehouse is reopened and the same run repeats
    let warehouse = Warehouse::open(config).expect("reopen");
    let second = pipeline(&warehouse)
        .run(OperationClass::DailyCandles, items())
        .await
        .expect("second run");

    // Then: Every record is reported existing and the row count is unchanged
    assert_eq!(second.new_saved, 0);
    assert_eq!(second.existing, 3);
    let rows = warehouse
        .load_records("daily_candles", Some("AAPL"))
        .expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.kind == "candle"));
    assert_eq!(warehouse.dataset_counts().expect("counts")[0].records, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_workers_race_on_one_key_the_warehouse_keeps_one_row() {
    // Given: Six copies of the same item in one fully concurrent batch
    let warehouse = Warehouse::open_in_memory().expect("warehouse");
    let store = WarehouseRecordStore::new(warehouse.clone(), "daily_candles", "fixture");
    let pipeline =
        IngestionPipeline::new(Arc::new(provider()), Arc::new(store), racing_config(10))
            .expect("valid config");

    // When: The run processes them together
    let summary = pipeline
        .run(
            OperationClass::DailyCandles,
            items_on("2024-03-01", &["AAPL"; 6]),
        )
        .await
        .expect("run");

    // Then: One insert won and the other five counted as existing
    assert_eq!(summary.new_saved, 1);
    assert_eq!(summary.existing, 5);
    assert_eq!(summary.fetch_failed, 0);
    let rows = warehouse
        .load_records("daily_candles", Some("AAPL"))
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].occurred_on, "2024-03-01");
}
