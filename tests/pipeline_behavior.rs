//! Behavior-driven tests for the ingestion pipeline
//!
//! These tests verify HOW a run counts, dedupes, filters and isolates
//! failures across batches, and how it reacts to cancellation.

use std::time::{Duration, Instant};

use tickload_core::{
    ItemLogStatus, MarketDataProvider, MemoryRecordStore, ProviderErrorKind, ProviderFuture,
    RecordKey, RecordStore, RunError, StoreError, StoreFuture,
};
use tickload_tests::*;

const SCOPE: &str = "2024-03-05";

fn items(entities: &[&str]) -> Vec<Item> {
    items_on(SCOPE, entities)
}

fn pipeline(
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn RecordStore>,
    config: PipelineConfig,
) -> IngestionPipeline {
    IngestionPipeline::new(provider, store, config).expect("valid config")
}

fn abc_provider() -> FixtureProvider {
    FixtureProvider::new("fixture")
        .with_records([close("A", "2024-03-01", 10.0), close("C", "2024-03-04", 30.0)])
        .with_empty(entity("B"))
}

// =============================================================================
// Pipeline: Counting And Dedupe
// =============================================================================

#[tokio::test]
async fn when_one_item_has_no_data_the_others_are_saved() {
    // Given: A and C have one close price each, B has nothing
    let provider = Arc::new(abc_provider());
    let store = Arc::new(MemoryRecordStore::new());
    let pipeline = pipeline(provider, store.clone(), fast_config());

    // When: The run covers A, B and C
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("run");

    // Then: Two records were requested and saved, and B is reported missing
    assert_eq!(summary.total_items, 3);
    assert_eq!(summary.total_requested, 2);
    assert_eq!(summary.new_saved, 2);
    assert_eq!(summary.existing, 0);
    assert_eq!(summary.invalid_filtered, 0);
    assert_eq!(summary.fetch_failed, 0);
    assert_eq!(summary.missing_from_provider, 1);
    assert!(summary.success());

    // And: The store holds exactly the A and C records
    let keys: Vec<RecordKey> = store.records().iter().map(Record::key).collect();
    assert_eq!(
        keys,
        vec![
            RecordKey {
                entity_id: entity("A"),
                occurred_on: day("2024-03-01"),
            },
            RecordKey {
                entity_id: entity("C"),
                occurred_on: day("2024-03-04"),
            },
        ]
    );
    assert_eq!(summary.saved.len(), 2);
}

#[tokio::test]
async fn when_a_record_is_already_stored_it_counts_as_existing() {
    // Given: The A record was saved by an earlier run
    let provider = Arc::new(abc_provider());
    let store = Arc::new(MemoryRecordStore::with_records([close("A", "2024-03-01", 10.0)]));
    let pipeline = pipeline(provider, store.clone(), fast_config());

    // When: The run covers A, B and C
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("run");

    // Then: Only C is new
    assert_eq!(summary.new_saved, 1);
    assert_eq!(summary.existing, 1);
    assert_eq!(store.len(), 2);
    assert_eq!(
        summary.message(),
        "Loaded 1 new records, 1 already existed. 1 items had no data from the provider."
    );
}

#[tokio::test]
async fn when_the_same_run_repeats_nothing_new_is_saved() {
    // Given: A store filled by a first run
    let provider = Arc::new(abc_provider());
    let store = Arc::new(MemoryRecordStore::new());
    let pipeline = pipeline(provider, store.clone(), fast_config());
    pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("first run");

    // When: The identical run executes again
    let second = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("second run");

    // Then: Everything is reported as existing and the store is unchanged
    assert_eq!(second.new_saved, 0);
    assert_eq!(second.existing, 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn when_records_are_invalid_they_never_reach_the_store() {
    // Given: A sentinel-dated close price and an unfinished candle
    let provider = FixtureProvider::new("fixture").with_records([
        Record::new(
            entity("A"),
            TradingDate::EPOCH,
            Payload::ClosePrice {
                price: 0.0,
                currency: String::from("USD"),
            },
        ),
        Record::new(
            entity("B"),
            day("2024-03-04"),
            Payload::Candle {
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10,
                is_complete: false,
            },
        ),
    ]);
    let store = Arc::new(MemoryRecordStore::new());

    // When: Both operation classes run over them
    let prices = pipeline(Arc::new(provider), store.clone(), fast_config());
    let closes = prices
        .run(OperationClass::ClosePrices, items(&["A"]))
        .await
        .expect("close prices run");
    let candles = prices
        .run(OperationClass::DailyCandles, items(&["B"]))
        .await
        .expect("candles run");

    // Then: Both were filtered and save was never called
    assert_eq!(closes.total_requested, 1);
    assert_eq!(closes.invalid_filtered, 1);
    assert_eq!(candles.invalid_filtered, 1);
    assert_eq!(closes.new_saved + candles.new_saved, 0);
    assert_eq!(store.save_calls(), 0);
    assert!(store.is_empty());

    // And: The audit log tells filtered items apart from successful ones
    let statuses: Vec<ItemLogStatus> = store
        .log_entries()
        .into_iter()
        .map(|entry| entry.status)
        .collect();
    assert_eq!(statuses, vec![ItemLogStatus::Invalid, ItemLogStatus::Invalid]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_workers_race_on_one_key_it_is_written_once() {
    // Given: Six copies of the same item in one fully concurrent batch
    let provider = Arc::new(abc_provider());
    let store = Arc::new(MemoryRecordStore::new());
    let pipeline = pipeline(provider.clone(), store.clone(), racing_config(10));

    // When: The run processes them together
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A"; 6]))
        .await
        .expect("run");

    // Then: One worker saved the record and the others saw it as existing
    assert_eq!(provider.calls(&entity("A")), 6);
    assert_eq!(summary.batches_total, 1);
    assert_eq!(summary.new_saved, 1);
    assert_eq!(summary.existing, 5);
    assert_eq!(summary.fetch_failed, 0);
    assert_eq!(store.len(), 1);
}

// =============================================================================
// Pipeline: Failure Isolation
// =============================================================================

#[tokio::test]
async fn when_one_item_keeps_failing_the_rest_of_the_batch_completes() {
    // Given: Ten entities, the fourth always unavailable
    let names: Vec<String> = (0..10).map(|index| format!("E{index}")).collect();
    let provider = FixtureProvider::new("fixture")
        .with_records(names.iter().map(|name| close(name, "2024-03-01", 1.0)))
        .fail_always(entity("E3"), ProviderErrorKind::Unavailable);
    let provider = Arc::new(provider);
    let store = Arc::new(MemoryRecordStore::new());
    let config = PipelineConfig {
        batch_size: 4,
        max_retry_attempts: 2,
        ..fast_config()
    };
    let pipeline = pipeline(provider.clone(), store.clone(), config);

    // When: The run covers all ten
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&refs))
        .await
        .expect("run");

    // Then: Exactly one item failed after its retry budget, the others saved
    assert_eq!(summary.fetch_failed, 1);
    assert_eq!(summary.new_saved, 9);
    assert_eq!(summary.batches_total, 3);
    assert_eq!(summary.batches_completed, 3);
    assert!(!summary.success());
    assert_eq!(provider.calls(&entity("E3")), 2);

    // And: The audit log marks only that item as an error
    let errors: Vec<_> = store
        .log_entries()
        .into_iter()
        .filter(|entry| entry.status == ItemLogStatus::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].entity_id, entity("E3"));
    assert!(errors[0].detail.is_some());
}

#[tokio::test]
async fn when_provider_rejects_an_item_it_is_not_retried() {
    // Given: B fails with "not found"
    let provider = Arc::new(abc_provider().fail_always(entity("B"), ProviderErrorKind::NotFound));
    let store = Arc::new(MemoryRecordStore::new());
    let pipeline = pipeline(provider.clone(), store, fast_config());

    // When: The run covers A, B and C
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("run");

    // Then: B was called once and counted as failed
    assert_eq!(provider.calls(&entity("B")), 1);
    assert_eq!(summary.fetch_failed, 1);
    assert_eq!(summary.new_saved, 2);
}

#[tokio::test]
async fn when_transient_failures_clear_the_item_is_saved() {
    // Given: A is rate limited twice before answering
    let provider =
        Arc::new(abc_provider().fail_times(entity("A"), ProviderErrorKind::RateLimited, 2));
    let store = Arc::new(MemoryRecordStore::new());
    let pipeline = pipeline(provider.clone(), store.clone(), fast_config());

    // When: The run covers A
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A"]))
        .await
        .expect("run");

    // Then: The third call delivered the record
    assert_eq!(provider.calls(&entity("A")), 3);
    assert_eq!(summary.new_saved, 1);
    assert_eq!(summary.fetch_failed, 0);
    assert_eq!(
        pipeline
            .rate_limiter()
            .stats(OperationClass::ClosePrices)
            .granted_total,
        3
    );
}

/// Store whose existence check always misses, so duplicates surface on save.
struct BlindStore {
    inner: MemoryRecordStore,
}

impl RecordStore for BlindStore {
    fn exists<'a>(&'a self, _key: &'a RecordKey) -> StoreFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    fn save<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, ()> {
        self.inner.save(record)
    }
}

#[tokio::test]
async fn when_save_reports_a_duplicate_it_counts_as_existing() {
    // Given: A is stored but the existence check cannot see it
    let provider = Arc::new(abc_provider());
    let store = Arc::new(BlindStore {
        inner: MemoryRecordStore::with_records([close("A", "2024-03-01", 10.0)]),
    });
    let pipeline = pipeline(provider, store.clone(), fast_config());

    // When: The run covers A
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A"]))
        .await
        .expect("run");

    // Then: The rejected insert is reported as existing, not as a failure
    assert_eq!(summary.existing, 1);
    assert_eq!(summary.new_saved, 0);
    assert_eq!(summary.fetch_failed, 0);
    assert_eq!(store.inner.save_calls(), 1);
}

/// Store whose writes always fail.
struct BrokenStore;

impl RecordStore for BrokenStore {
    fn exists<'a>(&'a self, _key: &'a RecordKey) -> StoreFuture<'a, bool> {
        Box::pin(async { Err(StoreError::backend("connection reset")) })
    }

    fn save<'a>(&'a self, _record: &'a Record) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(StoreError::backend("disk full")) })
    }
}

#[tokio::test]
async fn when_the_store_fails_the_item_counts_as_failed() {
    // Given: A store rejecting every write
    let provider = Arc::new(abc_provider());
    let pipeline = pipeline(provider, Arc::new(BrokenStore), fast_config());

    // When: The run covers A and C
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "C"]))
        .await
        .expect("run");

    // Then: Both records were received but none saved
    assert_eq!(summary.total_requested, 2);
    assert_eq!(summary.new_saved, 0);
    assert_eq!(summary.fetch_failed, 2);
}

/// Provider that panics for one entity and defers to a fixture otherwise.
struct PanickingProvider {
    inner: FixtureProvider,
    poison: EntityId,
}

impl MarketDataProvider for PanickingProvider {
    fn id(&self) -> &str {
        "panicking"
    }

    fn fetch<'a>(&'a self, operation: OperationClass, item: &'a Item) -> ProviderFuture<'a> {
        if item.entity_id == self.poison {
            panic!("provider bug for {}", item.entity_id);
        }
        self.inner.fetch(operation, item)
    }
}

#[tokio::test]
async fn when_a_worker_dies_the_run_stops_with_a_partial_summary() {
    // Given: The second batch contains an entity that crashes the provider
    let provider = Arc::new(PanickingProvider {
        inner: abc_provider(),
        poison: entity("BOOM"),
    });
    let store = Arc::new(MemoryRecordStore::new());
    let config = PipelineConfig {
        batch_size: 2,
        ..fast_config()
    };
    let pipeline = pipeline(provider, store.clone(), config);

    // When: The run covers A, C, BOOM and B
    let result = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "C", "BOOM", "B"]))
        .await;

    // Then: The run is aborted at batch 1 with the first batch's counts
    let error = result.expect_err("aborted");
    let RunError::BatchAborted { batch_index, .. } = &error;
    assert_eq!(*batch_index, 1);
    let partial = error.partial();
    assert_eq!(partial.batches_completed, 1);
    assert_eq!(partial.new_saved, 2);
    assert_eq!(store.len(), 2);
}

// =============================================================================
// Pipeline: Batch Pacing And Cancellation
// =============================================================================

#[tokio::test]
async fn when_batches_run_the_delay_separates_them() {
    // Given: Three single-item batches with a 50ms delay
    let provider = Arc::new(abc_provider());
    let store = Arc::new(MemoryRecordStore::new());
    let config = PipelineConfig {
        batch_size: 1,
        batch_delay_ms: 50,
        ..fast_config()
    };
    let pipeline = pipeline(provider, store, config);
    let started = Instant::now();

    // When: The run covers A, B and C
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("run");

    // Then: Two delays elapsed and no delay followed the last batch
    assert_eq!(summary.batches_completed, 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_000), "{elapsed:?}");
}

#[tokio::test]
async fn when_cancelled_during_the_batch_delay_later_batches_never_start() {
    // Given: Two-item batches separated by a 10s delay
    let provider = Arc::new(
        FixtureProvider::new("fixture").with_records(
            ["A", "B", "C", "D", "E", "F"]
                .into_iter()
                .map(|name| close(name, "2024-03-01", 1.0)),
        ),
    );
    let store = Arc::new(MemoryRecordStore::new());
    let config = PipelineConfig {
        batch_size: 2,
        batch_delay_ms: 10_000,
        ..fast_config()
    };
    let pipeline = pipeline(provider.clone(), store.clone(), config);
    let token = pipeline.cancellation_token();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });
    let started = Instant::now();

    // When: The run is cancelled while waiting after the first batch
    let summary = pipeline
        .run(
            OperationClass::ClosePrices,
            items(&["A", "B", "C", "D", "E", "F"]),
        )
        .await
        .expect("run");
    canceller.await.expect("canceller");

    // Then: Only the first batch was processed and the run ended promptly
    assert!(summary.cancelled);
    assert!(!summary.success());
    assert_eq!(summary.batches_total, 3);
    assert_eq!(summary.batches_completed, 1);
    assert_eq!(summary.new_saved, 2);
    assert_eq!(provider.total_calls(), 2);
    assert_eq!(store.len(), 2);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn when_cancelled_before_start_no_provider_calls_happen() {
    // Given: A pipeline whose token is already cancelled
    let provider = Arc::new(abc_provider());
    let store = Arc::new(MemoryRecordStore::new());
    let pipeline = pipeline(provider.clone(), store, fast_config());
    pipeline.cancellation_token().cancel();

    // When: A run starts
    let summary = pipeline
        .run(OperationClass::ClosePrices, items(&["A", "B", "C"]))
        .await
        .expect("run");

    // Then: Nothing was fetched
    assert!(summary.cancelled);
    assert_eq!(summary.batches_completed, 0);
    assert_eq!(provider.total_calls(), 0);
}
