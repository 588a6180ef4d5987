//! # Tickload Core
//!
//! Rate-limited, retrying, concurrent batch ingestion of market data.
//!
//! ## Overview
//!
//! An [`IngestionPipeline`] pulls records for many instruments from a
//! [`MarketDataProvider`] and writes them to a [`RecordStore`]:
//!
//! - **Rate limiting** bounds concurrent calls and spaces call starts per
//!   operation class
//! - **Retries** repeat transient failures with capped exponential backoff
//! - **Batches** run sequentially with a pause between them; items inside a
//!   batch run concurrently
//! - **Dedupe** writes every `(entity_id, occurred_on)` key at most once
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`aggregator`] | Batch and run counters |
//! | [`config`] | Pipeline configuration and environment overrides |
//! | [`domain`] | Items, records and their validation |
//! | [`error`] | Core error types |
//! | [`fixture`] | Deterministic JSON-backed provider |
//! | [`orchestrator`] | Batch scheduling |
//! | [`pipeline`] | Pipeline entry point |
//! | [`provider`] | Provider contract and error classification |
//! | [`rate_limiter`] | Per-operation-class call budgets |
//! | [`retry`] | Backoff and retry executor |
//! | [`store`] | Store contract and in-memory store |
//! | [`warehouse_store`] | DuckDB-backed store |
//! | [`worker`] | Per-item processing |
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ IngestionPipeline  │
//! └─────────┬──────────┘
//!           ▼
//! ┌────────────────────┐   batch barrier + delay
//! │ BatchOrchestrator  │──────────────────────────┐
//! └─────────┬──────────┘                          │
//!           ▼ (bounded tasks)                     ▼
//! ┌────────────────────┐              ┌────────────────────┐
//! │ IngestionWorker    │─────────────▶│ ResultAggregator   │
//! └─────────┬──────────┘              └────────────────────┘
//!           ▼
//! ┌────────────────────┐   ┌────────────────────┐
//! │ RetryExecutor      │──▶│ RateLimiter        │──▶ MarketDataProvider
//! └────────────────────┘   └────────────────────┘
//!           │
//!           ▼
//!      RecordStore (exists / insert-if-absent)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tickload_core::{
//!     FixtureProvider, IngestionPipeline, Item, MemoryRecordStore, OperationClass,
//!     PipelineConfig,
//! };
//!
//! let provider = Arc::new(FixtureProvider::from_json(&fixture_json)?);
//! let store = Arc::new(MemoryRecordStore::new());
//! let pipeline = IngestionPipeline::new(provider, store, PipelineConfig::from_env()?)?;
//! let summary = pipeline.run(OperationClass::ClosePrices, items).await?;
//! println!("{}", summary.message());
//! ```

pub mod aggregator;
pub mod config;
pub mod domain;
pub mod error;
pub mod fixture;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod rate_limiter;
pub mod retry;
pub mod store;
pub mod warehouse_store;
pub mod worker;

pub use aggregator::{BatchOutcome, ResultAggregator, RunSummary};
pub use config::PipelineConfig;
pub use domain::{
    validate_currency_code, EntityId, InvalidReason, Item, Payload, Record, RecordKey,
    TradeDirection, TradingDate,
};
pub use error::{ConfigError, CoreError, ValidationError};
pub use fixture::FixtureProvider;
pub use orchestrator::{BatchOrchestrator, RunError};
pub use pipeline::IngestionPipeline;
pub use provider::{
    classify_provider_error, MarketDataProvider, OperationClass, ProviderError,
    ProviderErrorKind, ProviderFuture,
};
pub use rate_limiter::{QuotaPolicy, RateLimitStats, RateLimiter, RateLimiterConfig, RatePermit};
pub use retry::{Backoff, Disposition, RetryError, RetryExecutor, RetryPolicy};
pub use store::{
    ItemLogEntry, ItemLogStatus, MemoryRecordStore, RecordStore, StoreError, StoreFuture,
};
pub use tickload_warehouse::{DatasetCount, Warehouse, WarehouseConfig, WarehouseError};
pub use warehouse_store::WarehouseRecordStore;
pub use worker::{IngestError, IngestionWorker, ItemReport, ItemState, Outcome};
