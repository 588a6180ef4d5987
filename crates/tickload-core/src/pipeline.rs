//! Entry point wiring the rate limiter, retry executor and batch orchestrator.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::aggregator::RunSummary;
use crate::config::PipelineConfig;
use crate::orchestrator::{BatchOrchestrator, RunError};
use crate::provider::{MarketDataProvider, OperationClass};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryExecutor;
use crate::store::RecordStore;
use crate::worker::IngestionWorker;
use crate::{ConfigError, Item};

/// Rate-limited, retrying batch ingestion from one provider into one store.
pub struct IngestionPipeline {
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn RecordStore>,
    config: PipelineConfig,
    limiter: Arc<RateLimiter>,
    cancellation: CancellationToken,
}

impl IngestionPipeline {
    /// Validates `config` and builds a pipeline with its own rate limiter.
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        store: Arc<dyn RecordStore>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));
        Ok(Self {
            provider,
            store,
            config,
            limiter,
            cancellation: CancellationToken::new(),
        })
    }

    /// Shares `limiter` with other pipelines calling the same provider.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Token that stops every run of this pipeline once cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub async fn run(
        &self,
        operation: OperationClass,
        items: Vec<Item>,
    ) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let retry = RetryExecutor::new(self.config.retry_policy())
            .with_cancellation(self.cancellation.clone());
        let worker = IngestionWorker::new(
            run_id.as_str(),
            operation,
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            Arc::clone(&self.limiter),
            retry,
            self.cancellation.clone(),
        );
        let orchestrator = BatchOrchestrator::new(worker);

        let span = info_span!(
            "ingestion_run",
            run_id = %run_id,
            %operation,
            provider = self.provider.id()
        );
        async move {
            info!(
                items = items.len(),
                batch_size = self.config.batch_size,
                concurrency = self.config.worker_concurrency,
                "starting ingestion run"
            );
            let summary = orchestrator
                .ingest(
                    items,
                    self.config.batch_size,
                    self.config.batch_delay(),
                    self.config.worker_concurrency,
                )
                .await?;
            info!(
                requested = summary.total_requested,
                saved = summary.new_saved,
                existing = summary.existing,
                invalid = summary.invalid_filtered,
                failed = summary.fetch_failed,
                cancelled = summary.cancelled,
                elapsed_ms = summary.elapsed_ms,
                "{}",
                summary.message()
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}
