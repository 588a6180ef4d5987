//! Sequential batches of concurrently processed items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::aggregator::{BatchOutcome, ResultAggregator, RunSummary};
use crate::worker::IngestionWorker;
use crate::Item;

#[derive(Debug, Error)]
pub enum RunError {
    /// A worker task died instead of reporting. `partial` holds the batches
    /// that completed before it.
    #[error("batch {batch_index} aborted: {reason}")]
    BatchAborted {
        batch_index: usize,
        reason: String,
        partial: Box<RunSummary>,
    },
}

impl RunError {
    pub fn partial(&self) -> &RunSummary {
        match self {
            Self::BatchAborted { partial, .. } => partial,
        }
    }
}

pub struct BatchOrchestrator {
    worker: IngestionWorker,
}

impl BatchOrchestrator {
    pub fn new(worker: IngestionWorker) -> Self {
        Self { worker }
    }

    /// Runs `items` in contiguous batches of `batch_size`.
    ///
    /// Items of one batch run on up to `concurrency` tasks and the whole batch
    /// finishes before the next starts. `batch_delay` separates batches.
    /// Cancellation stops the run before the next batch, or during the delay,
    /// and is reported through [`RunSummary::cancelled`].
    pub async fn ingest(
        &self,
        items: Vec<Item>,
        batch_size: usize,
        batch_delay: Duration,
        concurrency: usize,
    ) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let batch_size = batch_size.max(1);
        let batches: Vec<Vec<Item>> = items.chunks(batch_size).map(<[Item]>::to_vec).collect();
        let batches_total = batches.len();
        let cancellation = self.worker.cancellation().clone();

        let mut summary = RunSummary::new(
            self.worker.run_id(),
            self.worker.operation(),
            items.len(),
            batches_total,
        );

        for (batch_index, batch) in batches.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                info!(batch = batch_index, "run cancelled before batch start");
                summary.cancelled = true;
                break;
            }

            let batch_len = batch.len();
            let outcome = match self
                .run_batch(batch_index, batch, concurrency)
                .instrument(info_span!("batch", batch = batch_index, items = batch_len))
                .await
            {
                Ok(outcome) => outcome,
                Err(reason) => {
                    warn!(batch = batch_index, %reason, "batch aborted");
                    summary.elapsed_ms = elapsed_ms(started);
                    return Err(RunError::BatchAborted {
                        batch_index,
                        reason,
                        partial: Box::new(summary),
                    });
                }
            };

            info!(
                batch = batch_index,
                of = batches_total,
                saved = outcome.saved,
                existing = outcome.already_existed,
                invalid = outcome.invalid_filtered,
                failed = outcome.fetch_failed,
                "batch complete"
            );
            summary.absorb(outcome);

            if cancellation.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let more_batches = batch_index + 1 < batches_total;
            if more_batches && !batch_delay.is_zero() {
                tokio::select! {
                    () = cancellation.cancelled() => {
                        info!(batch = batch_index, "run cancelled during batch delay");
                        summary.cancelled = true;
                        break;
                    }
                    () = tokio::time::sleep(batch_delay) => {}
                }
            }
        }

        summary.elapsed_ms = elapsed_ms(started);
        Ok(summary)
    }

    async fn run_batch(
        &self,
        batch_index: usize,
        batch: Vec<Item>,
        concurrency: usize,
    ) -> Result<BatchOutcome, String> {
        let slots = Arc::new(Semaphore::new(concurrency.max(1)));
        let aggregator = Arc::new(ResultAggregator::new());
        let mut tasks = JoinSet::new();

        for item in batch {
            let slot = Arc::clone(&slots)
                .acquire_owned()
                .await
                .expect("batch semaphore is never closed");
            let worker = self.worker.clone();
            let aggregator = Arc::clone(&aggregator);
            let span = info_span!(
                "item",
                batch = batch_index,
                entity_id = %item.entity_id,
                scope = %item.scope
            );
            tasks.spawn(
                async move {
                    let report = worker.process(item).await;
                    aggregator.record(report);
                    drop(slot);
                }
                .instrument(span),
            );
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                failure.get_or_insert_with(|| error.to_string());
            }
        }

        match failure {
            Some(reason) => Err(reason),
            None => Ok(aggregator.take()),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
