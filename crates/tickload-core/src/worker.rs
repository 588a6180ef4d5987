//! Per-item ingestion: fetch, validate, dedupe, save, report.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::provider::{classify_provider_error, MarketDataProvider, OperationClass, ProviderError};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryError, RetryExecutor};
use crate::store::{ItemLogEntry, ItemLogStatus, RecordStore, StoreError};
use crate::{InvalidReason, Item, Record, RecordKey};

/// Lifecycle of one item within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Fetching,
    Fetched,
    Validating,
    Deduping,
    Saved,
    Existing,
    Invalid,
    FetchFailed,
    NoData,
}

impl ItemState {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Saved | Self::Existing | Self::Invalid | Self::FetchFailed | Self::NoData
        )
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Fetching)
                | (Self::Fetching, Self::Fetched | Self::FetchFailed)
                | (Self::Fetched, Self::Validating | Self::NoData)
                | (Self::Validating, Self::Deduping | Self::Invalid)
                | (Self::Deduping, Self::Saved | Self::Existing | Self::FetchFailed)
        )
    }
}

impl Display for ItemState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Validating => "validating",
            Self::Deduping => "deduping",
            Self::Saved => "saved",
            Self::Existing => "existing",
            Self::Invalid => "invalid",
            Self::FetchFailed => "fetch_failed",
            Self::NoData => "no_data",
        };
        f.write_str(name)
    }
}

/// Item-level failure. Never aborts the batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Provider(#[from] RetryError<ProviderError>),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

/// Result for one record (or, for fetch failures, the whole item).
#[derive(Debug)]
pub enum Outcome {
    Saved(Record),
    AlreadyExisted(RecordKey),
    Invalid { key: RecordKey, reason: InvalidReason },
    FetchFailed(IngestError),
}

#[derive(Debug)]
pub struct ItemReport {
    pub item: Item,
    pub state: ItemState,
    pub outcomes: Vec<Outcome>,
    pub records_received: usize,
    pub attempts: u32,
    pub latency: Duration,
    /// Finished after the run was cancelled; outcomes are not counted.
    pub discarded: bool,
}

impl ItemReport {
    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| predicate(outcome)).count()
    }

    pub fn saved(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Saved(_)))
    }

    pub fn existing(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::AlreadyExisted(_)))
    }

    pub fn invalid(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Invalid { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::FetchFailed(_)))
    }
}

struct StateTracker {
    state: ItemState,
}

impl StateTracker {
    fn advance(&mut self, next: ItemState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal item transition {} -> {}",
            self.state,
            next
        );
        trace!(from = %self.state, to = %next, "item state");
        self.state = next;
    }
}

/// Processes single items. Cheap to clone; one clone runs per worker task.
#[derive(Clone)]
pub struct IngestionWorker {
    run_id: Arc<str>,
    operation: OperationClass,
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn RecordStore>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    cancellation: CancellationToken,
}

impl IngestionWorker {
    pub fn new(
        run_id: impl Into<Arc<str>>,
        operation: OperationClass,
        provider: Arc<dyn MarketDataProvider>,
        store: Arc<dyn RecordStore>,
        limiter: Arc<RateLimiter>,
        retry: RetryExecutor,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            operation,
            provider,
            store,
            limiter,
            retry,
            cancellation,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn operation(&self) -> OperationClass {
        self.operation
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Drives `item` to a terminal state.
    ///
    /// Returns a report with `discarded = true` and no outcomes when the run
    /// was cancelled before the item started or while its fetch was in flight.
    pub async fn process(&self, item: Item) -> ItemReport {
        let started = Instant::now();
        let mut tracker = StateTracker {
            state: ItemState::Pending,
        };

        if self.cancellation.is_cancelled() {
            debug!("run cancelled before item started");
            return self.report(item, tracker.state, Vec::new(), 0, 0, started, true);
        }

        tracker.advance(ItemState::Fetching);
        let fetched = self.fetch(&item).await;

        if self.cancellation.is_cancelled() {
            debug!("run cancelled while fetching, discarding result");
            let attempts = match &fetched {
                Ok((_, attempts)) => *attempts,
                Err(error) => error.attempts(),
            };
            return self.report(item, tracker.state, Vec::new(), 0, attempts, started, true);
        }

        let (records, attempts) = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                let attempts = error.attempts();
                warn!(attempts, error = %error, "fetch failed");
                tracker.advance(ItemState::FetchFailed);
                let outcomes = vec![Outcome::FetchFailed(IngestError::Provider(error))];
                let report = self.report(item, tracker.state, outcomes, 0, attempts, started, false);
                self.log_item(&report, Some(report_detail(&report))).await;
                return report;
            }
        };

        tracker.advance(ItemState::Fetched);
        let records_received = records.len();
        if records.is_empty() {
            debug!("provider returned no data");
            tracker.advance(ItemState::NoData);
            let report = self.report(item, tracker.state, Vec::new(), 0, attempts, started, false);
            self.log_item(&report, None).await;
            return report;
        }

        tracker.advance(ItemState::Validating);
        let mut outcomes = Vec::with_capacity(records.len());
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match record.validate() {
                Ok(()) => valid.push(record),
                Err(reason) => {
                    debug!(key = %record.key(), %reason, "filtered invalid record");
                    outcomes.push(Outcome::Invalid {
                        key: record.key(),
                        reason,
                    });
                }
            }
        }

        if valid.is_empty() {
            tracker.advance(ItemState::Invalid);
        } else {
            tracker.advance(ItemState::Deduping);
            for record in valid {
                outcomes.push(self.persist(record).await);
            }
            tracker.advance(dedupe_state(&outcomes));
        }

        let report = self.report(
            item,
            tracker.state,
            outcomes,
            records_received,
            attempts,
            started,
            false,
        );
        info!(
            received = report.records_received,
            saved = report.saved(),
            existing = report.existing(),
            invalid = report.invalid(),
            failed = report.failed(),
            "item processed"
        );
        let detail = (report.failed() > 0).then(|| report_detail(&report));
        self.log_item(&report, detail).await;
        report
    }

    async fn fetch(&self, item: &Item) -> Result<(Vec<Record>, u32), RetryError<ProviderError>> {
        let mut last_attempt = 0;
        let records = self
            .retry
            .run(
                |attempt| {
                    last_attempt = attempt;
                    async move {
                        let permit = self.limiter.acquire(self.operation).await;
                        trace!(attempt, "provider call");
                        let result = self.provider.fetch(self.operation, item).await;
                        self.limiter.release(permit);
                        result
                    }
                },
                classify_provider_error,
            )
            .await?;
        Ok((records, last_attempt))
    }

    async fn persist(&self, record: Record) -> Outcome {
        let key = record.key();
        match self.store.exists(&key).await {
            Ok(true) => {
                trace!(%key, "record already stored");
                return Outcome::AlreadyExisted(key);
            }
            Ok(false) => {}
            Err(error) => {
                warn!(%key, error = %error, "existence check failed, attempting insert");
            }
        }

        match self.store.save(&record).await {
            Ok(()) => Outcome::Saved(record),
            Err(StoreError::DuplicateKey { key }) => {
                debug!(%key, "lost insert race, counting as existing");
                Outcome::AlreadyExisted(key)
            }
            Err(error) => {
                warn!(%key, error = %error, "saving record failed");
                Outcome::FetchFailed(IngestError::Store(error))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        item: Item,
        state: ItemState,
        outcomes: Vec<Outcome>,
        records_received: usize,
        attempts: u32,
        started: Instant,
        discarded: bool,
    ) -> ItemReport {
        ItemReport {
            item,
            state,
            outcomes,
            records_received,
            attempts,
            latency: started.elapsed(),
            discarded,
        }
    }

    async fn log_item(&self, report: &ItemReport, detail: Option<String>) {
        let status = match report.state {
            ItemState::NoData => ItemLogStatus::NoData,
            ItemState::Invalid => ItemLogStatus::Invalid,
            ItemState::FetchFailed => ItemLogStatus::Error,
            _ => ItemLogStatus::Success,
        };
        let entry = ItemLogEntry {
            run_id: self.run_id.to_string(),
            operation: self.operation,
            entity_id: report.item.entity_id.clone(),
            status,
            records_received: report.records_received,
            saved: report.saved(),
            existing: report.existing(),
            invalid: report.invalid(),
            detail,
            latency: report.latency,
        };
        if let Err(error) = self.store.log_item(&entry).await {
            warn!(error = %error, "failed to write ingest log entry");
        }
    }
}

fn dedupe_state(outcomes: &[Outcome]) -> ItemState {
    let any = |predicate: fn(&Outcome) -> bool| outcomes.iter().any(predicate);
    if any(|outcome| matches!(outcome, Outcome::Saved(_))) {
        ItemState::Saved
    } else if any(|outcome| matches!(outcome, Outcome::AlreadyExisted(_))) {
        ItemState::Existing
    } else {
        ItemState::FetchFailed
    }
}

fn report_detail(report: &ItemReport) -> String {
    report
        .outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            Outcome::FetchFailed(error) => Some(error.to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("; ")
}
