//! Outcome accounting for batches and runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::provider::OperationClass;
use crate::worker::{ItemReport, ItemState, Outcome};
use crate::Record;

/// Thread-safe counters shared by the workers of one batch.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    items: AtomicUsize,
    requested: AtomicUsize,
    saved: AtomicUsize,
    already_existed: AtomicUsize,
    invalid_filtered: AtomicUsize,
    fetch_failed: AtomicUsize,
    missing_from_provider: AtomicUsize,
    saved_records: Mutex<Vec<Record>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one finished item. Discarded reports are ignored.
    pub fn record(&self, report: ItemReport) {
        if report.discarded {
            return;
        }

        self.items.fetch_add(1, Ordering::Relaxed);
        self.requested
            .fetch_add(report.records_received, Ordering::Relaxed);
        if report.state == ItemState::NoData {
            self.missing_from_provider.fetch_add(1, Ordering::Relaxed);
        }

        let mut saved = Vec::new();
        for outcome in report.outcomes {
            match outcome {
                Outcome::Saved(record) => saved.push(record),
                Outcome::AlreadyExisted(_) => {
                    self.already_existed.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Invalid { .. } => {
                    self.invalid_filtered.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::FetchFailed(_) => {
                    self.fetch_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !saved.is_empty() {
            self.saved.fetch_add(saved.len(), Ordering::Relaxed);
            self.saved_records
                .lock()
                .expect("aggregator records mutex poisoned")
                .extend(saved);
        }
    }

    /// Records every report, then takes the accumulated outcome.
    pub fn merge(&self, reports: impl IntoIterator<Item = ItemReport>) -> BatchOutcome {
        for report in reports {
            self.record(report);
        }
        self.take()
    }

    /// Drains the counters into a [`BatchOutcome`], leaving them at zero.
    pub fn take(&self) -> BatchOutcome {
        let saved_records = std::mem::take(
            &mut *self
                .saved_records
                .lock()
                .expect("aggregator records mutex poisoned"),
        );
        BatchOutcome {
            items: self.items.swap(0, Ordering::Relaxed),
            requested: self.requested.swap(0, Ordering::Relaxed),
            saved: self.saved.swap(0, Ordering::Relaxed),
            already_existed: self.already_existed.swap(0, Ordering::Relaxed),
            invalid_filtered: self.invalid_filtered.swap(0, Ordering::Relaxed),
            fetch_failed: self.fetch_failed.swap(0, Ordering::Relaxed),
            missing_from_provider: self.missing_from_provider.swap(0, Ordering::Relaxed),
            saved_records,
        }
    }
}

/// Counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub items: usize,
    /// Records received from the provider, invalid ones included.
    pub requested: usize,
    pub saved: usize,
    pub already_existed: usize,
    pub invalid_filtered: usize,
    pub fetch_failed: usize,
    /// Items for which the provider returned nothing.
    pub missing_from_provider: usize,
    #[serde(skip)]
    pub saved_records: Vec<Record>,
}

/// Counts for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub operation: OperationClass,
    pub total_items: usize,
    pub total_requested: usize,
    pub new_saved: usize,
    pub existing: usize,
    pub invalid_filtered: usize,
    pub fetch_failed: usize,
    pub missing_from_provider: usize,
    pub batches_total: usize,
    pub batches_completed: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub saved: Vec<Record>,
}

impl RunSummary {
    pub fn new(
        run_id: impl Into<String>,
        operation: OperationClass,
        total_items: usize,
        batches_total: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            operation,
            total_items,
            total_requested: 0,
            new_saved: 0,
            existing: 0,
            invalid_filtered: 0,
            fetch_failed: 0,
            missing_from_provider: 0,
            batches_total,
            batches_completed: 0,
            cancelled: false,
            elapsed_ms: 0,
            saved: Vec::new(),
        }
    }

    /// Folds a completed batch into the run totals.
    pub fn absorb(&mut self, batch: BatchOutcome) {
        self.total_requested += batch.requested;
        self.new_saved += batch.saved;
        self.existing += batch.already_existed;
        self.invalid_filtered += batch.invalid_filtered;
        self.fetch_failed += batch.fetch_failed;
        self.missing_from_provider += batch.missing_from_provider;
        self.batches_completed += 1;
        self.saved.extend(batch.saved_records);
    }

    /// At least one record arrived and nothing failed.
    pub fn success(&self) -> bool {
        self.total_requested > 0 && self.fetch_failed == 0 && !self.cancelled
    }

    pub fn message(&self) -> String {
        if self.cancelled {
            return format!(
                "Ingestion cancelled after {} of {} batches: {} new, {} existing.",
                self.batches_completed, self.batches_total, self.new_saved, self.existing
            );
        }
        if self.total_requested == 0 && self.fetch_failed == 0 {
            return String::from("No new data to load.");
        }

        let mut message = format!(
            "Loaded {} new records, {} already existed.",
            self.new_saved, self.existing
        );
        if self.invalid_filtered > 0 {
            message.push_str(&format!(
                " Filtered {} invalid records.",
                self.invalid_filtered
            ));
        }
        if self.missing_from_provider > 0 {
            message.push_str(&format!(
                " {} items had no data from the provider.",
                self.missing_from_provider
            ));
        }
        if self.fetch_failed > 0 {
            message.push_str(&format!(" {} fetches failed.", self.fetch_failed));
        }
        message
    }
}
