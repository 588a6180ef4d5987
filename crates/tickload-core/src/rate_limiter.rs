//! Per-operation-class outbound call budgets.
//!
//! Each [`OperationClass`] owns an independent budget made of a concurrency
//! semaphore, the instant of the last granted call and an optional sustained
//! quota. Spacing is measured between grants, so a slow call does not let its
//! successor start early.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::Quota;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

use crate::provider::OperationClass;

type DirectRateLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Sustained call quota: at most `limit` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub window: Duration,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_concurrent_requests: usize,
    pub min_request_interval: Duration,
    pub quota: Option<QuotaPolicy>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            min_request_interval: Duration::from_millis(100),
            quota: None,
        }
    }
}

struct OperationBudget {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_granted: Mutex<Option<Instant>>,
    quota: Option<DirectRateLimiter>,
    granted_total: AtomicU64,
}

impl OperationBudget {
    fn new(config: &RateLimiterConfig) -> Self {
        let max_permits = config.max_concurrent_requests.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            last_granted: Mutex::new(None),
            quota: config
                .quota
                .map(|policy| DirectRateLimiter::direct(quota_from_window(policy.window, policy.limit))),
            granted_total: AtomicU64::new(0),
        }
    }
}

/// Snapshot of one operation class budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub operation: OperationClass,
    pub available_permits: usize,
    pub max_permits: usize,
    pub granted_total: u64,
}

/// Holds one concurrency permit; dropping it releases the permit.
#[derive(Debug)]
pub struct RatePermit {
    operation: OperationClass,
    granted_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

/// Rate limiter shared by every worker of one or more pipelines.
pub struct RateLimiter {
    config: RateLimiterConfig,
    budgets: HashMap<OperationClass, OperationBudget>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let budgets = OperationClass::ALL
            .into_iter()
            .map(|operation| (operation, OperationBudget::new(&config)))
            .collect();
        Self { config, budgets }
    }

    fn budget(&self, operation: OperationClass) -> &OperationBudget {
        self.budgets
            .get(&operation)
            .expect("every operation class has a budget")
    }

    /// Waits for a concurrency permit, then for the sustained quota and the
    /// minimum spacing since the previous grant of the same class.
    ///
    /// # Panics
    /// Panics if the internal semaphore was closed, which never happens.
    pub async fn acquire(&self, operation: OperationClass) -> RatePermit {
        let budget = self.budget(operation);
        let permit = Arc::clone(&budget.permits)
            .acquire_owned()
            .await
            .expect("rate limiter semaphore is never closed");

        if let Some(quota) = &budget.quota {
            quota.until_ready().await;
        }

        // Held across the pacing sleep so concurrent grants of this class
        // observe each other's timestamps in order.
        let mut last_granted = budget.last_granted.lock().await;
        if let Some(previous) = *last_granted {
            let elapsed = Instant::now().saturating_duration_since(previous);
            if elapsed < self.config.min_request_interval {
                let wait = self.config.min_request_interval - elapsed;
                trace!(%operation, wait_ms = wait.as_millis() as u64, "pacing request");
                tokio::time::sleep(wait).await;
            }
        }
        let granted_at = Instant::now();
        *last_granted = Some(granted_at);
        drop(last_granted);

        budget.granted_total.fetch_add(1, Ordering::Relaxed);
        RatePermit {
            operation,
            granted_at,
            _permit: permit,
        }
    }

    /// Returns the permit to its class. Pacing state is untouched.
    pub fn release(&self, permit: RatePermit) {
        trace!(operation = %permit.operation, "releasing rate permit");
        drop(permit);
    }

    pub fn stats(&self, operation: OperationClass) -> RateLimitStats {
        let budget = self.budget(operation);
        RateLimitStats {
            operation,
            available_permits: budget.permits.available_permits(),
            max_permits: budget.max_permits,
            granted_total: budget.granted_total.load(Ordering::Relaxed),
        }
    }

    /// Operation classes that currently have calls in flight.
    pub fn active_operations(&self) -> Vec<OperationClass> {
        let mut active: Vec<OperationClass> = self
            .budgets
            .iter()
            .filter(|(_, budget)| budget.permits.available_permits() < budget.max_permits)
            .map(|(operation, _)| *operation)
            .collect();
        active.sort();
        active
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = quota_limit.max(1);
    let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .expect("period is always greater than zero")
        .allow_burst(burst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, interval_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_concurrent_requests: max,
            min_request_interval: Duration::from_millis(interval_ms),
            quota: None,
        })
    }

    #[tokio::test]
    async fn first_grant_is_immediate() {
        let limiter = limiter(1, 5_000);
        let started = Instant::now();
        let permit = limiter.acquire(OperationClass::ClosePrices).await;
        assert!(permit.granted_at().duration_since(started) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stats_track_held_permits() {
        let limiter = limiter(3, 0);
        let first = limiter.acquire(OperationClass::DailyCandles).await;
        let _second = limiter.acquire(OperationClass::DailyCandles).await;

        let stats = limiter.stats(OperationClass::DailyCandles);
        assert_eq!(stats.available_permits, 1);
        assert_eq!(stats.max_permits, 3);
        assert_eq!(stats.granted_total, 2);
        assert_eq!(limiter.active_operations(), vec![OperationClass::DailyCandles]);

        limiter.release(first);
        assert_eq!(limiter.stats(OperationClass::DailyCandles).available_permits, 2);
        assert_eq!(limiter.stats(OperationClass::LastTrades).granted_total, 0);
    }

    #[tokio::test]
    async fn zero_concurrency_is_treated_as_one() {
        let limiter = limiter(0, 0);
        let stats = limiter.stats(OperationClass::LastTrades);
        assert_eq!(stats.max_permits, 1);
    }

    #[test]
    fn quota_period_spreads_window_over_limit() {
        let quota = quota_from_window(Duration::from_secs(60), 120);
        assert_eq!(quota.replenish_interval(), Duration::from_millis(500));
        assert_eq!(quota.burst_size().get(), 120);
    }
}
