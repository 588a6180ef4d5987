//! Retry logic with exponential backoff and jitter.
//!
//! Attempt numbers are 1-based throughout: attempt `k` failing schedules a
//! delay of `min(max, base * factor^(k-1))`, jittered to within 25% either way.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff strategy for retrying failed operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uses a fixed delay between attempts.
    Fixed { delay: Duration },
    /// Uses an exponential delay between attempts.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        /// Spread each delay uniformly over +/- 25%.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(1_000),
            factor: 2.0,
            max: Duration::from_millis(10_000),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay after failed attempt `attempt`, before jitter.
    pub fn base_delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base, factor, max, ..
            } => {
                let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
                let nanos = base.as_nanos() as f64 * factor.powi(exponent);
                let capped = nanos.min(max.as_nanos() as f64).max(0.0);
                Duration::from_nanos(capped.round() as u64)
            }
        }
    }

    /// Delay after failed attempt `attempt`, jittered when enabled.
    pub fn delay(self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        match self {
            Self::Exponential { jitter: true, .. } => jittered(delay),
            _ => delay,
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let nanos = delay.as_nanos();
    if nanos == 0 {
        return delay;
    }
    let low = (nanos * 3).div_ceil(4);
    let high = nanos * 5 / 4;
    let low = u64::try_from(low).unwrap_or(u64::MAX);
    let high = u64::try_from(high).unwrap_or(u64::MAX);
    Duration::from_nanos(fastrand::u64(low..=high))
}

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                factor: 2.0,
                max,
                jitter: true,
            },
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Outcome of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Fatal,
    Retryable,
}

#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("fatal failure on attempt {attempts}: {source}")]
    Fatal {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        attempts: u32,
        last_error: Option<E>,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last error the operation returned, if any.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Fatal { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

struct RetryContext<E> {
    attempt: u32,
    last_error: Option<E>,
    next_delay: Duration,
}

impl<E> RetryContext<E> {
    fn new() -> Self {
        Self {
            attempt: 0,
            last_error: None,
            next_delay: Duration::ZERO,
        }
    }
}

/// Runs an operation until it succeeds, fails fatally or runs out of attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancellation: Option<CancellationToken>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancellation: None,
        }
    }

    /// Backoff sleeps end early once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Invokes `operation` with the 1-based attempt number until it succeeds.
    ///
    /// `classify` is consulted after every failure. A fatal failure is
    /// returned at once; a retryable one sleeps for the backoff delay and
    /// tries again unless the attempt budget is spent.
    pub async fn run<T, E, F, Fut, C>(&self, mut operation: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Disposition,
        E: std::error::Error + 'static,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut context = RetryContext::new();

        loop {
            context.attempt += 1;
            let error = match operation(context.attempt).await {
                Ok(value) => {
                    if context.attempt > 1 {
                        debug!(attempt = context.attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if classify(&error) == Disposition::Fatal {
                warn!(attempt = context.attempt, error = %error, "fatal failure, not retrying");
                return Err(RetryError::Fatal {
                    attempts: context.attempt,
                    source: error,
                });
            }

            if context.attempt >= max_attempts {
                warn!(attempts = context.attempt, error = %error, "retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts: context.attempt,
                    source: error,
                });
            }

            context.next_delay = self.policy.backoff.delay(context.attempt);
            log_retry(context.attempt, context.next_delay, &error);
            context.last_error = Some(error);

            match &self.cancellation {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => {
                            return Err(RetryError::Cancelled {
                                attempts: context.attempt,
                                last_error: context.last_error.take(),
                            });
                        }
                        () = tokio::time::sleep(context.next_delay) => {}
                    }
                }
                None => tokio::time::sleep(context.next_delay).await,
            }
        }
    }
}

fn log_retry(attempt: u32, delay: Duration, error: &impl Display) {
    warn!(
        attempt,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %error,
        "retryable failure, backing off"
    );
}
