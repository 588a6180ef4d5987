//! Pipeline configuration with `TICKLOAD_*` environment overrides.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limiter::{QuotaPolicy, RateLimiterConfig};
use crate::retry::RetryPolicy;
use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_requests: usize,
    pub min_request_interval_ms: u64,
    pub max_retry_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub worker_concurrency: usize,
    pub quota_window_ms: Option<u64>,
    pub quota_limit: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            min_request_interval_ms: 100,
            max_retry_attempts: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 10_000,
            batch_size: 100,
            batch_delay_ms: 500,
            worker_concurrency: 10,
            quota_window_ms: None,
            quota_limit: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `TICKLOAD_*` environment variables.
    ///
    /// Values are parsed but not cross-checked, so later overrides can still
    /// correct them; [`IngestionPipeline::new`](crate::IngestionPipeline::new)
    /// validates the final config.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overlaid with values produced by `lookup`, keyed by
    /// environment variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        overlay(&lookup, "TICKLOAD_MAX_CONCURRENT_REQUESTS", &mut config.max_concurrent_requests)?;
        overlay(&lookup, "TICKLOAD_MIN_REQUEST_INTERVAL_MS", &mut config.min_request_interval_ms)?;
        overlay(&lookup, "TICKLOAD_MAX_RETRY_ATTEMPTS", &mut config.max_retry_attempts)?;
        overlay(&lookup, "TICKLOAD_BASE_RETRY_DELAY_MS", &mut config.base_retry_delay_ms)?;
        overlay(&lookup, "TICKLOAD_MAX_RETRY_DELAY_MS", &mut config.max_retry_delay_ms)?;
        overlay(&lookup, "TICKLOAD_BATCH_SIZE", &mut config.batch_size)?;
        overlay(&lookup, "TICKLOAD_BATCH_DELAY_MS", &mut config.batch_delay_ms)?;
        overlay(&lookup, "TICKLOAD_WORKER_CONCURRENCY", &mut config.worker_concurrency)?;
        overlay_optional(&lookup, "TICKLOAD_QUOTA_WINDOW_MS", &mut config.quota_window_ms)?;
        overlay_optional(&lookup, "TICKLOAD_QUOTA_LIMIT", &mut config.quota_limit)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_concurrent_requests", self.max_concurrent_requests as u64),
            ("max_retry_attempts", u64::from(self.max_retry_attempts)),
            ("batch_size", self.batch_size as u64),
            ("worker_concurrency", self.worker_concurrency as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::MustBePositive { field });
            }
        }

        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(ConfigError::RetryDelayOrder {
                base_ms: self.base_retry_delay_ms,
                max_ms: self.max_retry_delay_ms,
            });
        }

        match (self.quota_window_ms, self.quota_limit) {
            (None, None) => {}
            (Some(0), _) => return Err(ConfigError::MustBePositive { field: "quota_window_ms" }),
            (_, Some(0)) => return Err(ConfigError::MustBePositive { field: "quota_limit" }),
            (Some(_), Some(_)) => {}
            _ => return Err(ConfigError::IncompleteQuota),
        }
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            min_request_interval: Duration::from_millis(self.min_request_interval_ms),
            quota: match (self.quota_window_ms, self.quota_limit) {
                (Some(window_ms), Some(limit)) => Some(QuotaPolicy {
                    window: Duration::from_millis(window_ms),
                    limit,
                }),
                _ => None,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retry_attempts,
            Duration::from_millis(self.base_retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnvValue {
        name: name.to_owned(),
        value: raw.to_owned(),
    })
}

fn overlay<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name).filter(|raw| !raw.trim().is_empty()) {
        *target = parse_value(name, &raw)?;
    }
    Ok(())
}

fn overlay_optional<F, T>(lookup: &F, name: &str, target: &mut Option<T>) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name).filter(|raw| !raw.trim().is_empty()) {
        *target = Some(parse_value(name, &raw)?);
    }
    Ok(())
}
