//! Market data provider contract.
//!
//! The pipeline only talks to a broker through [`MarketDataProvider`]. Adapters
//! translate their transport failures into a [`ProviderErrorKind`] so the retry
//! layer can classify them with a plain match instead of inspecting messages.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::retry::Disposition;
use crate::{Item, Record};

/// Category of outbound call sharing one rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    ClosePrices,
    DailyCandles,
    MinuteCandles,
    LastTrades,
}

impl OperationClass {
    pub const ALL: [Self; 4] = [
        Self::ClosePrices,
        Self::DailyCandles,
        Self::MinuteCandles,
        Self::LastTrades,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClosePrices => "close_prices",
            Self::DailyCandles => "daily_candles",
            Self::MinuteCandles => "minute_candles",
            Self::LastTrades => "last_trades",
        }
    }
}

impl Display for OperationClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    RateLimited,
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Network,
    Timeout,
    Internal,
}

/// Structured provider error returned by adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unauthenticated, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidArgument, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Internal, message)
    }

    pub const fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::Unauthenticated => "provider.unauthenticated",
            ProviderErrorKind::PermissionDenied => "provider.permission_denied",
            ProviderErrorKind::InvalidArgument => "provider.invalid_argument",
            ProviderErrorKind::NotFound => "provider.not_found",
            ProviderErrorKind::RateLimited => "provider.rate_limited",
            ProviderErrorKind::Unavailable => "provider.unavailable",
            ProviderErrorKind::DeadlineExceeded => "provider.deadline_exceeded",
            ProviderErrorKind::ResourceExhausted => "provider.resource_exhausted",
            ProviderErrorKind::Network => "provider.network",
            ProviderErrorKind::Timeout => "provider.timeout",
            ProviderErrorKind::Internal => "provider.internal",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for ProviderError {}

/// Decides whether a provider failure is worth another attempt.
///
/// Credential, permission and request-shape problems will fail the same way
/// every time; everything else is treated as transient.
pub fn classify_provider_error(error: &ProviderError) -> Disposition {
    match error.kind() {
        ProviderErrorKind::Unauthenticated
        | ProviderErrorKind::PermissionDenied
        | ProviderErrorKind::InvalidArgument
        | ProviderErrorKind::NotFound => Disposition::Fatal,
        ProviderErrorKind::RateLimited
        | ProviderErrorKind::Unavailable
        | ProviderErrorKind::DeadlineExceeded
        | ProviderErrorKind::ResourceExhausted
        | ProviderErrorKind::Network
        | ProviderErrorKind::Timeout
        | ProviderErrorKind::Internal => Disposition::Retryable,
    }
}

pub type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Record>, ProviderError>> + Send + 'a>>;

/// Source of market records for one item.
///
/// Implementations must be safe to call repeatedly for the same item; the
/// pipeline retries transient failures and re-runs whole ingestions.
pub trait MarketDataProvider: Send + Sync {
    /// Short label stored alongside persisted records.
    fn id(&self) -> &str;

    /// Fetches every record the provider has for `item` under `operation`.
    /// An empty list means the provider has no data for the item.
    fn fetch<'a>(&'a self, operation: OperationClass, item: &'a Item) -> ProviderFuture<'a>;
}
