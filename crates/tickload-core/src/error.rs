use thiserror::Error;

/// Validation and contract errors exposed by `tickload-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entity id cannot be empty")]
    EmptyEntityId,
    #[error("entity id length {len} exceeds max {max}")]
    EntityIdTooLong { len: usize, max: usize },
    #[error("entity id contains invalid character '{ch}' at index {index}")]
    EntityIdInvalidChar { ch: char, index: usize },

    #[error("trading date must be YYYY-MM-DD: '{value}'")]
    InvalidTradingDate { value: String },

    #[error("currency must be a 3-letter uppercase ISO code: '{value}'")]
    InvalidCurrency { value: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },

    #[error("candle high must be >= low")]
    InvalidCandleRange,
    #[error("candle open/close must be within high/low range")]
    InvalidCandleBounds,
}

/// Rejected pipeline configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{field}' must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("base retry delay {base_ms}ms exceeds max retry delay {max_ms}ms")]
    RetryDelayOrder { base_ms: u64, max_ms: u64 },

    #[error("quota_window_ms and quota_limit must be set together")]
    IncompleteQuota,

    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnvValue { name: String, value: String },
}

/// Top-level error type for core operations outside the pipeline itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
