use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] tickload_core::ValidationError),

    #[error(transparent)]
    Config(#[from] tickload_core::ConfigError),

    #[error("invalid input: {0}")]
    Usage(String),

    #[error("{failed} fetches failed")]
    PartialFailure { failed: usize },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("run cancelled: {0}")]
    Cancelled(String),

    #[error("warehouse error: {0}")]
    Warehouse(#[from] tickload_core::WarehouseError),

    #[error(transparent)]
    BatchAborted(#[from] tickload_core::RunError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tickload_core::CoreError> for CliError {
    fn from(error: tickload_core::CoreError) -> Self {
        match error {
            tickload_core::CoreError::Validation(error) => Self::Validation(error),
            tickload_core::CoreError::Config(error) => Self::Config(error),
            tickload_core::CoreError::Serialization(error) => Self::Serialization(error),
        }
    }
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Usage(_) => 2,
            Self::PartialFailure { .. } => 3,
            Self::Serialization(_) => 4,
            Self::Cancelled(_) => 6,
            Self::Warehouse(_) => 7,
            Self::BatchAborted(_) => 8,
            Self::Io(_) => 10,
        }
    }
}
