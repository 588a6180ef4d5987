//! CLI argument definitions for tickload.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Ingest a provider fixture through the pipeline |
//! | `stats` | Per-dataset record counts in the warehouse |
//!
//! # Examples
//!
//! ```bash
//! # Load close prices for two instruments into the default warehouse
//! tickload run --fixture prices.json --entity AAPL --entity MSFT --date 2024-03-01
//!
//! # Dry run against an in-memory store, one call per 250ms
//! tickload run --fixture prices.json --in-memory --min-request-interval-ms 250 --pretty
//!
//! # Inspect what has been loaded
//! tickload stats --pretty
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tickload_core::{OperationClass, PipelineConfig};

#[derive(Debug, Parser)]
#[command(
    name = "tickload",
    author,
    version,
    about = "Rate-limited market data ingestion into DuckDB"
)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log filter (e.g. `debug`, `tickload_core=trace`). Defaults to `RUST_LOG`, then `info`.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest records from a fixture provider.
    Run(RunArgs),
    /// Show record counts per dataset.
    Stats(StatsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationArg {
    ClosePrices,
    DailyCandles,
    MinuteCandles,
    LastTrades,
}

impl From<OperationArg> for OperationClass {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::ClosePrices => Self::ClosePrices,
            OperationArg::DailyCandles => Self::DailyCandles,
            OperationArg::MinuteCandles => Self::MinuteCandles,
            OperationArg::LastTrades => Self::LastTrades,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON fixture with provider records and scripted failures.
    #[arg(long)]
    pub fixture: PathBuf,

    /// Entity to ingest. Repeatable. Defaults to every entity in the fixture.
    #[arg(long = "entity")]
    pub entities: Vec<String>,

    /// File with one entity per line; blank lines and `#` comments are skipped.
    #[arg(long)]
    pub entities_file: Option<PathBuf>,

    /// Scope day (YYYY-MM-DD). Defaults to today (UTC).
    #[arg(long)]
    pub date: Option<String>,

    #[arg(long, value_enum, default_value_t = OperationArg::ClosePrices)]
    pub operation: OperationArg,

    /// Dataset name in the warehouse. Defaults to the operation name.
    #[arg(long)]
    pub dataset: Option<String>,

    /// Warehouse file. Defaults to `$TICKLOAD_HOME/warehouse.duckdb`.
    #[arg(long, conflicts_with = "in_memory")]
    pub db: Option<PathBuf>,

    /// Keep records in memory instead of the warehouse.
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,

    /// Cancel the run after this many milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Per-run overrides of `TICKLOAD_*` settings.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    #[arg(long)]
    pub max_concurrent_requests: Option<usize>,
    #[arg(long)]
    pub min_request_interval_ms: Option<u64>,
    #[arg(long)]
    pub max_retry_attempts: Option<u32>,
    #[arg(long)]
    pub base_retry_delay_ms: Option<u64>,
    #[arg(long)]
    pub max_retry_delay_ms: Option<u64>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub batch_delay_ms: Option<u64>,
    #[arg(long)]
    pub worker_concurrency: Option<usize>,
    #[arg(long)]
    pub quota_window_ms: Option<u64>,
    #[arg(long)]
    pub quota_limit: Option<u32>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut PipelineConfig) {
        fn set<T: Copy>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }

        set(&mut config.max_concurrent_requests, self.max_concurrent_requests);
        set(&mut config.min_request_interval_ms, self.min_request_interval_ms);
        set(&mut config.max_retry_attempts, self.max_retry_attempts);
        set(&mut config.base_retry_delay_ms, self.base_retry_delay_ms);
        set(&mut config.max_retry_delay_ms, self.max_retry_delay_ms);
        set(&mut config.batch_size, self.batch_size);
        set(&mut config.batch_delay_ms, self.batch_delay_ms);
        set(&mut config.worker_concurrency, self.worker_concurrency);
        if self.quota_window_ms.is_some() {
            config.quota_window_ms = self.quota_window_ms;
        }
        if self.quota_limit.is_some() {
            config.quota_limit = self.quota_limit;
        }
    }
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    /// Warehouse file. Defaults to `$TICKLOAD_HOME/warehouse.duckdb`.
    #[arg(long)]
    pub db: Option<PathBuf>,
}
