mod run;
mod stats;

use std::path::Path;

use serde_json::Value;
use tickload_core::{Warehouse, WarehouseConfig};

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    /// Failures to report through the exit code once `data` is printed.
    pub failure: Option<CliError>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: CliError) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Opens `--db` when given, else the warehouse under `$TICKLOAD_HOME`.
fn open_warehouse(db: Option<&Path>) -> Result<Warehouse, CliError> {
    let warehouse = match db {
        Some(path) => Warehouse::open(WarehouseConfig::with_db_path(path))?,
        None => Warehouse::open_default()?,
    };
    Ok(warehouse)
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    match &cli.command {
        Command::Run(args) => run::run(args).await,
        Command::Stats(args) => stats::run(args),
    }
}
