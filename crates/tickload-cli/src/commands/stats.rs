use serde_json::json;

use crate::cli::StatsArgs;
use crate::error::CliError;

use super::{open_warehouse, CommandResult};

pub fn run(args: &StatsArgs) -> Result<CommandResult, CliError> {
    let warehouse = open_warehouse(args.db.as_deref())?;
    let datasets = warehouse.dataset_counts()?;

    Ok(CommandResult::ok(json!({
        "db_path": warehouse.db_path().map(|path| path.display().to_string()),
        "datasets": datasets,
    })))
}
