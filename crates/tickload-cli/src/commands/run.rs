use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tickload_core::{
    EntityId, FixtureProvider, IngestionPipeline, Item, MarketDataProvider, MemoryRecordStore,
    OperationClass,
    PipelineConfig, RecordStore, RunSummary, TradingDate, WarehouseRecordStore,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;

use super::{open_warehouse, CommandResult};

pub async fn run(args: &RunArgs) -> Result<CommandResult, CliError> {
    let fixture = fs::read_to_string(&args.fixture)?;
    let provider = Arc::new(FixtureProvider::from_json(&fixture)?);

    let operation = OperationClass::from(args.operation);
    let scope = match &args.date {
        Some(date) => TradingDate::parse(date)?,
        None => TradingDate::today(),
    };
    let entities = resolve_entities(args, &provider)?;
    let items: Vec<Item> = entities
        .into_iter()
        .map(|entity_id| Item::new(entity_id, scope))
        .collect();

    // validated by IngestionPipeline::new once the flags are applied
    let mut config = PipelineConfig::from_env()?;
    args.overrides.apply(&mut config);

    let dataset = args
        .dataset
        .clone()
        .unwrap_or_else(|| operation.as_str().to_string());
    let store: Arc<dyn RecordStore> = if args.in_memory {
        Arc::new(MemoryRecordStore::new())
    } else {
        let warehouse = open_warehouse(args.db.as_deref())?;
        Arc::new(WarehouseRecordStore::new(warehouse, dataset.clone(), provider.id()))
    };

    let pipeline = IngestionPipeline::new(provider, store, config)?;
    let watchers = spawn_cancel_watchers(&pipeline, args.timeout_ms);

    info!(%operation, %dataset, items = items.len(), %scope, "ingesting fixture");
    let result = pipeline.run(operation, items).await;
    for watcher in watchers {
        watcher.abort();
    }

    match result {
        Ok(summary) => {
            let limits = pipeline.rate_limiter().stats(operation);
            let data = json!({
                "dataset": dataset,
                "success": summary.success(),
                "message": summary.message(),
                "summary": summary,
                "rate_limit": limits,
            });
            Ok(with_exit_status(CommandResult::ok(data), &summary))
        }
        Err(error) => {
            let data = json!({
                "dataset": dataset,
                "success": false,
                "message": error.to_string(),
                "summary": error.partial(),
            });
            Ok(CommandResult::ok(data).with_failure(CliError::BatchAborted(error)))
        }
    }
}

fn with_exit_status(result: CommandResult, summary: &RunSummary) -> CommandResult {
    if summary.cancelled {
        result.with_failure(CliError::Cancelled(summary.message()))
    } else if summary.fetch_failed > 0 {
        result.with_failure(CliError::PartialFailure {
            failed: summary.fetch_failed,
        })
    } else {
        result
    }
}

fn resolve_entities(
    args: &RunArgs,
    provider: &FixtureProvider,
) -> Result<Vec<EntityId>, CliError> {
    let mut entities = args
        .entities
        .iter()
        .map(|raw| EntityId::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(path) = &args.entities_file {
        entities.extend(read_entities_file(path)?);
    }

    if entities.is_empty() {
        entities = provider.entities();
    }
    if entities.is_empty() {
        return Err(CliError::Usage(String::from(
            "no entities to ingest: pass --entity, --entities-file or a fixture with records",
        )));
    }

    let mut seen = std::collections::HashSet::new();
    entities.retain(|entity_id| seen.insert(entity_id.clone()));
    Ok(entities)
}

fn read_entities_file(path: &Path) -> Result<Vec<EntityId>, CliError> {
    let contents = fs::read_to_string(path)?;
    parse_entity_lines(&contents)
}

fn parse_entity_lines(contents: &str) -> Result<Vec<EntityId>, CliError> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| EntityId::parse(line).map_err(CliError::from))
        .collect()
}

fn spawn_cancel_watchers(pipeline: &IngestionPipeline, timeout_ms: Option<u64>) -> Vec<JoinHandle<()>> {
    let mut watchers = Vec::with_capacity(2);

    let token = pipeline.cancellation_token();
    watchers.push(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    }));

    if let Some(timeout_ms) = timeout_ms {
        let token = pipeline.cancellation_token();
        watchers.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            warn!(timeout_ms, "run timed out, cancelling");
            token.cancel();
        }));
    }

    watchers
}
