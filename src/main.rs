use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use foreman::scheduler::DispatchStats;
use foreman::{
    CommandWorker, ForemanConfig, GitWorkspace, ItemKind, ItemStatus, MemoryStore, Scheduler,
    StoreGraphAnalyzer, WorkItem,
};

/// Dependency-aware autonomous work dispatch.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
struct Cli {
    /// Plan file listing the work items to drive.
    #[arg(long, default_value = "plan.json")]
    plan: PathBuf,

    /// TOML configuration file (defaults to ./foreman.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Git working tree the validation gates run in.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Override the worker pool size.
    #[arg(long)]
    slots: Option<usize>,

    /// Override the per-item retry budget.
    #[arg(long)]
    max_attempts: Option<u32>,
}

/// One work item as written in the plan file.
#[derive(Debug, Deserialize)]
struct PlanItem {
    id: String,
    title: String,
    kind: ItemKind,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    blocked_by: Vec<String>,
    #[serde(default)]
    labels: BTreeSet<String>,
    /// Seed the item as already closed (e.g. previously completed work).
    #[serde(default)]
    closed: bool,
}

impl From<PlanItem> for WorkItem {
    fn from(plan: PlanItem) -> Self {
        let mut item = WorkItem::new(plan.id, plan.title, plan.kind);
        item.priority = plan.priority;
        item.blocked_by = plan.blocked_by;
        item.labels = plan.labels;
        if plan.closed {
            item.status = ItemStatus::Closed;
        }
        item
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(stats) if stats.failed == 0 => ExitCode::SUCCESS,
        Ok(stats) => {
            error!(failed = stats.failed, "run finished with permanent failures");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "dispatch run aborted");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<DispatchStats, Box<dyn std::error::Error>> {
    let mut config = ForemanConfig::load(cli.config.as_deref())?;
    if let Some(slots) = cli.slots {
        config.worker_slots = slots;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    if config.worker_command.is_empty() {
        return Err("worker_command must be configured (foreman.toml or FOREMAN_WORKER_COMMAND)"
            .into());
    }

    let plan_raw = tokio::fs::read_to_string(&cli.plan).await?;
    let plan: Vec<PlanItem> = serde_json::from_str(&plan_raw)?;
    let items: Vec<WorkItem> = plan.into_iter().map(WorkItem::from).collect();
    info!(items = items.len(), plan = %cli.plan.display(), "plan loaded");

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::seeded(items).await?);
    let store_dyn: Arc<dyn foreman::DependencyStore> = store;
    let analyzer: Arc<dyn foreman::GraphAnalyzer> =
        Arc::new(StoreGraphAnalyzer::new(store_dyn.clone()));
    let workspace = Arc::new(GitWorkspace::new(
        cli.workspace,
        config.test_command.clone(),
        config.integration_filter.clone(),
        config.quality_commands.clone(),
    ));
    let worker = Arc::new(CommandWorker::new(
        config.worker_command.clone(),
        store_dyn.clone(),
    ));

    let mut scheduler = Scheduler::new(config, store_dyn, Some(analyzer), workspace, worker)?;
    let stats = scheduler.run().await?;
    info!(
        dispatched = stats.dispatched,
        closed = stats.closed,
        failed = stats.failed,
        retries = stats.retries,
        serialized = stats.serialized,
        escalations = stats.escalations,
        "dispatch summary"
    );
    Ok(stats)
}
