//! Shared harness wiring the scheduler to the in-process fakes.

use std::path::Path;
use std::sync::Arc;

use foreman::testkit::{MemoryWorkspace, ScriptedWorker};
use foreman::{
    DependencyStore, ForemanConfig, GraphAnalyzer, MemoryStore, Scheduler, StoreGraphAnalyzer,
    WorkItem,
};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub workspace: Arc<MemoryWorkspace>,
    pub worker: Arc<ScriptedWorker>,
    pub scheduler: Scheduler,
}

/// Build a scheduler over seeded items with scripted collaborators.
/// The heartbeat is zeroed so tests spin instead of sleeping.
pub async fn harness(items: Vec<WorkItem>, slots: usize, data_dir: &Path) -> Harness {
    let config = ForemanConfig {
        worker_slots: slots,
        heartbeat_secs: 0,
        data_dir: data_dir.to_path_buf(),
        ..ForemanConfig::default()
    };
    harness_with_config(items, config).await
}

pub async fn harness_with_config(items: Vec<WorkItem>, config: ForemanConfig) -> Harness {
    let store = Arc::new(MemoryStore::seeded(items).await.expect("seed store"));
    let store_dyn: Arc<dyn DependencyStore> = store.clone();
    let analyzer: Arc<dyn GraphAnalyzer> = Arc::new(StoreGraphAnalyzer::new(store_dyn.clone()));
    let workspace = Arc::new(MemoryWorkspace::new());
    let worker = Arc::new(ScriptedWorker::new(store_dyn.clone(), workspace.clone()));

    let mut scheduler = Scheduler::new(
        config,
        store_dyn,
        Some(analyzer),
        workspace.clone(),
        worker.clone(),
    )
    .expect("build scheduler");
    scheduler.seed_regression_rng(42);

    Harness {
        store,
        workspace,
        worker,
        scheduler,
    }
}
