//! Deterministic fakes for the external collaborators.
//!
//! Used by the crate's own tests and by embedders exercising dispatch
//! behavior without a git tree or a real agent. Both fakes are scripted:
//! queued outcomes are consumed in order, and unscripted calls take the
//! benign default (tests pass, merges are clean, workers complete).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::store::DependencyStore;
use crate::validate::{
    MergeProbe, QualityFinding, TestReport, TestScope, Workspace, WorkspaceError,
};
use crate::worker::{completion_comment, ChangeSet, WorkOrder, Worker, WorkerError, WorkerReport};

#[derive(Default)]
struct WorkspaceState {
    baseline: BTreeMap<String, String>,
    /// change reference -> pending edits.
    changes: HashMap<String, Vec<(String, String)>>,
    /// scope key -> scripted (passed, output) results.
    test_results: HashMap<String, VecDeque<(bool, String)>>,
    /// change reference -> scripted merge probes.
    merge_probes: HashMap<String, VecDeque<MergeProbe>>,
    integration_results: VecDeque<(bool, String)>,
    quality_results: VecDeque<Vec<QualityFinding>>,
    integrated: Vec<String>,
}

/// In-memory baseline with scripted gate outcomes.
#[derive(Default)]
pub struct MemoryWorkspace {
    state: Mutex<WorkspaceState>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the edits a change reference would apply on integration.
    pub fn register_change(&self, reference: &str, edits: Vec<(String, String)>) {
        let mut state = self.state.lock().expect("workspace state");
        state.changes.insert(reference.to_string(), edits);
    }

    /// Queue a test result for a scope key (`*` is the full suite).
    pub fn script_test(&self, scope_key: &str, passed: bool, output: &str) {
        let mut state = self.state.lock().expect("workspace state");
        state
            .test_results
            .entry(scope_key.to_string())
            .or_default()
            .push_back((passed, output.to_string()));
    }

    /// Queue a merge probe for a change reference.
    pub fn script_merge(&self, reference: &str, probe: MergeProbe) {
        let mut state = self.state.lock().expect("workspace state");
        state
            .merge_probes
            .entry(reference.to_string())
            .or_default()
            .push_back(probe);
    }

    /// Queue an integration-test result.
    pub fn script_integration(&self, passed: bool, output: &str) {
        let mut state = self.state.lock().expect("workspace state");
        state
            .integration_results
            .push_back((passed, output.to_string()));
    }

    /// Queue a quality-check result.
    pub fn script_quality(&self, findings: Vec<QualityFinding>) {
        let mut state = self.state.lock().expect("workspace state");
        state.quality_results.push_back(findings);
    }

    /// Current baseline contents, for no-side-effect assertions.
    pub fn baseline_snapshot(&self) -> BTreeMap<String, String> {
        self.state.lock().expect("workspace state").baseline.clone()
    }

    /// Item ids in integration order.
    pub fn integrated_items(&self) -> Vec<String> {
        self.state.lock().expect("workspace state").integrated.clone()
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn run_tests(&self, scope: &TestScope) -> Result<TestReport, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace state");
        let scripted = state
            .test_results
            .get_mut(scope.key())
            .and_then(|queue| queue.pop_front());
        let (passed, output) = scripted.unwrap_or((true, String::new()));
        Ok(TestReport { passed, output })
    }

    async fn run_integration_tests(&self) -> Result<Option<TestReport>, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace state");
        Ok(state
            .integration_results
            .pop_front()
            .map(|(passed, output)| TestReport { passed, output }))
    }

    async fn trial_merge(&self, change: &ChangeSet) -> Result<MergeProbe, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace state");
        let scripted = state
            .merge_probes
            .get_mut(&change.reference)
            .and_then(|queue| queue.pop_front());
        // The probe never touches the baseline, scripted or not.
        Ok(scripted.unwrap_or(MergeProbe::Clean))
    }

    async fn integrate(&self, change: &ChangeSet) -> Result<(), WorkspaceError> {
        let mut state = self.state.lock().expect("workspace state");
        if let Some(edits) = state.changes.remove(&change.reference) {
            for (path, content) in edits {
                state.baseline.insert(path, content);
            }
        }
        state.integrated.push(change.item_id.clone());
        Ok(())
    }

    async fn quality_checks(&self) -> Result<Vec<QualityFinding>, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace state");
        Ok(state.quality_results.pop_front().unwrap_or_default())
    }
}

/// What a scripted worker does with one attempt of one item.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Register a change, record the completion marker, claim success.
    Complete { edits: Vec<(String, String)> },
    /// Record the marker but claim failure with the given raw output.
    ReportFailure { output: String },
    /// Exit without recording the completion marker (crash mid-task).
    Crash,
}

/// Worker that replays queued outcomes per item; unscripted attempts
/// complete with an empty change.
pub struct ScriptedWorker {
    store: Arc<dyn DependencyStore>,
    workspace: Arc<MemoryWorkspace>,
    script: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    executions: Mutex<Vec<(String, u32)>>,
}

impl ScriptedWorker {
    pub fn new(store: Arc<dyn DependencyStore>, workspace: Arc<MemoryWorkspace>) -> Self {
        Self {
            store,
            workspace,
            script: Mutex::new(HashMap::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next outcome for an item.
    pub fn script(&self, item_id: &str, outcome: ScriptedOutcome) {
        self.script
            .lock()
            .expect("worker script")
            .entry(item_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Change reference a scripted attempt publishes, mirroring the
    /// convention real workers follow.
    pub fn reference(item_id: &str, attempt: u32) -> String {
        format!("{}-attempt-{}", item_id, attempt)
    }

    /// (item, attempt) pairs in execution order.
    pub fn executions(&self) -> Vec<(String, u32)> {
        self.executions.lock().expect("executions").clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(&self, order: WorkOrder) -> Result<WorkerReport, WorkerError> {
        self.executions
            .lock()
            .expect("executions")
            .push((order.item.id.clone(), order.attempt));

        let outcome = self
            .script
            .lock()
            .expect("worker script")
            .get_mut(&order.item.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(ScriptedOutcome::Complete { edits: Vec::new() });

        match outcome {
            ScriptedOutcome::Complete { edits } => {
                let reference = Self::reference(&order.item.id, order.attempt);
                self.workspace.register_change(&reference, edits);
                self.store
                    .add_comment(
                        &order.item.id,
                        "worker",
                        &completion_comment(order.attempt),
                    )
                    .await?;
                Ok(WorkerReport {
                    success: true,
                    raw_output: "done".to_string(),
                    change: Some(ChangeSet::new(&order.item.id, reference)),
                })
            }
            ScriptedOutcome::ReportFailure { output } => {
                self.store
                    .add_comment(
                        &order.item.id,
                        "worker",
                        &completion_comment(order.attempt),
                    )
                    .await?;
                Ok(WorkerReport {
                    success: false,
                    raw_output: output,
                    change: None,
                })
            }
            ScriptedOutcome::Crash => Ok(WorkerReport {
                success: true,
                raw_output: String::new(),
                change: None,
            }),
        }
    }
}
