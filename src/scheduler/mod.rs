//! The dispatch loop.
//!
//! A single-threaded control loop keeps the worker pool saturated with the
//! highest-impact ready work, polls running tasks without blocking, gates
//! every completion through the validation pipeline, and routes failures
//! to the retry policy or the conflict resolver. The loop's only blocking
//! point is the heartbeat sleep; shortening the heartbeat changes latency,
//! never correctness.

mod slots;

pub use slots::{Assignment, SlotPool};

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::config::ForemanConfig;
use crate::graph::GraphAnalyzer;
use crate::item::{labels, ItemStatus, WorkItem};
use crate::journal::{generate_run_id, Journal, JournalEvent};
use crate::learning::{LearningError, LearningStore};
use crate::lock::LockManager;
use crate::resolve::{ConflictResolver, Resolution};
use crate::retry::{AppliedRetry, RetryPolicy};
use crate::store::{DependencyStore, ItemFilter, StoreError};
use crate::validate::{GateReason, PipelineError, ValidationPipeline, Verdict, Workspace};
use crate::worker::{
    classify_worker_kind, has_completion_marker, WorkOrder, Worker, WorkerError, WorkerReport,
};

/// Fatal scheduler errors. Gate failures and worker failures are data and
/// never surface here; only a broken store or learning setup halts the loop.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Learning(#[from] LearningError),
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub closed: u64,
    pub failed: u64,
    pub retries: u64,
    pub serialized: u64,
    pub escalations: u64,
}

/// The dependency-aware work-dispatch scheduler.
pub struct Scheduler {
    config: ForemanConfig,
    store: Arc<dyn DependencyStore>,
    analyzer: Option<Arc<dyn GraphAnalyzer>>,
    worker: Arc<dyn Worker>,
    pipeline: ValidationPipeline,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    learning: LearningStore,
    journal: Option<Journal>,
    locks: LockManager,
    slots: SlotPool,
    stats: DispatchStats,
}

impl Scheduler {
    /// Wire up a scheduler. The journal is best-effort: failing to open it
    /// degrades to an unjournaled run rather than refusing to start.
    pub fn new(
        config: ForemanConfig,
        store: Arc<dyn DependencyStore>,
        analyzer: Option<Arc<dyn GraphAnalyzer>>,
        workspace: Arc<dyn Workspace>,
        worker: Arc<dyn Worker>,
    ) -> Result<Self, SchedulerError> {
        let learning = LearningStore::load(&config.learning_path(), config.learning_top_k)?;
        let journal = match Journal::open(&config.data_dir, generate_run_id()) {
            Ok(journal) => Some(journal),
            Err(err) => {
                warn!(error = %err, "failed to open journal; run will not be journaled");
                None
            }
        };
        let pipeline =
            ValidationPipeline::new(store.clone(), workspace, config.quality_blocking);
        let resolver = ConflictResolver::new(store.clone(), analyzer.clone(), config.max_attempts);
        let retry = RetryPolicy::new(config.max_attempts);
        let slots = SlotPool::new(config.worker_slots);

        Ok(Self {
            config,
            store,
            analyzer,
            worker,
            pipeline,
            resolver,
            retry,
            learning,
            journal,
            locks: LockManager::new(),
            slots,
            stats: DispatchStats::default(),
        })
    }

    /// Make regression sampling deterministic, for tests.
    pub fn seed_regression_rng(&mut self, seed: u64) {
        self.pipeline.seed_regression_rng(seed);
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Run the loop until quiescence: no occupied slots, no ready work,
    /// and no serialized item waiting on an already-closed blocker.
    /// Blocked and permanently-failed leftovers are reported, not hidden.
    pub async fn run(&mut self) -> Result<DispatchStats, SchedulerError> {
        self.recover().await?;
        let slots = self.slots.len();
        self.journal(JournalEvent::RunStarted { slots });

        loop {
            self.reopen_serialized().await?;
            self.dispatch_cycle().await?;
            self.monitor_cycle().await?;
            self.flag_stuck_items().await?;

            if self.quiescent().await? {
                break;
            }
            tokio::time::sleep(self.config.heartbeat()).await;
        }

        if let Err(err) = self.learning.save(&self.config.learning_path()) {
            warn!(error = %err, "failed to persist learning store");
        }
        let stats = self.stats.clone();
        self.journal(JournalEvent::RunCompleted {
            closed: stats.closed,
            failed: stats.failed,
            retries: stats.retries,
            escalations: stats.escalations,
        });
        info!(
            closed = stats.closed,
            failed = stats.failed,
            retries = stats.retries,
            escalations = stats.escalations,
            "dispatch run complete"
        );
        Ok(stats)
    }

    /// Crash recovery: any item observed in-progress with no live lock is
    /// an orphan from a prior interruption and goes back to `open`. Also
    /// reports blocking-graph cycles, which are an anomaly, never silent.
    pub async fn recover(&mut self) -> Result<(), SchedulerError> {
        self.slots.clear_all();
        self.locks.clear_all();

        let items = self.store.list_items(ItemFilter::all()).await?;
        for item in items {
            if item.status.is_in_progress() && !self.locks.is_held(&item.id) {
                self.store
                    .transition(&item.id, item.status, ItemStatus::Open)
                    .await?;
                self.store
                    .add_comment(
                        &item.id,
                        "scheduler",
                        "reset orphaned item after interruption",
                    )
                    .await?;
                self.journal(JournalEvent::OrphanReset {
                    item: item.id.clone(),
                });
                debug!(item = %item.id, "reset orphaned item");
            }
        }

        if let Some(analyzer) = &self.analyzer {
            match analyzer.detect_cycles().await {
                Ok(cycles) if !cycles.is_empty() => {
                    warn!(count = cycles.len(), "blocking graph contains cycles");
                    self.journal(JournalEvent::CycleAnomaly { cycles });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "graph analyzer unavailable; skipping cycle check");
                }
            }
        }
        Ok(())
    }

    /// Fill every empty slot with the best ready, unlocked candidate.
    pub async fn dispatch_cycle(&mut self) -> Result<(), SchedulerError> {
        let empty = self.slots.empty_indices();
        if empty.is_empty() {
            return Ok(());
        }

        let mut candidates = self.ranked_candidates().await?.into_iter();
        for slot_index in empty {
            loop {
                let Some(item) = candidates.next() else {
                    return Ok(());
                };
                if self.locks.is_held(&item.id) {
                    continue;
                }
                // Compare-and-swap claim; losing the race to another owner
                // is benign and just moves on to the next candidate.
                match self
                    .store
                    .transition(&item.id, ItemStatus::Open, ItemStatus::Claimed)
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::StatusConflict { .. }) => continue,
                    Err(err) => return Err(err.into()),
                }
                if !self.locks.try_claim(&item.id, slot_index) {
                    // Lock table and store disagree; put the item back.
                    self.store
                        .transition(&item.id, ItemStatus::Claimed, ItemStatus::Open)
                        .await?;
                    continue;
                }

                self.start_worker(slot_index, item).await?;
                break;
            }
        }
        Ok(())
    }

    async fn start_worker(
        &mut self,
        slot_index: usize,
        item: WorkItem,
    ) -> Result<(), SchedulerError> {
        let attempt = item.attempt();
        let worker_kind = classify_worker_kind(&item.title);
        let mut guidance = self.learning.build_context(item.kind, attempt);
        if let Some(hint) = latest_conflict_hint(&item) {
            guidance.push('\n');
            guidance.push_str(&hint);
        }

        self.store
            .add_comment(
                &item.id,
                "scheduler",
                &format!("claimed by slot {} (attempt {})", slot_index, attempt),
            )
            .await?;
        self.journal(JournalEvent::ItemClaimed {
            item: item.id.clone(),
            slot: slot_index,
            attempt,
        });
        debug!(item = %item.id, slot = slot_index, attempt, kind = %worker_kind.as_str(), "dispatching");

        let order = WorkOrder {
            item: item.clone(),
            attempt,
            worker_kind,
            guidance,
        };
        let worker = self.worker.clone();
        let handle = tokio::spawn(async move { worker.execute(order).await });
        if let Some(previous) = self
            .slots
            .assign(slot_index, Assignment::new(item.id, attempt, handle))
        {
            warn!(item = %previous.item_id, slot = slot_index, "slot was unexpectedly occupied");
            previous.handle.abort();
        }
        self.stats.dispatched += 1;
        Ok(())
    }

    /// Ready candidates, impact-ranked, degrading to FIFO-by-priority when
    /// the analyzer is down.
    async fn ranked_candidates(&self) -> Result<Vec<WorkItem>, StoreError> {
        let ready = self.store.ready_items().await?;
        if let Some(analyzer) = &self.analyzer {
            match analyzer.rank_by_impact(&ready).await {
                Ok(ranked) => return Ok(ranked.into_iter().map(|r| r.item).collect()),
                Err(err) => {
                    warn!(error = %err, "graph analyzer unavailable; falling back to FIFO-by-priority");
                }
            }
        }
        let mut fifo = ready;
        fifo.sort_by_key(|item| item.priority);
        Ok(fifo)
    }

    /// Poll every occupied slot non-blockingly and process finished tasks.
    pub async fn monitor_cycle(&mut self) -> Result<(), SchedulerError> {
        for index in self.slots.occupied_indices() {
            let finished = self
                .slots
                .get(index)
                .map(|a| a.handle.is_finished())
                .unwrap_or(false);
            if !finished {
                continue;
            }
            let Some(assignment) = self.slots.take(index) else {
                continue;
            };
            let Assignment {
                item_id,
                attempt,
                handle,
                ..
            } = assignment;
            let result = handle.await;
            self.handle_completion(&item_id, attempt, result).await?;
            self.locks.release(&item_id);
        }
        Ok(())
    }

    async fn handle_completion(
        &mut self,
        item_id: &str,
        attempt: u32,
        result: Result<Result<WorkerReport, WorkerError>, JoinError>,
    ) -> Result<(), SchedulerError> {
        let item = self.store.get_item(item_id).await?;
        match result {
            Err(join_err) => {
                self.worker_crashed(&item, &format!("worker task crashed: {}", join_err))
                    .await
            }
            Ok(Err(worker_err)) => {
                self.worker_crashed(&item, &format!("worker could not run: {}", worker_err))
                    .await
            }
            Ok(Ok(report)) => {
                // The worker's own exit is not enough: the tracked state
                // must also show the completion marker, or the task died
                // mid-work and the item is re-dispatched like a crash.
                if !has_completion_marker(&item, attempt) {
                    self.worker_crashed(&item, "worker exited without recording completion")
                        .await
                } else if report.success {
                    self.validate_item(item, report).await
                } else {
                    self.learning
                        .record_failure(&item, "worker-failed", &report.raw_output);
                    self.apply_retry(
                        &item,
                        ItemStatus::Claimed,
                        "worker-failed",
                        &report.raw_output,
                    )
                    .await
                }
            }
        }
    }

    async fn worker_crashed(
        &mut self,
        item: &WorkItem,
        details: &str,
    ) -> Result<(), SchedulerError> {
        warn!(item = %item.id, details, "worker crash");
        self.apply_retry(item, ItemStatus::Claimed, "worker-crash", details)
            .await
    }

    /// Gate a worker-claimed success through the validation pipeline and
    /// route the verdict.
    async fn validate_item(
        &mut self,
        item: WorkItem,
        report: WorkerReport,
    ) -> Result<(), SchedulerError> {
        self.store
            .transition(&item.id, ItemStatus::Claimed, ItemStatus::Validating)
            .await?;
        let item = self.store.get_item(&item.id).await?;

        let outcome = match self.pipeline.validate(&item, report.change.as_ref()).await {
            Ok(outcome) => outcome,
            Err(PipelineError::Store(err)) => return Err(err.into()),
            Err(PipelineError::Workspace(err)) => {
                // The tooling broke, not the work; retry like a gate failure.
                warn!(item = %item.id, error = %err, "validation tooling failed");
                return self
                    .apply_retry(
                        &item,
                        ItemStatus::Validating,
                        "validation-tooling",
                        &err.to_string(),
                    )
                    .await;
            }
        };

        for gate in &outcome.gates {
            self.journal(JournalEvent::GateResult {
                item: item.id.clone(),
                gate: gate.gate.to_string(),
                passed: gate.passed,
                reason: gate.reason.map(|r| r.as_str().to_string()),
            });
        }

        match outcome.verdict {
            Verdict::Passed { soft_findings } => {
                for finding in &soft_findings {
                    self.store
                        .add_comment(&item.id, "validation", finding)
                        .await?;
                }
                self.store
                    .transition(&item.id, ItemStatus::Validating, ItemStatus::Closed)
                    .await?;
                self.store
                    .add_comment(&item.id, "validation", "all gates passed; item closed")
                    .await?;
                self.journal(JournalEvent::ItemClosed {
                    item: item.id.clone(),
                });
                self.stats.closed += 1;
                info!(item = %item.id, "item closed");
                Ok(())
            }
            Verdict::Failed(failure) => {
                self.learning
                    .record_failure(&item, failure.reason.as_str(), &failure.details);
                match (failure.reason, failure.conflict) {
                    (GateReason::Conflict, Some(conflict)) => {
                        let resolution = self.resolver.resolve(&item, &conflict).await?;
                        match resolution {
                            Resolution::RetriedWithContext { next_attempt } => {
                                self.stats.retries += 1;
                                self.journal(JournalEvent::RetryScheduled {
                                    item: item.id.clone(),
                                    next_attempt,
                                    reason: "conflict".to_string(),
                                });
                            }
                            Resolution::Serialized { behind } => {
                                self.stats.serialized += 1;
                                self.journal(JournalEvent::ItemSerialized {
                                    item: item.id.clone(),
                                    behind,
                                });
                            }
                            Resolution::Escalated { analysis_item } => {
                                self.stats.escalations += 1;
                                self.journal(JournalEvent::EscalationCreated {
                                    item: item.id.clone(),
                                    analysis: analysis_item,
                                });
                            }
                        }
                        Ok(())
                    }
                    (reason, _) => {
                        self.apply_retry(
                            &item,
                            ItemStatus::Validating,
                            reason.as_str(),
                            &failure.details,
                        )
                        .await
                    }
                }
            }
        }
    }

    async fn apply_retry(
        &mut self,
        item: &WorkItem,
        from: ItemStatus,
        reason: &str,
        details: &str,
    ) -> Result<(), SchedulerError> {
        let applied = self
            .retry
            .apply(&self.store, item, from, reason, details)
            .await?;
        match applied {
            AppliedRetry::Reopened { next_attempt } => {
                self.stats.retries += 1;
                self.journal(JournalEvent::RetryScheduled {
                    item: item.id.clone(),
                    next_attempt,
                    reason: reason.to_string(),
                });
            }
            AppliedRetry::PermanentlyFailed => {
                self.stats.failed += 1;
                self.journal(JournalEvent::ItemFailed {
                    item: item.id.clone(),
                    reason: reason.to_string(),
                });
                warn!(item = %item.id, reason, "item permanently failed");
            }
        }
        Ok(())
    }

    /// Return serialized items to `open` once their blocker closed. The
    /// retried merge then runs against a quiesced baseline.
    async fn reopen_serialized(&mut self) -> Result<(), SchedulerError> {
        let blocked = self
            .store
            .list_items(ItemFilter::with_status(ItemStatus::Blocked))
            .await?;
        for item in blocked {
            let Some(behind) = item.serialized_behind() else {
                // Tier-3 blocked items wait for an operator, not for us.
                continue;
            };
            let blocker = match self.store.get_item(behind).await {
                Ok(blocker) => blocker,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if blocker.status == ItemStatus::Closed {
                self.store
                    .transition(&item.id, ItemStatus::Blocked, ItemStatus::Open)
                    .await?;
                self.store
                    .add_comment(
                        &item.id,
                        "scheduler",
                        &format!("unblocked: {} closed; rejoining ready pool", behind),
                    )
                    .await?;
                debug!(item = %item.id, behind, "serialized item reopened");
            }
        }
        Ok(())
    }

    /// Flag items past their advisory wall-clock budget, once. Advisory
    /// only: nothing is killed.
    async fn flag_stuck_items(&mut self) -> Result<(), SchedulerError> {
        let timeout_secs = self.config.item_timeout().as_secs();
        if timeout_secs == 0 {
            return Ok(());
        }

        let mut to_flag = Vec::new();
        for index in self.slots.occupied_indices() {
            if let Some(assignment) = self.slots.get(index) {
                if assignment.stuck_flagged {
                    continue;
                }
                let elapsed = (Utc::now() - assignment.started_at).num_seconds().max(0) as u64;
                if elapsed >= timeout_secs {
                    to_flag.push((index, assignment.item_id.clone(), elapsed));
                }
            }
        }

        for (index, item_id, elapsed) in to_flag {
            if let Some(assignment) = self.slots.get_mut(index) {
                assignment.stuck_flagged = true;
            }
            self.store.add_label(&item_id, labels::STUCK).await?;
            self.store
                .add_comment(
                    &item_id,
                    "scheduler",
                    &format!(
                        "running for {}s, past the {}s budget; flagged for operator attention",
                        elapsed, timeout_secs
                    ),
                )
                .await?;
            self.journal(JournalEvent::ItemStuck {
                item: item_id.clone(),
                elapsed_secs: elapsed,
            });
            warn!(item = %item_id, elapsed, "item flagged as stuck");
        }
        Ok(())
    }

    async fn quiescent(&self) -> Result<bool, SchedulerError> {
        if !self.slots.all_empty() {
            return Ok(false);
        }
        if !self.store.ready_items().await?.is_empty() {
            return Ok(false);
        }
        // A serialized item whose blocker already closed will reopen on
        // the next cycle; that is still progress.
        let blocked = self
            .store
            .list_items(ItemFilter::with_status(ItemStatus::Blocked))
            .await?;
        for item in blocked {
            if let Some(behind) = item.serialized_behind() {
                if let Ok(blocker) = self.store.get_item(behind).await {
                    if blocker.status == ItemStatus::Closed {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn journal(&mut self, event: JournalEvent) {
        if let Some(journal) = &mut self.journal {
            if let Err(err) = journal.record(event) {
                warn!(error = %err, "failed to write journal event");
            }
        }
    }
}

/// The most recent tier-1 reconciliation hint on the item, if any.
fn latest_conflict_hint(item: &WorkItem) -> Option<String> {
    item.comments
        .iter()
        .rev()
        .find(|c| c.body.starts_with("conflict hint:"))
        .map(|c| c.body.clone())
}
