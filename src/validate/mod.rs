//! Ordered validation gates between a worker's success claim and `closed`.
//!
//! Gate order is deliberate: tests run before the merge probe so no trial
//! merge is spent on internally-broken work, and the merge probe runs
//! before regression sampling so an unrelated regression is never pinned on
//! a change that would be rejected for conflicting anyway. Gate failures
//! are data routed to policy components, never control-loop errors.

pub mod git;
pub mod workspace;

pub use git::GitWorkspace;
pub use workspace::{
    categorize_conflict, scope_for_item, ConflictKind, ConflictRegion, ConflictReport, MergeProbe,
    QualityFinding, TestReport, TestScope, Workspace, WorkspaceError,
};

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::item::{ItemStatus, WorkItem};
use crate::retry::truncate;
use crate::store::{DependencyStore, ItemFilter, StoreError};
use crate::worker::ChangeSet;

/// Why a gate failed. Determines downstream routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    TestsFailed,
    IntegrationSoft,
    Conflict,
    Regression,
    QualitySoft,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::TestsFailed => "tests-failed",
            GateReason::IntegrationSoft => "integration-soft",
            GateReason::Conflict => "conflict",
            GateReason::Regression => "regression",
            GateReason::QualitySoft => "quality-soft",
        }
    }
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A blocking gate's failure, with everything policy components need.
#[derive(Debug, Clone)]
pub struct GateFailure {
    pub reason: GateReason,
    pub details: String,
    /// Present only for conflict-gate failures.
    pub conflict: Option<ConflictReport>,
}

/// Final verdict of the pipeline for one item.
#[derive(Debug, Clone)]
pub enum Verdict {
    Passed {
        /// Soft findings recorded along the way (integration, quality).
        soft_findings: Vec<String>,
    },
    Failed(GateFailure),
}

/// Per-gate record, journaled by the scheduler.
#[derive(Debug, Clone)]
pub struct GateRecord {
    pub gate: &'static str,
    pub passed: bool,
    pub reason: Option<GateReason>,
}

/// Verdict plus the gate-by-gate trail.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub verdict: Verdict,
    pub gates: Vec<GateRecord>,
}

/// Errors from the pipeline's collaborators, distinct from gate verdicts.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// The ordered gate sequence.
pub struct ValidationPipeline {
    store: Arc<dyn DependencyStore>,
    workspace: Arc<dyn Workspace>,
    /// Whether quality findings block acceptance. Default: no.
    quality_blocking: bool,
    rng: StdRng,
}

impl ValidationPipeline {
    pub fn new(
        store: Arc<dyn DependencyStore>,
        workspace: Arc<dyn Workspace>,
        quality_blocking: bool,
    ) -> Self {
        Self {
            store,
            workspace,
            quality_blocking,
            rng: StdRng::from_entropy(),
        }
    }

    /// Make regression sampling deterministic, for tests.
    pub fn seed_regression_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Run every gate in order against a claimed-complete item.
    ///
    /// On a pass the change is integrated into the baseline before the
    /// verdict is returned; the caller only flips the status to `closed`.
    pub async fn validate(
        &mut self,
        item: &WorkItem,
        change: Option<&ChangeSet>,
    ) -> Result<ValidationOutcome, PipelineError> {
        let mut gates = Vec::new();
        let mut soft_findings = Vec::new();

        // Gate 1: functional tests, narrowest scope.
        let scope = scope_for_item(item);
        let report = self.workspace.run_tests(&scope).await?;
        gates.push(GateRecord {
            gate: "functional-tests",
            passed: report.passed,
            reason: (!report.passed).then_some(GateReason::TestsFailed),
        });
        if !report.passed {
            return Ok(ValidationOutcome {
                verdict: Verdict::Failed(GateFailure {
                    reason: GateReason::TestsFailed,
                    details: report.output,
                    conflict: None,
                }),
                gates,
            });
        }

        // Gate 2: integration check. Soft: findings are recorded, never
        // blocking, because they may implicate unrelated items.
        let findings_before = soft_findings.len();
        for blocker in &item.blocked_by {
            let dep = self.store.get_item(blocker).await?;
            if dep.status != ItemStatus::Closed {
                soft_findings.push(format!(
                    "declared dependency {} is {}, not closed",
                    dep.id, dep.status
                ));
            }
        }
        if let Some(report) = self.workspace.run_integration_tests().await? {
            if !report.passed {
                soft_findings.push(format!("integration tests failed: {}", truncate(&report.output, 400)));
            }
        }
        gates.push(GateRecord {
            gate: "integration-check",
            passed: true,
            reason: (soft_findings.len() > findings_before).then_some(GateReason::IntegrationSoft),
        });

        // Gate 3: conflict detection via reversible trial merge.
        if let Some(change) = change {
            let probe = self.workspace.trial_merge(change).await?;
            match probe {
                MergeProbe::Clean => gates.push(GateRecord {
                    gate: "conflict-detection",
                    passed: true,
                    reason: None,
                }),
                MergeProbe::Conflicted(report) => {
                    gates.push(GateRecord {
                        gate: "conflict-detection",
                        passed: false,
                        reason: Some(GateReason::Conflict),
                    });
                    return Ok(ValidationOutcome {
                        verdict: Verdict::Failed(GateFailure {
                            reason: GateReason::Conflict,
                            details: report.summary(),
                            conflict: Some(report),
                        }),
                        gates,
                    });
                }
            }
        } else {
            gates.push(GateRecord {
                gate: "conflict-detection",
                passed: true,
                reason: None,
            });
        }

        // Gate 4: regression sample. One uniformly-random closed item has
        // its narrow scope re-run; a failure reopens the sampled item.
        let closed = self
            .store
            .list_items(ItemFilter::with_status(ItemStatus::Closed))
            .await?;
        if let Some(sampled) = closed.choose(&mut self.rng) {
            let report = self.workspace.run_tests(&scope_for_item(sampled)).await?;
            gates.push(GateRecord {
                gate: "regression-sample",
                passed: report.passed,
                reason: (!report.passed).then_some(GateReason::Regression),
            });
            if !report.passed {
                // The sampled item's prior success is retracted; its own
                // attempt budget is untouched.
                self.store
                    .transition(&sampled.id, ItemStatus::Closed, ItemStatus::Open)
                    .await?;
                self.store
                    .add_comment(
                        &sampled.id,
                        "validation",
                        &format!(
                            "reopened: regression sample failed while validating {}",
                            item.id
                        ),
                    )
                    .await?;
                return Ok(ValidationOutcome {
                    verdict: Verdict::Failed(GateFailure {
                        reason: GateReason::Regression,
                        details: format!(
                            "sampled item {} now fails its tests: {}",
                            sampled.id,
                            truncate(&report.output, 400)
                        ),
                        conflict: None,
                    }),
                    gates,
                });
            }
        } else {
            gates.push(GateRecord {
                gate: "regression-sample",
                passed: true,
                reason: None,
            });
        }

        // Gate 5: quality checks. Recorded, non-blocking unless configured.
        let findings = self.workspace.quality_checks().await?;
        let quality_passed = findings.is_empty() || !self.quality_blocking;
        for finding in &findings {
            soft_findings.push(format!(
                "quality: {}: {}",
                finding.check,
                truncate(&finding.message, 400)
            ));
        }
        gates.push(GateRecord {
            gate: "quality-checks",
            passed: quality_passed,
            reason: (!findings.is_empty()).then_some(GateReason::QualitySoft),
        });
        if !quality_passed {
            let details = findings
                .iter()
                .map(|f| format!("{}: {}", f.check, f.message))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(ValidationOutcome {
                verdict: Verdict::Failed(GateFailure {
                    reason: GateReason::QualitySoft,
                    details,
                    conflict: None,
                }),
                gates,
            });
        }

        // All blocking gates clear: integrate, then the caller closes.
        if let Some(change) = change {
            self.workspace.integrate(change).await?;
        }
        Ok(ValidationOutcome {
            verdict: Verdict::Passed { soft_findings },
            gates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;
    use crate::store::MemoryStore;
    use crate::testkit::MemoryWorkspace;

    async fn pipeline_with(
        items: Vec<WorkItem>,
        quality_blocking: bool,
    ) -> (Arc<MemoryStore>, Arc<MemoryWorkspace>, ValidationPipeline) {
        let store = Arc::new(MemoryStore::seeded(items).await.unwrap());
        let workspace = Arc::new(MemoryWorkspace::new());
        let mut pipeline =
            ValidationPipeline::new(store.clone(), workspace.clone(), quality_blocking);
        pipeline.seed_regression_rng(7);
        (store, workspace, pipeline)
    }

    #[tokio::test]
    async fn failing_tests_short_circuit_before_the_merge_probe() {
        let item = WorkItem::new("a", "Implement alpha", ItemKind::Atom);
        let (_store, workspace, mut pipeline) = pipeline_with(vec![item.clone()], false).await;
        workspace.script_test("implement_alpha", false, "assertion failed: alpha");

        let change = ChangeSet::new("a", "a-attempt-1");
        let outcome = pipeline.validate(&item, Some(&change)).await.unwrap();

        match outcome.verdict {
            Verdict::Failed(failure) => assert_eq!(failure.reason, GateReason::TestsFailed),
            Verdict::Passed { .. } => panic!("expected failure"),
        }
        // A later gate never runs once an earlier one fails.
        assert_eq!(outcome.gates.len(), 1);
        assert_eq!(outcome.gates[0].gate, "functional-tests");
        assert!(workspace.integrated_items().is_empty());
    }

    #[tokio::test]
    async fn integration_findings_are_soft() {
        let blocker = WorkItem::new("dep", "Implement dep", ItemKind::Atom);
        let item = WorkItem::new("a", "Implement alpha", ItemKind::Atom).blocked_by_item("dep");
        let (_store, workspace, mut pipeline) =
            pipeline_with(vec![blocker, item.clone()], false).await;
        workspace.script_integration(false, "integration case broke");

        let outcome = pipeline.validate(&item, None).await.unwrap();

        let soft = match outcome.verdict {
            Verdict::Passed { soft_findings } => soft_findings,
            Verdict::Failed(failure) => panic!("soft findings must not block: {:?}", failure.reason),
        };
        assert!(soft.iter().any(|f| f.contains("dep")));
        assert!(soft.iter().any(|f| f.contains("integration tests failed")));
    }

    #[tokio::test]
    async fn quality_findings_block_only_when_configured() {
        let item = WorkItem::new("a", "Implement alpha", ItemKind::Atom);

        let (_store, workspace, mut pipeline) = pipeline_with(vec![item.clone()], false).await;
        workspace.script_quality(vec![QualityFinding {
            check: "lint".to_string(),
            message: "warning: unused variable".to_string(),
        }]);
        let outcome = pipeline.validate(&item, None).await.unwrap();
        assert!(matches!(outcome.verdict, Verdict::Passed { .. }));

        let (_store, workspace, mut pipeline) = pipeline_with(vec![item.clone()], true).await;
        workspace.script_quality(vec![QualityFinding {
            check: "lint".to_string(),
            message: "warning: unused variable".to_string(),
        }]);
        let outcome = pipeline.validate(&item, None).await.unwrap();
        match outcome.verdict {
            Verdict::Failed(failure) => assert_eq!(failure.reason, GateReason::QualitySoft),
            Verdict::Passed { .. } => panic!("expected blocking quality failure"),
        }
    }

    #[tokio::test]
    async fn passing_validation_integrates_the_change() {
        let item = WorkItem::new("a", "Implement alpha", ItemKind::Atom);
        let (_store, workspace, mut pipeline) = pipeline_with(vec![item.clone()], false).await;
        workspace.register_change(
            "a-attempt-1",
            vec![("src/alpha.rs".to_string(), "pub fn alpha() {}".to_string())],
        );

        let change = ChangeSet::new("a", "a-attempt-1");
        let outcome = pipeline.validate(&item, Some(&change)).await.unwrap();

        assert!(matches!(outcome.verdict, Verdict::Passed { .. }));
        assert_eq!(workspace.integrated_items(), vec!["a"]);
        assert_eq!(outcome.gates.len(), 5);
    }
}

