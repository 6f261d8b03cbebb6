//! Worker abstraction and the external agent adapter.
//!
//! Workers are external collaborators (typically an LLM coding agent run as
//! a subprocess). The core only needs a way to hand one a work order and
//! collect a report; everything about how the work gets done is opaque.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::item::WorkItem;
use crate::store::{DependencyStore, StoreError};

/// Closed set of worker kinds a work order can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Builder,
    Integrator,
    Tester,
    Reviewer,
    /// Default when no routing rule matches.
    Generalist,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Builder => "builder",
            WorkerKind::Integrator => "integrator",
            WorkerKind::Tester => "tester",
            WorkerKind::Reviewer => "reviewer",
            WorkerKind::Generalist => "generalist",
        }
    }
}

/// Ordered (pattern, kind) routing rules; first match wins.
const KIND_RULES: &[(&str, WorkerKind)] = &[
    ("test", WorkerKind::Tester),
    ("regression", WorkerKind::Tester),
    ("coverage", WorkerKind::Tester),
    ("integrat", WorkerKind::Integrator),
    ("wire up", WorkerKind::Integrator),
    ("migrat", WorkerKind::Integrator),
    ("review", WorkerKind::Reviewer),
    ("audit", WorkerKind::Reviewer),
    ("analy", WorkerKind::Reviewer),
    ("implement", WorkerKind::Builder),
    ("add ", WorkerKind::Builder),
    ("build", WorkerKind::Builder),
    ("fix", WorkerKind::Builder),
];

/// Pure, total classification of a work-item title into a worker kind.
pub fn classify_worker_kind(title: &str) -> WorkerKind {
    let lowered = title.to_lowercase();
    for (pattern, kind) in KIND_RULES {
        if lowered.contains(pattern) {
            return *kind;
        }
    }
    WorkerKind::Generalist
}

/// The isolated change a worker produced, named by a reference the
/// workspace understands (a branch for git, a key for the test fake).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Item the change implements.
    pub item_id: String,
    /// Workspace-level name of the isolated change.
    pub reference: String,
    /// Paths the change touches, when the worker reports them.
    pub files: Vec<String>,
}

impl ChangeSet {
    pub fn new(item_id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            reference: reference.into(),
            files: Vec::new(),
        }
    }
}

/// Everything a worker gets handed for one attempt.
#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub item: WorkItem,
    pub attempt: u32,
    pub worker_kind: WorkerKind,
    /// Guidance text assembled by the learning store and conflict hints.
    pub guidance: String,
}

/// What a worker reports back when its task ends.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Whether the worker claims the item is done.
    pub success: bool,
    /// Raw output for failure classification.
    pub raw_output: String,
    /// The produced change, when there is one to validate.
    pub change: Option<ChangeSet>,
}

/// Errors from launching or supervising a worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to launch worker: {0}")]
    Launch(#[from] std::io::Error),

    #[error("worker command is empty")]
    EmptyCommand,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One attempt of one work item, run to completion or crash.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, order: WorkOrder) -> Result<WorkerReport, WorkerError>;
}

/// Marker comment a well-behaved worker appends before returning.
///
/// The scheduler requires the marker *and* task exit together before
/// treating an attempt as done; a task that exits without the marker is a
/// crash mid-task, not a completion.
pub fn completion_comment(attempt: u32) -> String {
    format!("work complete: attempt {}", attempt)
}

/// Whether the item carries the completion marker for the given attempt.
pub fn has_completion_marker(item: &WorkItem, attempt: u32) -> bool {
    let marker = completion_comment(attempt);
    item.comments.iter().any(|c| c.body == marker)
}

/// Runs a configured external agent command once per work order.
///
/// The order is serialized to the child's stdin as JSON; the item id,
/// attempt, worker kind, and expected change reference are exported as
/// environment variables. A zero exit status is a success claim.
pub struct CommandWorker {
    command: Vec<String>,
    store: Arc<dyn DependencyStore>,
}

impl CommandWorker {
    pub fn new(command: Vec<String>, store: Arc<dyn DependencyStore>) -> Self {
        Self { command, store }
    }

    /// Branch-style reference the external agent is expected to leave its
    /// work on.
    pub fn change_reference(item_id: &str, attempt: u32) -> String {
        format!("foreman/{}-attempt-{}", item_id, attempt)
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(&self, order: WorkOrder) -> Result<WorkerReport, WorkerError> {
        let program = self.command.first().ok_or(WorkerError::EmptyCommand)?;
        let reference = Self::change_reference(&order.item.id, order.attempt);

        let mut child = Command::new(program)
            .args(&self.command[1..])
            .env("FOREMAN_ITEM_ID", &order.item.id)
            .env("FOREMAN_ITEM_TITLE", &order.item.title)
            .env("FOREMAN_ATTEMPT", order.attempt.to_string())
            .env("FOREMAN_WORKER_KIND", order.worker_kind.as_str())
            .env("FOREMAN_CHANGE_REF", &reference)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::json!({
                "item": order.item,
                "attempt": order.attempt,
                "worker_kind": order.worker_kind,
                "guidance": order.guidance,
            });
            let body = payload.to_string();
            // A worker that closes stdin early is not an error.
            let _ = stdin.write_all(body.as_bytes()).await;
        }

        let output = child.wait_with_output().await?;
        let mut raw = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            raw.push('\n');
            raw.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        let success = output.status.success();
        if success {
            self.store
                .add_comment(
                    &order.item.id,
                    "worker",
                    &completion_comment(order.attempt),
                )
                .await?;
        }

        Ok(WorkerReport {
            success,
            raw_output: raw,
            change: success.then(|| ChangeSet::new(&order.item.id, reference)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Comment, ItemKind};

    #[test]
    fn classification_first_match_wins() {
        assert_eq!(
            classify_worker_kind("Add integration tests for parser"),
            WorkerKind::Tester
        );
        assert_eq!(
            classify_worker_kind("Integrate parser with storage"),
            WorkerKind::Integrator
        );
        assert_eq!(
            classify_worker_kind("Review error handling"),
            WorkerKind::Reviewer
        );
        assert_eq!(
            classify_worker_kind("Implement lexer"),
            WorkerKind::Builder
        );
    }

    #[test]
    fn classification_defaults_to_generalist() {
        assert_eq!(classify_worker_kind("Mysterious chore"), WorkerKind::Generalist);
        assert_eq!(classify_worker_kind(""), WorkerKind::Generalist);
    }

    #[test]
    fn empty_command_is_rejected_before_spawn() {
        let store: Arc<dyn DependencyStore> = Arc::new(crate::store::MemoryStore::new());
        let worker = CommandWorker::new(Vec::new(), store);
        let order = WorkOrder {
            item: WorkItem::new("a", "A", ItemKind::Atom),
            attempt: 1,
            worker_kind: WorkerKind::Generalist,
            guidance: String::new(),
        };
        let err = tokio_test::block_on(worker.execute(order)).unwrap_err();
        assert!(matches!(err, WorkerError::EmptyCommand));
    }

    #[test]
    fn completion_marker_matches_exact_attempt() {
        let mut item = WorkItem::new("a", "A", ItemKind::Atom);
        item.comments
            .push(Comment::new("worker", completion_comment(2)));
        assert!(has_completion_marker(&item, 2));
        assert!(!has_completion_marker(&item, 1));
    }
}
