//! Work item model shared by the scheduler, validation pipeline, and stores.
//!
//! A `WorkItem` is the unit of dispatch: it carries a status, a priority,
//! blocking edges to other items, and an append-only audit trail of labels
//! and comments. Status transitions are owned by the scheduler; labels and
//! comments are written by validation and policy components.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a work item, forming a strict dependency hierarchy:
/// atoms feed composites, composites feed assemblies, assemblies feed
/// the cross-cutting integration work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Smallest independently implementable unit.
    Atom,
    /// Unit composed from several atoms.
    Composite,
    /// Higher-level assembly of composites.
    Assembly,
    /// Cross-cutting integration work.
    Integration,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::Atom => "atom",
            ItemKind::Composite => "composite",
            ItemKind::Assembly => "assembly",
            ItemKind::Integration => "integration",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle status of a work item.
///
/// `Closed` is reached only after every blocking gate of the validation
/// pipeline has passed. `Failed` marks an item whose retry budget is
/// exhausted; the item is kept, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Open,
    Claimed,
    Validating,
    Closed,
    Blocked,
    Failed,
}

impl ItemStatus {
    /// True for statuses that mean a worker slot owns the item right now.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ItemStatus::Claimed | ItemStatus::Validating)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Open => "open",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Validating => "validating",
            ItemStatus::Closed => "closed",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A single append-only audit comment on a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Component that wrote the comment (e.g. "scheduler", "validation").
    pub author: String,
    /// Timestamp when the comment was appended.
    pub at: DateTime<Utc>,
    /// Free-text body.
    pub body: String,
}

impl Comment {
    /// Create a comment stamped with the current time.
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            at: Utc::now(),
            body: body.into(),
        }
    }
}

/// A work item tracked in the dependency store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque unique identifier.
    pub id: String,
    /// Human-readable title; also drives worker-kind routing.
    pub title: String,
    /// Position in the dependency hierarchy.
    pub kind: ItemKind,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Priority; lower is more urgent. Mutable by rank recommendations.
    pub priority: i64,
    /// Labels used for routing and provenance (`attempt-N`, `failed`, ...).
    pub labels: BTreeSet<String>,
    /// Append-only audit log.
    pub comments: Vec<Comment>,
    /// Items that must close before this one is ready.
    pub blocked_by: Vec<String>,
    /// Item whose implementation spawned this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<String>,
}

impl WorkItem {
    /// Create an open item with no edges, labels, or comments.
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            status: ItemStatus::Open,
            priority: 0,
            labels: BTreeSet::new(),
            comments: Vec::new(),
            blocked_by: Vec::new(),
            discovered_from: None,
        }
    }

    /// Set the priority (builder form, used when seeding plans).
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Add a blocking edge (builder form).
    pub fn blocked_by_item(mut self, blocker: impl Into<String>) -> Self {
        self.blocked_by.push(blocker.into());
        self
    }

    /// True once the item carries the permanent-failure label.
    pub fn is_permanently_failed(&self) -> bool {
        self.labels.contains(labels::FAILED)
    }

    /// Current attempt number, derived from `attempt-N` labels; starts at 1.
    pub fn attempt(&self) -> u32 {
        self.labels
            .iter()
            .filter_map(|l| labels::parse_attempt(l))
            .max()
            .unwrap_or(1)
    }

    /// Id of the item this one was serialized behind, if any.
    pub fn serialized_behind(&self) -> Option<&str> {
        self.labels
            .iter()
            .find_map(|l| l.strip_prefix(labels::SERIALIZED_BEHIND_PREFIX))
    }
}

/// Label vocabulary shared across components.
///
/// Labels are provenance: once written they are only removed when a human
/// or a policy component explicitly supersedes them.
pub mod labels {
    /// Permanent-failure marker; excludes the item from dispatch forever.
    pub const FAILED: &str = "failed";
    /// Advisory marker for items past their wall-clock budget.
    pub const STUCK: &str = "stuck";
    /// Marks that a tier-1 conflict-aware retry has been attempted.
    pub const CONFLICT_RETRIED: &str = "conflict-retried";
    /// Prefix for the tier-2 serialization reference.
    pub const SERIALIZED_BEHIND_PREFIX: &str = "serialized-behind:";
    /// Prefix for the discovery back-reference label.
    pub const DISCOVERED_FROM_PREFIX: &str = "discovered-from:";
    /// Prefix for attempt-counter labels.
    pub const ATTEMPT_PREFIX: &str = "attempt-";

    /// Format an attempt-counter label.
    pub fn attempt(n: u32) -> String {
        format!("{}{}", ATTEMPT_PREFIX, n)
    }

    /// Parse an attempt-counter label back into its number.
    pub fn parse_attempt(label: &str) -> Option<u32> {
        label.strip_prefix(ATTEMPT_PREFIX)?.parse().ok()
    }

    /// Format a serialization reference label.
    pub fn serialized_behind(id: &str) -> String {
        format!("{}{}", SERIALIZED_BEHIND_PREFIX, id)
    }

    /// Format a discovery back-reference label.
    pub fn discovered_from(id: &str) -> String {
        format!("{}{}", DISCOVERED_FROM_PREFIX, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_defaults_to_one() {
        let item = WorkItem::new("a", "A", ItemKind::Atom);
        assert_eq!(item.attempt(), 1);
    }

    #[test]
    fn attempt_uses_highest_label() {
        let mut item = WorkItem::new("a", "A", ItemKind::Atom);
        item.labels.insert(labels::attempt(2));
        item.labels.insert(labels::attempt(3));
        assert_eq!(item.attempt(), 3);
    }

    #[test]
    fn parse_attempt_rejects_other_labels() {
        assert_eq!(labels::parse_attempt("attempt-4"), Some(4));
        assert_eq!(labels::parse_attempt("attempt-x"), None);
        assert_eq!(labels::parse_attempt("failed"), None);
    }

    #[test]
    fn serialized_behind_round_trip() {
        let mut item = WorkItem::new("a", "A", ItemKind::Atom);
        item.labels.insert(labels::serialized_behind("b"));
        assert_eq!(item.serialized_behind(), Some("b"));
    }

    #[test]
    fn in_progress_statuses() {
        assert!(ItemStatus::Claimed.is_in_progress());
        assert!(ItemStatus::Validating.is_in_progress());
        assert!(!ItemStatus::Open.is_in_progress());
        assert!(!ItemStatus::Closed.is_in_progress());
    }
}
