//! Typed client interface to the external dependency store.
//!
//! The real tracker is an external collaborator; this trait is the one
//! adapter boundary through which the core queries and mutates work items.
//! All text-parsing fragility of a concrete tracker CLI belongs in an
//! implementation of this trait, never in the scheduler or the gates.

mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::item::{ItemKind, ItemStatus, WorkItem};

/// Errors surfaced by dependency-store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No item with the given id exists.
    #[error("no such item: {0}")]
    NotFound(String),

    /// A compare-and-swap status transition lost a race.
    ///
    /// The dispatch loop treats this as benign and moves to the next
    /// candidate rather than failing the cycle.
    #[error("status conflict on {id}: expected {expected}, found {actual}")]
    StatusConflict {
        id: String,
        expected: ItemStatus,
        actual: ItemStatus,
    },

    /// An item with the given id already exists.
    #[error("duplicate item id: {0}")]
    DuplicateId(String),

    /// The store itself is unreachable. This is the one fatal case: the
    /// control loop halts, leaving recorded state intact and resumable.
    #[error("dependency store unavailable: {0}")]
    Unavailable(String),
}

/// Filter for `list_items`.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Restrict to items with this status.
    pub status: Option<ItemStatus>,
    /// Restrict to items carrying this label.
    pub label: Option<String>,
}

impl ItemFilter {
    /// Filter matching every item.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter matching items with the given status.
    pub fn with_status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            label: None,
        }
    }

    fn matches(&self, item: &WorkItem) -> bool {
        if let Some(status) = self.status {
            if item.status != status {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !item.labels.contains(label) {
                return false;
            }
        }
        true
    }
}

/// Request to create a new tracked item.
#[derive(Debug, Clone)]
pub struct NewItem {
    /// Explicit id; when `None` the store assigns one.
    pub id: Option<String>,
    pub title: String,
    pub kind: ItemKind,
    pub priority: i64,
    pub labels: BTreeSet<String>,
    /// Ids of items that must close before this one is ready.
    pub blocked_by: Vec<String>,
    /// Back-reference to the item whose implementation spawned this one.
    pub discovered_from: Option<String>,
}

impl NewItem {
    /// New-item request with defaults for everything but title and kind.
    pub fn new(title: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: None,
            title: title.into(),
            kind,
            priority: 0,
            labels: BTreeSet::new(),
            blocked_by: Vec::new(),
            discovered_from: None,
        }
    }
}

/// Query/mutate surface the core requires from the dependency store.
///
/// Implementations must preserve insertion order in `list_items` and
/// `ready_items`; the scheduler's deterministic tie-breaking depends on it.
#[async_trait]
pub trait DependencyStore: Send + Sync {
    /// List items matching the filter, in insertion order.
    async fn list_items(&self, filter: ItemFilter) -> Result<Vec<WorkItem>, StoreError>;

    /// Items in state `open`, not permanently failed, whose blockers are
    /// all `closed` — the dispatch candidates.
    async fn ready_items(&self) -> Result<Vec<WorkItem>, StoreError>;

    /// Fetch a single item's full state.
    async fn get_item(&self, id: &str) -> Result<WorkItem, StoreError>;

    /// Compare-and-swap status transition.
    ///
    /// Fails with `StoreError::StatusConflict` when the current status is
    /// not `from`; the caller decides whether that race is benign.
    async fn transition(
        &self,
        id: &str,
        from: ItemStatus,
        to: ItemStatus,
    ) -> Result<(), StoreError>;

    /// Update an item's priority.
    async fn set_priority(&self, id: &str, priority: i64) -> Result<(), StoreError>;

    /// Add a label; adding an existing label is a no-op.
    async fn add_label(&self, id: &str, label: &str) -> Result<(), StoreError>;

    /// Remove a label; removing an absent label is a no-op.
    async fn remove_label(&self, id: &str, label: &str) -> Result<(), StoreError>;

    /// Append a free-text comment to the item's audit log.
    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<(), StoreError>;

    /// Create a new item, returning its stored form.
    async fn create_item(&self, new: NewItem) -> Result<WorkItem, StoreError>;

    /// Record that `blocked` cannot start until `blocker` closes.
    async fn add_blocks_edge(&self, blocker: &str, blocked: &str) -> Result<(), StoreError>;
}
