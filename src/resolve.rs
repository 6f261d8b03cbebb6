//! Three-tier escalation for resource conflicts.
//!
//! Tier 1 re-dispatches the same item with the overlapping regions as a
//! content-merge request. Tier 2 serializes the item behind the item that
//! owns the other side of the overlap, after proving the new blocking edge
//! cannot create a cycle. Tier 3 creates a linked analysis item for an
//! operator and leaves the original blocked; dispatch of other ready work
//! continues regardless.

use std::sync::Arc;

use crate::graph::GraphAnalyzer;
use crate::item::{labels, ItemKind, ItemStatus, WorkItem};
use crate::retry::truncate;
use crate::store::{DependencyStore, NewItem, StoreError};
use crate::validate::ConflictReport;

/// Which tier handled the conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Tier 1: reopened with reconciliation hints; consumed a retry attempt.
    RetriedWithContext { next_attempt: u32 },
    /// Tier 2: blocked behind the item owning the other side.
    Serialized { behind: String },
    /// Tier 3: analysis item created, original left blocked.
    Escalated { analysis_item: String },
}

/// Escalating conflict-resolution strategy.
pub struct ConflictResolver {
    store: Arc<dyn DependencyStore>,
    analyzer: Option<Arc<dyn GraphAnalyzer>>,
    max_attempts: u32,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<dyn DependencyStore>,
        analyzer: Option<Arc<dyn GraphAnalyzer>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            analyzer,
            max_attempts,
        }
    }

    /// Resolve a conflict-gate failure for an item in `validating`.
    ///
    /// Each tier is attempted only when the previous one has already been
    /// spent, which the item's own labels record durably.
    pub async fn resolve(
        &self,
        item: &WorkItem,
        report: &ConflictReport,
    ) -> Result<Resolution, StoreError> {
        let tier1_spent = item.labels.contains(labels::CONFLICT_RETRIED);
        let tier2_spent = item.serialized_behind().is_some();

        if !tier1_spent && item.attempt() < self.max_attempts {
            return self.retry_with_context(item, report).await;
        }

        if !tier2_spent {
            if let Some(behind) = report.other_item() {
                // A cycle-creating edge (or an analyzer we cannot ask)
                // skips straight to escalation.
                if self.edge_is_safe(&item.id, behind).await {
                    return self.serialize(item, behind).await;
                }
                return self.escalate(item, report).await;
            }
            // No attributable other side; serialization has no target.
            return self.escalate(item, report).await;
        }

        self.escalate(item, report).await
    }

    /// Whether the proposed `behind -> item` blocking edge is provably
    /// acyclic. Refuses when the analyzer is unavailable: the cycle
    /// invariant is absolute, so an unverifiable edge is never added.
    async fn edge_is_safe(&self, item_id: &str, behind: &str) -> bool {
        match &self.analyzer {
            Some(analyzer) => matches!(
                analyzer.would_create_cycle(item_id, behind).await,
                Ok(false)
            ),
            None => false,
        }
    }

    async fn retry_with_context(
        &self,
        item: &WorkItem,
        report: &ConflictReport,
    ) -> Result<Resolution, StoreError> {
        let next_attempt = item.attempt() + 1;
        self.store
            .add_label(&item.id, labels::CONFLICT_RETRIED)
            .await?;
        self.store
            .add_label(&item.id, &labels::attempt(next_attempt))
            .await?;
        self.store
            .add_comment(&item.id, "conflict", &report.hint_text())
            .await?;
        self.store
            .transition(&item.id, ItemStatus::Validating, ItemStatus::Open)
            .await?;
        Ok(Resolution::RetriedWithContext { next_attempt })
    }

    async fn serialize(&self, item: &WorkItem, behind: &str) -> Result<Resolution, StoreError> {
        self.store.add_blocks_edge(behind, &item.id).await?;
        self.store
            .add_label(&item.id, &labels::serialized_behind(behind))
            .await?;
        self.store
            .add_comment(
                &item.id,
                "conflict",
                &format!(
                    "serialized behind {}: its integrated change owns the \
                     other side of the overlap; this item re-enters the \
                     ready pool once {} is closed",
                    behind, behind
                ),
            )
            .await?;
        self.store
            .transition(&item.id, ItemStatus::Validating, ItemStatus::Blocked)
            .await?;
        Ok(Resolution::Serialized {
            behind: behind.to_string(),
        })
    }

    async fn escalate(
        &self,
        item: &WorkItem,
        report: &ConflictReport,
    ) -> Result<Resolution, StoreError> {
        let mut new = NewItem::new(
            format!("Analyze conflict on {}: {}", item.id, report.summary()),
            ItemKind::Integration,
        );
        new.priority = item.priority;
        new.labels.insert(labels::discovered_from(&item.id));
        new.discovered_from = Some(item.id.clone());
        let analysis = self.store.create_item(new).await?;

        self.store
            .add_comment(
                &analysis.id,
                "conflict",
                &format!(
                    "both versions and resolution options for {}:\n{}\n\
                     options: merge the content manually, rebase one side, \
                     or split the shared file.",
                    item.id,
                    truncate(&report.hint_text(), 2000)
                ),
            )
            .await?;
        self.store
            .add_comment(
                &item.id,
                "conflict",
                &format!(
                    "escalated: conflict persists after automatic handling; \
                     see analysis item {}",
                    analysis.id
                ),
            )
            .await?;
        self.store
            .transition(&item.id, ItemStatus::Validating, ItemStatus::Blocked)
            .await?;
        Ok(Resolution::Escalated {
            analysis_item: analysis.id,
        })
    }
}
