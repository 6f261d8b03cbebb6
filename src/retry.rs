//! Bounded retry and fail-loud escalation for non-conflict failures.
//!
//! Attempt counts live in `attempt-N` labels on the item itself, so the
//! bound survives scheduler restarts. A reopened item re-enters the ready
//! pool under normal ranking; there is no priority boost, so a flaky item
//! cannot starve other ready work.

use std::sync::Arc;

use crate::item::{labels, ItemStatus, WorkItem};
use crate::store::{DependencyStore, StoreError};

/// What the policy decided for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32 },
    Exhausted,
}

/// Outcome after the decision was applied to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedRetry {
    Reopened { next_attempt: u32 },
    PermanentlyFailed,
}

/// Bounds repeated failure handling for one run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide from the item's recorded attempt count.
    pub fn decide(&self, item: &WorkItem) -> RetryDecision {
        let attempt = item.attempt();
        if attempt < self.max_attempts {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
            }
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Apply the decision: either reopen with a bumped attempt label or
    /// mark the item permanently failed. `from` is the item's current
    /// status (`Validating` after a gate failure, `Claimed` after a
    /// worker crash).
    pub async fn apply(
        &self,
        store: &Arc<dyn DependencyStore>,
        item: &WorkItem,
        from: ItemStatus,
        reason: &str,
        details: &str,
    ) -> Result<AppliedRetry, StoreError> {
        match self.decide(item) {
            RetryDecision::Retry { next_attempt } => {
                store
                    .add_label(&item.id, &labels::attempt(next_attempt))
                    .await?;
                store
                    .add_comment(
                        &item.id,
                        "retry",
                        &format!(
                            "attempt {} failed ({}): {}",
                            item.attempt(),
                            reason,
                            truncate(details, 400)
                        ),
                    )
                    .await?;
                store.transition(&item.id, from, ItemStatus::Open).await?;
                Ok(AppliedRetry::Reopened { next_attempt })
            }
            RetryDecision::Exhausted => {
                store.add_label(&item.id, labels::FAILED).await?;
                store
                    .add_comment(
                        &item.id,
                        "retry",
                        &format!(
                            "permanently failed after {} attempts ({}): {}. \
                             Downstream items stay blocked until an operator \
                             clears the failure.",
                            item.attempt(),
                            reason,
                            truncate(details, 400)
                        ),
                    )
                    .await?;
                store
                    .transition(&item.id, from, ItemStatus::Failed)
                    .await?;
                Ok(AppliedRetry::PermanentlyFailed)
            }
        }
    }
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut end = max;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
