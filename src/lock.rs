//! Claim bookkeeping for the worker pool.
//!
//! The lock table is the scheduler's exclusively-owned state: claims are
//! created on dispatch and destroyed on release, and a restart discards the
//! whole table (store-side orphans are reset by crash recovery instead).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Exclusive, time-bounded ownership of one work item by one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    /// Worker slot holding the claim.
    pub slot: usize,
    /// When the claim was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Tracks which work item is claimed by which worker slot.
///
/// Claim acquisition has compare-and-swap semantics on the item id: a
/// second claim for the same item fails until the first is released.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<String, Lock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim an item for a slot. Returns `false` if any slot
    /// already holds the item.
    pub fn try_claim(&mut self, item_id: &str, slot: usize) -> bool {
        if self.locks.contains_key(item_id) {
            return false;
        }
        self.locks.insert(
            item_id.to_string(),
            Lock {
                slot,
                acquired_at: Utc::now(),
            },
        );
        true
    }

    /// Release an item's claim, returning the lock if one was held.
    pub fn release(&mut self, item_id: &str) -> Option<Lock> {
        self.locks.remove(item_id)
    }

    /// Whether the item is currently claimed.
    pub fn is_held(&self, item_id: &str) -> bool {
        self.locks.contains_key(item_id)
    }

    /// The lock held on an item, if any.
    pub fn holder(&self, item_id: &str) -> Option<&Lock> {
        self.locks.get(item_id)
    }

    /// Number of live claims.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every claim. Used by crash recovery before resuming dispatch.
    pub fn clear_all(&mut self) {
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let mut locks = LockManager::new();
        assert!(locks.try_claim("a", 0));
        assert!(!locks.try_claim("a", 1));
        assert_eq!(locks.holder("a").map(|l| l.slot), Some(0));
    }

    #[test]
    fn release_allows_reclaim() {
        let mut locks = LockManager::new();
        assert!(locks.try_claim("a", 0));
        assert!(locks.release("a").is_some());
        assert!(!locks.is_held("a"));
        assert!(locks.try_claim("a", 1));
    }

    #[test]
    fn release_without_claim_is_none() {
        let mut locks = LockManager::new();
        assert!(locks.release("missing").is_none());
    }

    #[test]
    fn clear_all_empties_the_table() {
        let mut locks = LockManager::new();
        locks.try_claim("a", 0);
        locks.try_claim("b", 1);
        locks.clear_all();
        assert!(locks.is_empty());
    }
}
