//! Fixed-size worker slot pool.
//!
//! Each slot holds at most one running assignment: a work item id, the
//! attempt number it was dispatched with, and the task handle polled
//! non-blockingly by the control loop. The pool never blocks on a task.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::worker::{WorkerError, WorkerReport};

/// One occupied slot's state.
#[derive(Debug)]
pub struct Assignment {
    pub item_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub handle: JoinHandle<Result<WorkerReport, WorkerError>>,
    /// Set once the advisory wall-clock budget was flagged, so the stuck
    /// marker is written only once.
    pub stuck_flagged: bool,
}

impl Assignment {
    pub fn new(
        item_id: impl Into<String>,
        attempt: u32,
        handle: JoinHandle<Result<WorkerReport, WorkerError>>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            attempt,
            started_at: Utc::now(),
            handle,
            stuck_flagged: false,
        }
    }
}

/// Bounded pool of worker slots.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Option<Assignment>>,
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Indices of empty slots, in fixed order for deterministic filling.
    pub fn empty_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of occupied slots, in fixed order.
    pub fn occupied_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn all_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    pub fn get(&self, index: usize) -> Option<&Assignment> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Assignment> {
        self.slots.get_mut(index).and_then(|slot| slot.as_mut())
    }

    /// Fill an empty slot. A bug-guard: filling an occupied slot drops
    /// nothing silently, the previous assignment is returned.
    pub fn assign(&mut self, index: usize, assignment: Assignment) -> Option<Assignment> {
        match self.slots.get_mut(index) {
            Some(slot) => slot.replace(assignment),
            None => Some(assignment),
        }
    }

    /// Empty a slot, returning its assignment.
    pub fn take(&mut self, index: usize) -> Option<Assignment> {
        self.slots.get_mut(index).and_then(|slot| slot.take())
    }

    /// Abort every running task and empty all slots. Used by recovery.
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(assignment) = slot.take() {
                assignment.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerReport;

    fn dummy_handle() -> JoinHandle<Result<WorkerReport, WorkerError>> {
        tokio::spawn(async {
            Ok(WorkerReport {
                success: true,
                raw_output: String::new(),
                change: None,
            })
        })
    }

    #[tokio::test]
    async fn pool_tracks_empty_and_occupied_slots() {
        let mut pool = SlotPool::new(3);
        assert_eq!(pool.empty_indices(), vec![0, 1, 2]);

        assert!(pool.assign(1, Assignment::new("a", 1, dummy_handle())).is_none());
        assert_eq!(pool.empty_indices(), vec![0, 2]);
        assert_eq!(pool.occupied_indices(), vec![1]);
        assert!(!pool.all_empty());

        let taken = pool.take(1).expect("assignment");
        assert_eq!(taken.item_id, "a");
        assert!(pool.all_empty());
        taken.handle.abort();
    }

    #[tokio::test]
    async fn clear_all_empties_every_slot() {
        let mut pool = SlotPool::new(2);
        pool.assign(0, Assignment::new("a", 1, dummy_handle()));
        pool.assign(1, Assignment::new("b", 1, dummy_handle()));
        pool.clear_all();
        assert!(pool.all_empty());
    }

    #[tokio::test]
    async fn zero_sized_pool_gets_one_slot() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.len(), 1);
    }
}
