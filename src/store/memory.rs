//! In-process reference implementation of the dependency store.
//!
//! Used by the binary (seeded from a plan file) and by tests. Keeps items
//! in insertion order so dispatch tie-breaking stays deterministic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::item::{Comment, ItemStatus, WorkItem};
use crate::store::{DependencyStore, ItemFilter, NewItem, StoreError};

#[derive(Debug, Default)]
struct MemoryInner {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
    next_generated: u64,
}

impl MemoryInner {
    fn position(&self, id: &str) -> Result<usize, StoreError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory dependency store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the given items, preserving order.
    pub async fn seeded(items: Vec<WorkItem>) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut inner = store.inner.write().await;
            for item in items {
                if inner.index.contains_key(&item.id) {
                    return Err(StoreError::DuplicateId(item.id));
                }
                let pos = inner.items.len();
                inner.index.insert(item.id.clone(), pos);
                inner.items.push(item);
            }
        }
        Ok(store)
    }
}

#[async_trait]
impl DependencyStore for MemoryStore {
    async fn list_items(&self, filter: ItemFilter) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .items
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    async fn ready_items(&self) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.inner.read().await;
        let closed = |id: &str| {
            inner
                .index
                .get(id)
                .map(|&pos| inner.items[pos].status == ItemStatus::Closed)
                .unwrap_or(false)
        };
        Ok(inner
            .items
            .iter()
            .filter(|item| {
                item.status == ItemStatus::Open
                    && !item.is_permanently_failed()
                    && item.blocked_by.iter().all(|b| closed(b))
            })
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &str) -> Result<WorkItem, StoreError> {
        let inner = self.inner.read().await;
        let pos = inner.position(id)?;
        Ok(inner.items[pos].clone())
    }

    async fn transition(
        &self,
        id: &str,
        from: ItemStatus,
        to: ItemStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pos = inner.position(id)?;
        let item = &mut inner.items[pos];
        if item.status != from {
            return Err(StoreError::StatusConflict {
                id: id.to_string(),
                expected: from,
                actual: item.status,
            });
        }
        item.status = to;
        Ok(())
    }

    async fn set_priority(&self, id: &str, priority: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pos = inner.position(id)?;
        inner.items[pos].priority = priority;
        Ok(())
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pos = inner.position(id)?;
        inner.items[pos].labels.insert(label.to_string());
        Ok(())
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pos = inner.position(id)?;
        inner.items[pos].labels.remove(label);
        Ok(())
    }

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pos = inner.position(id)?;
        inner.items[pos].comments.push(Comment::new(author, body));
        Ok(())
    }

    async fn create_item(&self, new: NewItem) -> Result<WorkItem, StoreError> {
        let mut inner = self.inner.write().await;
        let id = match new.id {
            Some(id) => id,
            None => {
                inner.next_generated += 1;
                format!("item-{}", inner.next_generated)
            }
        };
        if inner.index.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        let mut item = WorkItem::new(id.clone(), new.title, new.kind);
        item.priority = new.priority;
        item.labels = new.labels;
        item.blocked_by = new.blocked_by;
        item.discovered_from = new.discovered_from;
        let pos = inner.items.len();
        inner.index.insert(id, pos);
        inner.items.push(item.clone());
        Ok(item)
    }

    async fn add_blocks_edge(&self, blocker: &str, blocked: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.position(blocker)?;
        let pos = inner.position(blocked)?;
        let edges = &mut inner.items[pos].blocked_by;
        if !edges.iter().any(|b| b == blocker) {
            edges.push(blocker.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(id, id.to_uppercase(), ItemKind::Atom)
    }

    #[tokio::test]
    async fn ready_requires_all_blockers_closed() {
        let store = MemoryStore::seeded(vec![
            item("a"),
            item("b").blocked_by_item("a"),
            item("c").blocked_by_item("a").blocked_by_item("b"),
        ])
        .await
        .unwrap();

        let ready: Vec<String> = store
            .ready_items()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ready, vec!["a"]);

        store
            .transition("a", ItemStatus::Open, ItemStatus::Closed)
            .await
            .unwrap();
        let ready: Vec<String> = store
            .ready_items()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[tokio::test]
    async fn ready_excludes_permanently_failed() {
        let store = MemoryStore::seeded(vec![item("a")]).await.unwrap();
        store.add_label("a", crate::item::labels::FAILED).await.unwrap();
        assert!(store.ready_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_items_filters_by_status_and_label() {
        let store = MemoryStore::seeded(vec![item("a"), item("b")]).await.unwrap();
        store.add_label("b", "attempt-2").await.unwrap();
        store
            .transition("a", ItemStatus::Open, ItemStatus::Closed)
            .await
            .unwrap();

        let open = store
            .list_items(ItemFilter::with_status(ItemStatus::Open))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "b");

        let labeled = store
            .list_items(ItemFilter {
                status: None,
                label: Some("attempt-2".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(labeled.len(), 1);
        assert_eq!(labeled[0].id, "b");
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = MemoryStore::seeded(vec![item("a")]).await.unwrap();
        store
            .transition("a", ItemStatus::Open, ItemStatus::Claimed)
            .await
            .unwrap();

        let err = store
            .transition("a", ItemStatus::Open, ItemStatus::Claimed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));
    }

    #[tokio::test]
    async fn create_item_generates_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store
            .create_item(NewItem::new("Analysis", ItemKind::Integration))
            .await
            .unwrap();
        assert_eq!(created.id, "item-1");

        let mut explicit = NewItem::new("Dup", ItemKind::Atom);
        explicit.id = Some("item-1".to_string());
        let err = store.create_item(explicit).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn add_blocks_edge_deduplicates() {
        let store = MemoryStore::seeded(vec![item("a"), item("b")]).await.unwrap();
        store.add_blocks_edge("a", "b").await.unwrap();
        store.add_blocks_edge("a", "b").await.unwrap();
        let b = store.get_item("b").await.unwrap();
        assert_eq!(b.blocked_by, vec!["a"]);
    }
}
