//! Derived views over the dependency graph.
//!
//! The graph analyzer is an external collaborator in deployments that pair
//! the core with a dedicated analysis CLI; `StoreGraphAnalyzer` is the
//! built-in implementation computing the same views with petgraph directly
//! over the dependency store. Every analyzer call is optional to the
//! scheduler: on error it degrades to FIFO-by-priority instead of failing
//! the dispatch cycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Bfs, EdgeRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{ItemStatus, WorkItem};
use crate::store::{DependencyStore, ItemFilter, StoreError};

/// Errors from graph analysis.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown item in graph query: {0}")]
    UnknownItem(String),
}

/// A dispatch candidate together with its downstream-impact score.
#[derive(Debug, Clone)]
pub struct RankedItem {
    pub item: WorkItem,
    /// Number of items transitively unblocked by closing this one.
    pub impact: usize,
}

/// Point-in-time capture of the graph, used for change tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub taken_at: DateTime<Utc>,
    pub items: Vec<SnapshotItem>,
    /// Edges as (blocker, blocked) pairs.
    pub edges: Vec<(String, String)>,
}

/// One item's identity and status within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub id: String,
    pub status: ItemStatus,
}

/// Difference between two graph snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    pub added_items: Vec<String>,
    pub removed_items: Vec<String>,
    /// (id, status before, status after) for items present in both.
    pub status_changes: Vec<(String, ItemStatus, ItemStatus)>,
    pub added_edges: Vec<(String, String)>,
    pub removed_edges: Vec<(String, String)>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.added_items.is_empty()
            && self.removed_items.is_empty()
            && self.status_changes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }
}

/// Compute the difference between two snapshots of the same graph.
pub fn diff_snapshots(before: &GraphSnapshot, after: &GraphSnapshot) -> GraphDiff {
    let before_items: HashMap<&str, ItemStatus> = before
        .items
        .iter()
        .map(|i| (i.id.as_str(), i.status))
        .collect();
    let after_items: HashMap<&str, ItemStatus> = after
        .items
        .iter()
        .map(|i| (i.id.as_str(), i.status))
        .collect();

    let mut diff = GraphDiff::default();
    for item in &after.items {
        match before_items.get(item.id.as_str()) {
            None => diff.added_items.push(item.id.clone()),
            Some(&prev) if prev != item.status => {
                diff.status_changes.push((item.id.clone(), prev, item.status));
            }
            Some(_) => {}
        }
    }
    for item in &before.items {
        if !after_items.contains_key(item.id.as_str()) {
            diff.removed_items.push(item.id.clone());
        }
    }
    for edge in &after.edges {
        if !before.edges.contains(edge) {
            diff.added_edges.push(edge.clone());
        }
    }
    for edge in &before.edges {
        if !after.edges.contains(edge) {
            diff.removed_edges.push(edge.clone());
        }
    }
    diff
}

/// Derived-view queries the scheduler and conflict resolver rely on.
#[async_trait]
pub trait GraphAnalyzer: Send + Sync {
    /// Cycles in the full blocking graph, each as a list of item ids.
    /// An acyclic graph returns an empty list.
    async fn detect_cycles(&self) -> Result<Vec<Vec<String>>, GraphError>;

    /// Rank candidates by downstream impact, descending; ties broken by
    /// priority (lower first), then by the candidates' given order.
    async fn rank_by_impact(&self, candidates: &[WorkItem]) -> Result<Vec<RankedItem>, GraphError>;

    /// Partition non-closed work into independent tracks: groups with no
    /// blocking relationship between them, safe to drive in parallel.
    async fn parallel_tracks(&self) -> Result<Vec<Vec<String>>, GraphError>;

    /// Whether adding a `blocker -> blocked` edge would create a cycle.
    async fn would_create_cycle(&self, blocked: &str, blocker: &str) -> Result<bool, GraphError>;

    /// Capture the current graph for later diffing.
    async fn snapshot(&self) -> Result<GraphSnapshot, GraphError>;
}

/// Petgraph-backed analyzer reading directly from the dependency store.
pub struct StoreGraphAnalyzer {
    store: Arc<dyn DependencyStore>,
}

struct LoadedGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    items: Vec<WorkItem>,
}

impl StoreGraphAnalyzer {
    pub fn new(store: Arc<dyn DependencyStore>) -> Self {
        Self { store }
    }

    /// Build a petgraph view with edges pointing blocker -> blocked.
    async fn load(&self) -> Result<LoadedGraph, GraphError> {
        let items = self.store.list_items(ItemFilter::all()).await?;
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for item in &items {
            let idx = graph.add_node(item.id.clone());
            nodes.insert(item.id.clone(), idx);
        }
        for item in &items {
            let blocked = nodes[&item.id];
            for blocker in &item.blocked_by {
                // Edges to unknown blockers are dropped rather than
                // invented; readiness already treats them as unresolved.
                if let Some(&b) = nodes.get(blocker) {
                    graph.add_edge(b, blocked, ());
                }
            }
        }
        Ok(LoadedGraph { graph, nodes, items })
    }
}

#[async_trait]
impl GraphAnalyzer for StoreGraphAnalyzer {
    async fn detect_cycles(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let loaded = self.load().await?;
        let mut cycles = Vec::new();
        for scc in tarjan_scc(&loaded.graph) {
            let cyclic = scc.len() > 1
                || (scc.len() == 1 && loaded.graph.contains_edge(scc[0], scc[0]));
            if cyclic {
                cycles.push(scc.iter().map(|&n| loaded.graph[n].clone()).collect());
            }
        }
        Ok(cycles)
    }

    async fn rank_by_impact(&self, candidates: &[WorkItem]) -> Result<Vec<RankedItem>, GraphError> {
        let loaded = self.load().await?;
        let mut ranked: Vec<RankedItem> = candidates
            .iter()
            .map(|item| {
                let impact = match loaded.nodes.get(&item.id) {
                    Some(&start) => {
                        let mut bfs = Bfs::new(&loaded.graph, start);
                        let mut reached = 0usize;
                        while let Some(node) = bfs.next(&loaded.graph) {
                            if node != start {
                                reached += 1;
                            }
                        }
                        reached
                    }
                    None => 0,
                };
                RankedItem {
                    item: item.clone(),
                    impact,
                }
            })
            .collect();
        // Stable sort keeps the candidates' original order as the final
        // tie-breaker, which is what makes dispatch deterministic.
        ranked.sort_by(|a, b| {
            b.impact
                .cmp(&a.impact)
                .then(a.item.priority.cmp(&b.item.priority))
        });
        Ok(ranked)
    }

    async fn parallel_tracks(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let loaded = self.load().await?;
        let open: Vec<&WorkItem> = loaded
            .items
            .iter()
            .filter(|i| i.status != ItemStatus::Closed)
            .collect();
        // Node indices were assigned in item order, so `items[idx.index()]`
        // is the item behind each node.
        let mut uf = UnionFind::new(loaded.graph.node_count());
        for edge in loaded.graph.edge_references() {
            let a = edge.source();
            let b = edge.target();
            let a_open = loaded.items[a.index()].status != ItemStatus::Closed;
            let b_open = loaded.items[b.index()].status != ItemStatus::Closed;
            if a_open && b_open {
                uf.union(a.index(), b.index());
            }
        }
        let mut tracks: HashMap<usize, Vec<String>> = HashMap::new();
        for item in open {
            let idx = loaded.nodes[&item.id];
            tracks
                .entry(uf.find(idx.index()))
                .or_default()
                .push(item.id.clone());
        }
        let mut out: Vec<Vec<String>> = tracks.into_values().collect();
        out.sort_by(|a, b| a.first().cmp(&b.first()));
        Ok(out)
    }

    async fn would_create_cycle(&self, blocked: &str, blocker: &str) -> Result<bool, GraphError> {
        if blocked == blocker {
            return Ok(true);
        }
        let loaded = self.load().await?;
        let from = *loaded
            .nodes
            .get(blocked)
            .ok_or_else(|| GraphError::UnknownItem(blocked.to_string()))?;
        let to = *loaded
            .nodes
            .get(blocker)
            .ok_or_else(|| GraphError::UnknownItem(blocker.to_string()))?;
        // A new blocker -> blocked edge cycles iff blocked already reaches
        // blocker through existing blocks edges.
        Ok(has_path_connecting(&loaded.graph, from, to, None))
    }

    async fn snapshot(&self) -> Result<GraphSnapshot, GraphError> {
        let items = self.store.list_items(ItemFilter::all()).await?;
        let mut edges = Vec::new();
        for item in &items {
            for blocker in &item.blocked_by {
                edges.push((blocker.clone(), item.id.clone()));
            }
        }
        Ok(GraphSnapshot {
            taken_at: Utc::now(),
            items: items
                .into_iter()
                .map(|i| SnapshotItem {
                    id: i.id,
                    status: i.status,
                })
                .collect(),
            edges,
        })
    }
}
