//! Property-style checks for readiness, claiming, cycles, and recovery.

mod common;

use std::collections::HashSet;

use common::harness;
use foreman::item::labels;
use foreman::testkit::MemoryWorkspace;
use foreman::validate::{
    ConflictKind, ConflictRegion, ConflictReport, MergeProbe, Workspace,
};
use foreman::worker::ChangeSet;
use foreman::{
    DependencyStore, GraphAnalyzer, ItemKind, ItemStatus, MemoryStore, StoreGraphAnalyzer,
    WorkItem,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;

/// Random DAG: item i may only be blocked by items j < i, so the graph is
/// acyclic by construction.
fn random_dag(rng: &mut StdRng, size: usize) -> Vec<WorkItem> {
    let mut items = Vec::with_capacity(size);
    for i in 0..size {
        let mut item = WorkItem::new(format!("n{}", i), format!("Node {}", i), ItemKind::Atom);
        for j in 0..i {
            if rng.gen_bool(0.2) {
                item.blocked_by.push(format!("n{}", j));
            }
        }
        if rng.gen_bool(0.5) {
            item.status = ItemStatus::Closed;
        } else if rng.gen_bool(0.1) {
            item.labels.insert(labels::FAILED.to_string());
        }
        items.push(item);
    }
    items
}

fn brute_force_ready(items: &[WorkItem]) -> HashSet<String> {
    let closed: HashSet<&str> = items
        .iter()
        .filter(|i| i.status == ItemStatus::Closed)
        .map(|i| i.id.as_str())
        .collect();
    items
        .iter()
        .filter(|i| {
            i.status == ItemStatus::Open
                && !i.is_permanently_failed()
                && i.blocked_by.iter().all(|b| closed.contains(b.as_str()))
        })
        .map(|i| i.id.clone())
        .collect()
}

#[tokio::test]
async fn readiness_matches_direct_graph_traversal() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let items = random_dag(&mut rng, 25);
        let expected = brute_force_ready(&items);

        let store = MemoryStore::seeded(items).await.expect("seed");
        let actual: HashSet<String> = store
            .ready_items()
            .await
            .expect("ready")
            .into_iter()
            .map(|i| i.id)
            .collect();

        assert_eq!(actual, expected, "seed {}", seed);
    }
}

#[tokio::test]
async fn cycle_detection_refuses_exactly_the_cycle_creating_edges() {
    for seed in 0..10u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let items = random_dag(&mut rng, 15);

        // Brute-force reachability over blocker -> blocked edges.
        let reaches = |from: &str, to: &str| -> bool {
            let mut frontier = vec![from.to_string()];
            let mut seen = HashSet::new();
            while let Some(current) = frontier.pop() {
                if current == to {
                    return true;
                }
                if !seen.insert(current.clone()) {
                    continue;
                }
                for item in &items {
                    if item.blocked_by.iter().any(|b| *b == current) {
                        frontier.push(item.id.clone());
                    }
                }
            }
            false
        };

        let store: Arc<dyn DependencyStore> =
            Arc::new(MemoryStore::seeded(items.clone()).await.expect("seed"));
        let analyzer = StoreGraphAnalyzer::new(store);

        for _ in 0..30 {
            let blocked = format!("n{}", rng.gen_range(0..items.len()));
            let blocker = format!("n{}", rng.gen_range(0..items.len()));
            let expected = blocked == blocker || reaches(&blocked, &blocker);
            let actual = analyzer
                .would_create_cycle(&blocked, &blocker)
                .await
                .expect("cycle query");
            assert_eq!(actual, expected, "seed {} edge {}->{}", seed, blocker, blocked);
        }
    }
}

#[tokio::test]
async fn no_item_is_ever_assigned_twice() {
    let dir = TempDir::new().expect("temp dir");
    let items: Vec<WorkItem> = (0..10)
        .map(|i| WorkItem::new(format!("w{}", i), format!("Implement widget {}", i), ItemKind::Atom))
        .collect();
    let mut h = harness(items, 4, dir.path()).await;

    let stats = h.scheduler.run().await.expect("run");

    let executions = h.worker.executions();
    let unique: HashSet<&(String, u32)> = executions.iter().collect();
    assert_eq!(executions.len(), unique.len(), "duplicate assignment");
    assert_eq!(executions.len(), 10);
    assert_eq!(stats.closed, 10);
}

#[tokio::test]
async fn recovery_resets_orphans_without_losing_items() {
    let dir = TempDir::new().expect("temp dir");
    let mut claimed = WorkItem::new("a", "Implement alpha", ItemKind::Atom);
    claimed.status = ItemStatus::Claimed;
    let mut validating = WorkItem::new("b", "Implement bravo", ItemKind::Atom);
    validating.status = ItemStatus::Validating;
    let open = WorkItem::new("c", "Implement charlie", ItemKind::Atom);
    let mut closed = WorkItem::new("d", "Implement delta", ItemKind::Atom);
    closed.status = ItemStatus::Closed;

    let mut h = harness(vec![claimed, validating, open, closed], 2, dir.path()).await;
    h.scheduler.recover().await.expect("recover");

    for id in ["a", "b"] {
        let item = h.store.get_item(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Open, "{} reset to open", id);
        assert!(item
            .comments
            .iter()
            .any(|c| c.body.contains("reset orphaned item")));
    }
    assert_eq!(
        h.store.get_item("c").await.unwrap().status,
        ItemStatus::Open
    );
    assert_eq!(
        h.store.get_item("d").await.unwrap().status,
        ItemStatus::Closed
    );

    // A full run after recovery drives everything to closed; nothing was
    // duplicated or lost.
    let stats = h.scheduler.run().await.expect("run");
    assert_eq!(stats.closed, 3);
    let all = h
        .store
        .list_items(foreman::store::ItemFilter::all())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.iter().all(|i| i.status == ItemStatus::Closed));
}

#[tokio::test]
async fn trial_merge_never_mutates_the_baseline() {
    let workspace = MemoryWorkspace::new();
    workspace.register_change(
        "seed-attempt-1",
        vec![("src/lib.rs".to_string(), "pub fn seed() {}".to_string())],
    );
    workspace
        .integrate(&ChangeSet::new("seed", "seed-attempt-1"))
        .await
        .expect("integrate");
    let before = workspace.baseline_snapshot();

    // Clean probe.
    let clean = workspace
        .trial_merge(&ChangeSet::new("x", "x-attempt-1"))
        .await
        .expect("probe");
    assert!(matches!(clean, MergeProbe::Clean));
    assert_eq!(workspace.baseline_snapshot(), before);

    // Conflicted probe.
    workspace.script_merge(
        "y-attempt-1",
        MergeProbe::Conflicted(ConflictReport {
            regions: vec![ConflictRegion {
                file: "src/lib.rs".to_string(),
                excerpt: String::new(),
                introduced_by: Some("seed".to_string()),
                kind: ConflictKind::Generic,
            }],
        }),
    );
    let conflicted = workspace
        .trial_merge(&ChangeSet::new("y", "y-attempt-1"))
        .await
        .expect("probe");
    assert!(matches!(conflicted, MergeProbe::Conflicted(_)));
    assert_eq!(workspace.baseline_snapshot(), before);
}

#[tokio::test]
async fn analyzer_outage_degrades_to_priority_order() {
    // No analyzer at all: the scheduler must still dispatch, ordered by
    // priority then insertion order.
    let dir = TempDir::new().expect("temp dir");
    let config = foreman::ForemanConfig {
        worker_slots: 1,
        heartbeat_secs: 0,
        data_dir: dir.path().to_path_buf(),
        ..foreman::ForemanConfig::default()
    };

    let items = vec![
        WorkItem::new("low", "Implement low", ItemKind::Atom).with_priority(5),
        WorkItem::new("high", "Implement high", ItemKind::Atom).with_priority(1),
    ];
    let store = Arc::new(MemoryStore::seeded(items).await.expect("seed"));
    let store_dyn: Arc<dyn DependencyStore> = store.clone();
    let workspace = Arc::new(MemoryWorkspace::new());
    let worker = Arc::new(foreman::testkit::ScriptedWorker::new(
        store_dyn.clone(),
        workspace.clone(),
    ));

    let mut scheduler = foreman::Scheduler::new(
        config,
        store_dyn,
        None,
        workspace,
        worker.clone(),
    )
    .expect("build scheduler");

    let stats = scheduler.run().await.expect("run");
    assert_eq!(stats.closed, 2);
    assert_eq!(
        worker.executions(),
        vec![("high".to_string(), 1), ("low".to_string(), 1)]
    );
}
