//! Trial-merge behavior against a real git repository.

use std::path::Path;

use foreman::validate::{GitWorkspace, MergeProbe, Workspace};
use foreman::worker::ChangeSet;
use tempfile::TempDir;
use tokio::process::Command;

async fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

async fn write(dir: &Path, file: &str, content: &str) {
    tokio::fs::write(dir.join(file), content).await.expect("write");
}

async fn read(dir: &Path, file: &str) -> String {
    tokio::fs::read_to_string(dir.join(file)).await.expect("read")
}

async fn porcelain(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir)
        .output()
        .await
        .expect("git status");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Repo with a trunk commit, a conflicting feature branch, and a disjoint
/// feature branch.
async fn setup_repo(dir: &Path) {
    git(dir, &["init", "-b", "trunk"]).await;
    git(dir, &["config", "user.email", "foreman@example.com"]).await;
    git(dir, &["config", "user.name", "Foreman Tests"]).await;

    write(dir, "shared.txt", "base line\n").await;
    git(dir, &["add", "-A"]).await;
    git(dir, &["commit", "-m", "base: initial baseline"]).await;

    git(dir, &["checkout", "-b", "conflicting"]).await;
    write(dir, "shared.txt", "feature line\n").await;
    git(dir, &["commit", "-am", "x: edit shared from feature"]).await;

    git(dir, &["checkout", "trunk"]).await;
    git(dir, &["checkout", "-b", "disjoint"]).await;
    write(dir, "other.txt", "other content\n").await;
    git(dir, &["add", "-A"]).await;
    git(dir, &["commit", "-m", "z: add other file"]).await;

    git(dir, &["checkout", "trunk"]).await;
    write(dir, "shared.txt", "trunk line\n").await;
    git(dir, &["commit", "-am", "y: edit shared from trunk"]).await;
}

fn workspace(dir: &Path) -> GitWorkspace {
    GitWorkspace::new(dir, vec!["true".to_string()], None, Vec::new())
}

#[tokio::test]
async fn conflicting_trial_merge_reports_and_unwinds() {
    let dir = TempDir::new().expect("temp dir");
    setup_repo(dir.path()).await;
    let ws = workspace(dir.path());

    let before = read(dir.path(), "shared.txt").await;
    let probe = ws
        .trial_merge(&ChangeSet::new("x", "conflicting"))
        .await
        .expect("probe");

    let report = match probe {
        MergeProbe::Conflicted(report) => report,
        MergeProbe::Clean => panic!("expected a conflict"),
    };
    assert_eq!(report.regions.len(), 1);
    assert_eq!(report.regions[0].file, "shared.txt");
    assert!(report.regions[0].excerpt.contains("<<<<<<<"));
    // The other side is attributed via the integration-commit subject.
    assert_eq!(report.regions[0].introduced_by.as_deref(), Some("y"));

    // Byte-identical baseline, no merge state left behind.
    assert_eq!(read(dir.path(), "shared.txt").await, before);
    assert_eq!(porcelain(dir.path()).await, "");
}

#[tokio::test]
async fn clean_trial_merge_also_unwinds() {
    let dir = TempDir::new().expect("temp dir");
    setup_repo(dir.path()).await;
    let ws = workspace(dir.path());

    let before = read(dir.path(), "shared.txt").await;
    let probe = ws
        .trial_merge(&ChangeSet::new("z", "disjoint"))
        .await
        .expect("probe");

    assert!(matches!(probe, MergeProbe::Clean));
    // The probed branch's file must not have been left in the tree.
    assert!(!dir.path().join("other.txt").exists());
    assert_eq!(read(dir.path(), "shared.txt").await, before);
    assert_eq!(porcelain(dir.path()).await, "");
}

#[tokio::test]
async fn trial_merge_preserves_uncommitted_state() {
    let dir = TempDir::new().expect("temp dir");
    setup_repo(dir.path()).await;
    let ws = workspace(dir.path());

    write(dir.path(), "scratch.txt", "uncommitted work\n").await;
    let probe = ws
        .trial_merge(&ChangeSet::new("z", "disjoint"))
        .await
        .expect("probe");

    assert!(matches!(probe, MergeProbe::Clean));
    assert_eq!(read(dir.path(), "scratch.txt").await, "uncommitted work\n");
}

#[tokio::test]
async fn integrate_merges_with_item_id_subject() {
    let dir = TempDir::new().expect("temp dir");
    setup_repo(dir.path()).await;
    let ws = workspace(dir.path());

    ws.integrate(&ChangeSet::new("z", "disjoint"))
        .await
        .expect("integrate");

    assert_eq!(read(dir.path(), "other.txt").await, "other content\n");
    let output = Command::new("git")
        .args(["log", "-1", "--format=%s"])
        .current_dir(dir.path())
        .output()
        .await
        .expect("git log");
    let subject = String::from_utf8_lossy(&output.stdout);
    assert!(subject.starts_with("z: integrate disjoint"));
}
