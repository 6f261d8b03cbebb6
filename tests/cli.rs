//! Binary-level checks for the foreman CLI.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman_cmd() -> Command {
    Command::cargo_bin("foreman").expect("foreman binary")
}

#[test]
fn help_lists_dispatch_options() {
    foreman_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--plan"))
        .stdout(predicate::str::contains("--slots"))
        .stdout(predicate::str::contains("--max-attempts"));
}

#[test]
fn missing_worker_command_is_a_startup_error() {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join("plan.json"), "[]").expect("plan");

    foreman_cmd()
        .current_dir(dir.path())
        .assert()
        .code(2);
}

/// A plan whose items are all already closed quiesces immediately without
/// ever launching a worker.
#[test]
fn fully_closed_plan_exits_cleanly() {
    let dir = TempDir::new().expect("temp dir");
    fs::write(
        dir.path().join("plan.json"),
        r#"[
            {"id": "a", "title": "Implement alpha", "kind": "atom", "closed": true},
            {"id": "b", "title": "Implement bravo", "kind": "atom", "blocked_by": ["a"], "closed": true}
        ]"#,
    )
    .expect("plan");
    fs::write(
        dir.path().join("foreman.toml"),
        "worker_command = [\"false\"]\ndata_dir = \".foreman\"\n",
    )
    .expect("config");

    foreman_cmd()
        .current_dir(dir.path())
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    // The run left its journal behind.
    assert!(dir.path().join(".foreman").join("journal").exists());
}

#[test]
fn bad_plan_json_is_a_startup_error() {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join("plan.json"), "not json").expect("plan");
    fs::write(
        dir.path().join("foreman.toml"),
        "worker_command = [\"false\"]\n",
    )
    .expect("config");

    foreman_cmd()
        .current_dir(dir.path())
        .assert()
        .code(2);
}
