//! Git-backed implementation of the shared baseline.
//!
//! Workers leave their changes on branches; the trial merge probes a
//! branch with `merge --no-commit --no-ff` and unwinds completely before
//! returning, stashing any uncommitted state around the probe. Integration
//! commits carry the item id in the subject line so later conflicts can be
//! attributed to the item that introduced the other side.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;

use crate::validate::workspace::{
    categorize_conflict, ConflictRegion, ConflictReport, MergeProbe, QualityFinding, TestReport,
    TestScope, Workspace, WorkspaceError,
};
use crate::worker::ChangeSet;

const TRIAL_STASH_MESSAGE: &str = "foreman-trial-merge";

/// Shared baseline rooted at a git working tree.
pub struct GitWorkspace {
    root: PathBuf,
    /// Test runner command; the scope filter is appended when present.
    test_command: Vec<String>,
    /// Filter selecting integration tests; `None` means the project has none.
    integration_filter: Option<String>,
    /// Quality check commands, each run independently.
    quality_commands: Vec<Vec<String>>,
}

impl GitWorkspace {
    pub fn new(
        root: impl Into<PathBuf>,
        test_command: Vec<String>,
        integration_filter: Option<String>,
        quality_commands: Vec<Vec<String>>,
    ) -> Self {
        Self {
            root: root.into(),
            test_command,
            integration_filter,
            quality_commands,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    async fn run_git(&self, args: &[&str]) -> Result<Output, WorkspaceError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await?;
        Ok(output)
    }

    async fn git_ok(&self, args: &[&str]) -> Result<(), WorkspaceError> {
        let output = self.run_git(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(WorkspaceError::Tool(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn run_command(&self, command: &[String]) -> Result<Output, WorkspaceError> {
        let program = command
            .first()
            .ok_or_else(|| WorkspaceError::Tool("empty command".to_string()))?;
        let output = Command::new(program)
            .args(&command[1..])
            .current_dir(&self.root)
            .output()
            .await?;
        Ok(output)
    }

    async fn is_dirty(&self) -> Result<bool, WorkspaceError> {
        let output = self.run_git(&["status", "--porcelain"]).await?;
        Ok(!output.stdout.is_empty())
    }

    /// Extract the first conflict-marker block of a file as the excerpt.
    async fn conflict_excerpt(&self, file: &str) -> String {
        let path = self.root.join(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return String::new(),
        };
        let mut excerpt = Vec::new();
        let mut in_block = false;
        for line in content.lines() {
            if line.starts_with("<<<<<<<") {
                in_block = true;
            }
            if in_block {
                excerpt.push(line);
                if line.starts_with(">>>>>>>") || excerpt.len() >= 40 {
                    break;
                }
            }
        }
        excerpt.join("\n")
    }

    /// Attribute a file's other side to the item named in its last
    /// integration commit subject ("<item-id>: ...").
    async fn last_integrator(&self, file: &str) -> Option<String> {
        let output = self
            .run_git(&["log", "-1", "--format=%s", "HEAD", "--", file])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let subject = String::from_utf8_lossy(&output.stdout);
        let subject = subject.trim();
        let (id, _) = subject.split_once(':')?;
        let id = id.trim();
        if id.is_empty() || id.contains(' ') {
            None
        } else {
            Some(id.to_string())
        }
    }

    /// Undo a probe: abort any in-progress merge and restore stashed state.
    async fn unwind_trial(&self, stashed: bool) -> Result<(), WorkspaceError> {
        // No merge in progress is fine; abort is then a no-op failure.
        let _ = self.run_git(&["merge", "--abort"]).await;
        self.git_ok(&["reset", "--hard", "HEAD"]).await?;
        if stashed {
            self.git_ok(&["stash", "pop"]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn run_tests(&self, scope: &TestScope) -> Result<TestReport, WorkspaceError> {
        let mut command = self.test_command.clone();
        if let Some(filter) = &scope.filter {
            command.push(filter.clone());
        }
        let output = self.run_command(&command).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(TestReport {
            passed: output.status.success(),
            output: text,
        })
    }

    async fn run_integration_tests(&self) -> Result<Option<TestReport>, WorkspaceError> {
        let filter = match &self.integration_filter {
            Some(filter) => filter.clone(),
            None => return Ok(None),
        };
        let report = self.run_tests(&TestScope::filtered(filter)).await?;
        Ok(Some(report))
    }

    async fn trial_merge(&self, change: &ChangeSet) -> Result<MergeProbe, WorkspaceError> {
        let stashed = if self.is_dirty().await? {
            self.git_ok(&["stash", "push", "-u", "-m", TRIAL_STASH_MESSAGE])
                .await?;
            true
        } else {
            false
        };

        let merge = self
            .run_git(&["merge", "--no-commit", "--no-ff", &change.reference])
            .await;

        let probe = match merge {
            Ok(output) if output.status.success() => MergeProbe::Clean,
            Ok(_) => {
                let unmerged = self
                    .run_git(&["diff", "--name-only", "--diff-filter=U"])
                    .await?;
                let files: Vec<String> = String::from_utf8_lossy(&unmerged.stdout)
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();

                let mut regions = Vec::new();
                for file in files {
                    let excerpt = self.conflict_excerpt(&file).await;
                    let introduced_by = self.last_integrator(&file).await;
                    let kind = categorize_conflict(&file, &excerpt);
                    regions.push(ConflictRegion {
                        file,
                        excerpt,
                        introduced_by,
                        kind,
                    });
                }
                MergeProbe::Conflicted(ConflictReport { regions })
            }
            Err(err) => {
                self.unwind_trial(stashed).await?;
                return Err(err);
            }
        };

        self.unwind_trial(stashed).await?;
        Ok(probe)
    }

    async fn integrate(&self, change: &ChangeSet) -> Result<(), WorkspaceError> {
        let message = format!("{}: integrate {}", change.item_id, change.reference);
        self.git_ok(&["merge", "--no-ff", "-m", &message, &change.reference])
            .await
    }

    async fn quality_checks(&self) -> Result<Vec<QualityFinding>, WorkspaceError> {
        let mut findings = Vec::new();
        for command in &self.quality_commands {
            let output = self.run_command(command).await?;
            if !output.status.success() {
                let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
                if !output.stderr.is_empty() {
                    message.push('\n');
                    message.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                let tail: String = message
                    .lines()
                    .rev()
                    .take(20)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                findings.push(QualityFinding {
                    check: command.join(" "),
                    message: tail,
                });
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_remembers_its_root() {
        let ws = GitWorkspace::new(
            "/tmp/project",
            vec!["cargo".to_string(), "test".to_string()],
            None,
            Vec::new(),
        );
        assert_eq!(ws.root(), &PathBuf::from("/tmp/project"));
    }
}
