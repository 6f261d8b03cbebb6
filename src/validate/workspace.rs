//! Shared-baseline abstraction used by the validation gates.
//!
//! Workers produce changes in isolation against a stale-but-consistent
//! snapshot; only the trial merge and the final integration touch the
//! current baseline. The trial merge must be fully unwound before it
//! returns, whatever the outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{ItemKind, WorkItem};
use crate::worker::ChangeSet;

/// Errors from baseline operations (tooling problems, not gate verdicts).
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tool failed: {0}")]
    Tool(String),
}

/// Narrowest test selection for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScope {
    /// Test-name filter; `None` runs the full suite.
    pub filter: Option<String>,
}

impl TestScope {
    pub fn full() -> Self {
        Self { filter: None }
    }

    pub fn filtered(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
        }
    }

    /// Key used by fakes and logs to identify the scope.
    pub fn key(&self) -> &str {
        self.filter.as_deref().unwrap_or("*")
    }
}

/// Narrowest scope for an item, from its kind and title.
///
/// Atoms and composites run only tests matching a slug of their title;
/// assemblies and integration items exercise the full suite.
pub fn scope_for_item(item: &WorkItem) -> TestScope {
    match item.kind {
        ItemKind::Atom | ItemKind::Composite => TestScope::filtered(title_slug(&item.title)),
        ItemKind::Assembly | ItemKind::Integration => TestScope::full(),
    }
}

fn title_slug(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// Result of running a test scope.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub passed: bool,
    pub output: String,
}

/// Coarse categorization of an overlapping edit, used for resolution hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    SharedTypeDefinition,
    SharedExportList,
    SharedConfiguration,
    Generic,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::SharedTypeDefinition => "shared-type-definition",
            ConflictKind::SharedExportList => "shared-export-list",
            ConflictKind::SharedConfiguration => "shared-configuration",
            ConflictKind::Generic => "generic-code",
        }
    }
}

/// Categorize a conflicting region from its file path and excerpt.
pub fn categorize_conflict(file: &str, excerpt: &str) -> ConflictKind {
    let file_lower = file.to_lowercase();
    if file_lower.ends_with(".toml")
        || file_lower.ends_with(".json")
        || file_lower.ends_with(".yaml")
        || file_lower.ends_with(".yml")
        || file_lower.contains("config")
    {
        return ConflictKind::SharedConfiguration;
    }
    if file_lower.ends_with("mod.rs")
        || file_lower.ends_with("lib.rs")
        || excerpt.contains("pub use")
        || excerpt.contains("pub mod")
    {
        return ConflictKind::SharedExportList;
    }
    let type_definition = ["struct ", "enum ", "trait ", "type ", "impl "]
        .iter()
        .any(|kw| excerpt.contains(kw));
    if type_definition {
        return ConflictKind::SharedTypeDefinition;
    }
    ConflictKind::Generic
}

/// One overlapping region found by a trial merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRegion {
    pub file: String,
    /// The overlapping edits, both sides.
    pub excerpt: String,
    /// Item whose already-integrated change owns the other side, when the
    /// workspace can tell.
    pub introduced_by: Option<String>,
    pub kind: ConflictKind,
}

/// Everything the conflict gate learned about an overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub regions: Vec<ConflictRegion>,
}

impl ConflictReport {
    /// First identifiable item owning the other side of the overlap.
    pub fn other_item(&self) -> Option<&str> {
        self.regions
            .iter()
            .find_map(|r| r.introduced_by.as_deref())
    }

    /// Reconciliation hint handed to a tier-1 retry: the exact overlapping
    /// regions plus a content-merge instruction.
    pub fn hint_text(&self) -> String {
        let mut out = String::from(
            "conflict hint: reconcile both sides of the overlapping regions \
             below; merge the content, do not re-implement from scratch.\n",
        );
        for region in &self.regions {
            out.push_str(&format!(
                "--- {} [{}]\n{}\n",
                region.file,
                region.kind.as_str(),
                region.excerpt
            ));
        }
        out
    }

    pub fn summary(&self) -> String {
        let files: Vec<&str> = self.regions.iter().map(|r| r.file.as_str()).collect();
        format!("overlapping edits in: {}", files.join(", "))
    }
}

/// Outcome of a trial merge against the current baseline.
#[derive(Debug, Clone)]
pub enum MergeProbe {
    Clean,
    Conflicted(ConflictReport),
}

/// A non-blocking quality finding.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityFinding {
    pub check: String,
    pub message: String,
}

/// The shared source baseline all workers read and one change at a time
/// is integrated into.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Run the given test scope against the current baseline.
    async fn run_tests(&self, scope: &TestScope) -> Result<TestReport, WorkspaceError>;

    /// Run integration tests if the project has any; `None` when absent.
    async fn run_integration_tests(&self) -> Result<Option<TestReport>, WorkspaceError>;

    /// Attempt a reversible merge of the change against the current
    /// baseline. Must leave the baseline byte-identical to its pre-check
    /// state regardless of outcome.
    async fn trial_merge(&self, change: &ChangeSet) -> Result<MergeProbe, WorkspaceError>;

    /// Integrate the change into the baseline. The one serialized write.
    async fn integrate(&self, change: &ChangeSet) -> Result<(), WorkspaceError>;

    /// Static analysis / style / type-check findings.
    async fn quality_checks(&self) -> Result<Vec<QualityFinding>, WorkspaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_narrows_for_atoms_and_widens_for_assemblies() {
        let atom = WorkItem::new("a", "Implement token Lexer!", ItemKind::Atom);
        assert_eq!(scope_for_item(&atom).filter.as_deref(), Some("implement_token_lexer"));

        let assembly = WorkItem::new("b", "Assemble parser stack", ItemKind::Assembly);
        assert_eq!(scope_for_item(&assembly).filter, None);
    }

    #[test]
    fn conflict_categorization_rules() {
        assert_eq!(
            categorize_conflict("Cargo.toml", "version = \"1\""),
            ConflictKind::SharedConfiguration
        );
        assert_eq!(
            categorize_conflict("src/lib.rs", "pub use parser::Parser;"),
            ConflictKind::SharedExportList
        );
        assert_eq!(
            categorize_conflict("src/types.rs", "pub struct Token {"),
            ConflictKind::SharedTypeDefinition
        );
        assert_eq!(
            categorize_conflict("src/util.rs", "let x = 1;"),
            ConflictKind::Generic
        );
    }

    #[test]
    fn other_item_finds_first_provenance() {
        let report = ConflictReport {
            regions: vec![
                ConflictRegion {
                    file: "src/a.rs".to_string(),
                    excerpt: String::new(),
                    introduced_by: None,
                    kind: ConflictKind::Generic,
                },
                ConflictRegion {
                    file: "src/b.rs".to_string(),
                    excerpt: String::new(),
                    introduced_by: Some("other".to_string()),
                    kind: ConflictKind::Generic,
                },
            ],
        };
        assert_eq!(report.other_item(), Some("other"));
    }
}
