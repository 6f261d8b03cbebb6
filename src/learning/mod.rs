//! Failure-pattern accumulation and dispatch-context building.
//!
//! Every blocking-gate failure is classified into a small fixed taxonomy
//! and folded into per-(category, message) `ErrorPattern` records. Before
//! each dispatch the scheduler asks for guidance text assembled from the
//! most frequent patterns. The store only grows within a run and persists
//! across runs as JSON.

mod rules;

pub use rules::{Classified, FailureCategory, RuleError};

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{ItemKind, WorkItem};

/// Current learning-store schema version.
pub const LEARNING_SCHEMA_VERSION: u32 = 1;

/// Occurrences within the recent window before a pattern counts as
/// increasing.
const TREND_THRESHOLD: u32 = 3;

/// Recent-window width for trend computation.
const TREND_WINDOW_MINUTES: i64 = 60;

/// Direction a pattern's occurrence rate is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Trend::Increasing => "increasing",
            Trend::Stable => "stable",
            Trend::Decreasing => "decreasing",
        };
        write!(f, "{}", name)
    }
}

/// A learned, counted description of a recurring failure and its remedy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub category: FailureCategory,
    /// Normalized message; aggregation key within the category.
    pub message: String,
    /// Recommended fix, free text.
    pub fix: String,
    pub occurrences: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub trend: Trend,
    window_started: DateTime<Utc>,
    window_hits: u32,
    previous_window_hits: u32,
}

impl ErrorPattern {
    fn new(classified: &Classified, now: DateTime<Utc>) -> Self {
        Self {
            category: classified.category,
            message: classified.message.clone(),
            fix: classified.remedy.clone(),
            occurrences: 0,
            first_seen: now,
            last_seen: now,
            trend: Trend::Stable,
            window_started: now,
            window_hits: 0,
            previous_window_hits: 0,
        }
    }

    fn record_hit(&mut self, now: DateTime<Utc>) {
        self.occurrences += 1;
        self.last_seen = now;

        let window = Duration::minutes(TREND_WINDOW_MINUTES);
        if now - self.window_started > window {
            self.previous_window_hits = self.window_hits;
            self.window_started = now;
            self.window_hits = 1;
        } else {
            self.window_hits += 1;
        }

        self.trend = if self.window_hits >= TREND_THRESHOLD {
            Trend::Increasing
        } else if self.previous_window_hits > self.window_hits {
            Trend::Decreasing
        } else {
            Trend::Stable
        };
    }
}

/// Errors from learning-store persistence or setup.
#[derive(Error, Debug)]
pub enum LearningError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    schema_version: u32,
    patterns: Vec<ErrorPattern>,
    kind_notes: HashMap<ItemKind, Vec<String>>,
}

/// Accumulates failure patterns and builds dispatch guidance.
pub struct LearningStore {
    rules: Vec<rules::Rule>,
    patterns: HashMap<(FailureCategory, String), ErrorPattern>,
    kind_notes: HashMap<ItemKind, Vec<String>>,
    top_k: usize,
}

impl LearningStore {
    /// Create an empty store keeping `top_k` patterns per category in
    /// guidance output.
    pub fn new(top_k: usize) -> Result<Self, LearningError> {
        Ok(Self {
            rules: rules::compile_rules()?,
            patterns: HashMap::new(),
            kind_notes: HashMap::new(),
            top_k,
        })
    }

    /// Load persisted state from `path`, or start empty when absent.
    pub fn load(path: &Path, top_k: usize) -> Result<Self, LearningError> {
        let mut store = Self::new(top_k)?;
        match fs::read_to_string(path) {
            Ok(content) => {
                let saved: SavedState = serde_json::from_str(&content)?;
                for pattern in saved.patterns {
                    store
                        .patterns
                        .insert((pattern.category, pattern.message.clone()), pattern);
                }
                store.kind_notes = saved.kind_notes;
                Ok(store)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(store),
            Err(err) => Err(LearningError::Io(err)),
        }
    }

    /// Persist the store as JSON, atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), LearningError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut patterns: Vec<ErrorPattern> = self.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| {
            a.category
                .as_str()
                .cmp(b.category.as_str())
                .then(a.message.cmp(&b.message))
        });
        let saved = SavedState {
            schema_version: LEARNING_SCHEMA_VERSION,
            patterns,
            kind_notes: self.kind_notes.clone(),
        };
        let json = serde_json::to_string_pretty(&saved)?;

        let temp_path = temp_path_for(path);
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Classify raw failure output and fold it into the pattern records.
    ///
    /// Returns the classifications so callers can journal them.
    pub fn record_failure(
        &mut self,
        item: &WorkItem,
        reason: &str,
        raw_output: &str,
    ) -> Vec<Classified> {
        let now = Utc::now();
        let hits = rules::classify(&self.rules, raw_output);
        for hit in &hits {
            let entry = self
                .patterns
                .entry((hit.category, hit.message.clone()))
                .or_insert_with(|| ErrorPattern::new(hit, now));
            entry.record_hit(now);
        }

        let summary = if hits.is_empty() {
            format!("{} failed ({}): unclassified output", item.id, reason)
        } else {
            let categories: Vec<&str> = hits.iter().map(|h| h.category.as_str()).collect();
            format!("{} failed ({}): {}", item.id, reason, categories.join(", "))
        };
        self.kind_notes.entry(item.kind).or_default().push(summary);

        hits
    }

    /// Top patterns for one category, most frequent first.
    pub fn top_patterns(&self, category: FailureCategory) -> Vec<&ErrorPattern> {
        let mut in_category: Vec<&ErrorPattern> = self
            .patterns
            .values()
            .filter(|p| p.category == category)
            .collect();
        in_category.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then(a.message.cmp(&b.message))
        });
        in_category.truncate(self.top_k);
        in_category
    }

    /// Total number of distinct patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Assemble guidance text for the next dispatch of an item.
    ///
    /// Pure text: it biases the worker, never control flow.
    pub fn build_context(&self, kind: ItemKind, attempt: u32) -> String {
        let mut out = String::new();

        if attempt > 1 {
            out.push_str(&format!(
                "IMPORTANT: this item failed {} previous attempt(s). \
                 Read the failure comments on the item before starting, \
                 and address the recorded causes rather than repeating the \
                 prior approach.\n\n",
                attempt - 1
            ));
        }

        let mut pattern_lines = Vec::new();
        for &category in FailureCategory::all() {
            for pattern in self.top_patterns(category) {
                pattern_lines.push(format!(
                    "- [{}] {} (seen {}x, {}) fix: {}",
                    pattern.category, pattern.message, pattern.occurrences, pattern.trend,
                    pattern.fix
                ));
            }
        }
        if !pattern_lines.is_empty() {
            out.push_str("Known failure patterns in this run:\n");
            out.push_str(&pattern_lines.join("\n"));
            out.push('\n');
        }

        if let Some(notes) = self.kind_notes.get(&kind) {
            let recent: Vec<&String> = notes.iter().rev().take(self.top_k).collect();
            if !recent.is_empty() {
                out.push_str(&format!("\nRecent outcomes for {} items:\n", kind));
                for note in recent.into_iter().rev() {
                    out.push_str("- ");
                    out.push_str(note);
                    out.push('\n');
                }
            }
        }

        out
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "learning.json".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
