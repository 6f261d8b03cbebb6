//! Durable run trail.
//!
//! Every run appends typed lifecycle events to a JSONL log under the data
//! directory, next to a small manifest. The trail exists so a human can
//! reconstruct why an item stalled without re-running anything; writing it
//! is best-effort and never blocks dispatch.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current journal schema version.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

const JOURNAL_DIR_NAME: &str = "journal";
const EVENTS_FILE_NAME: &str = "events.jsonl";
const MANIFEST_FILE_NAME: &str = "run.json";

/// Errors from journal storage operations.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed lifecycle events recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    RunStarted {
        slots: usize,
    },
    /// Cycles found in the blocking graph; an anomaly, reported not hidden.
    CycleAnomaly {
        cycles: Vec<Vec<String>>,
    },
    ItemClaimed {
        item: String,
        slot: usize,
        attempt: u32,
    },
    GateResult {
        item: String,
        gate: String,
        passed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ItemClosed {
        item: String,
    },
    RetryScheduled {
        item: String,
        next_attempt: u32,
        reason: String,
    },
    ItemSerialized {
        item: String,
        behind: String,
    },
    EscalationCreated {
        item: String,
        analysis: String,
    },
    ItemFailed {
        item: String,
        reason: String,
    },
    ItemStuck {
        item: String,
        elapsed_secs: u64,
    },
    OrphanReset {
        item: String,
    },
    RunCompleted {
        closed: u64,
        failed: u64,
        retries: u64,
        escalations: u64,
    },
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JournalEvent,
}

/// Manifest stored alongside a run's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record_count: u64,
}

/// Appends journal records for one run to durable storage.
#[derive(Debug)]
pub struct Journal {
    run_id: String,
    run_dir: PathBuf,
    manifest: RunManifest,
}

impl Journal {
    /// Open (creating directories as needed) the journal for a run.
    pub fn open(data_dir: &Path, run_id: impl Into<String>) -> Result<Self, JournalError> {
        let run_id = run_id.into();
        let run_dir = data_dir.join(JOURNAL_DIR_NAME).join(&run_id);
        fs::create_dir_all(&run_dir)?;
        let now = Utc::now();
        Ok(Self {
            run_id: run_id.clone(),
            run_dir,
            manifest: RunManifest {
                schema_version: JOURNAL_SCHEMA_VERSION,
                run_id,
                created_at: now,
                updated_at: now,
                record_count: 0,
            },
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event and refresh the manifest.
    pub fn record(&mut self, event: JournalEvent) -> Result<(), JournalError> {
        let record = JournalRecord {
            schema_version: JOURNAL_SCHEMA_VERSION,
            run_id: self.run_id.clone(),
            recorded_at: Utc::now(),
            event,
        };

        let events_path = self.run_dir.join(EVENTS_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;
        let json = serde_json::to_string(&record)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;

        self.manifest.updated_at = record.recorded_at;
        self.manifest.record_count += 1;
        self.write_manifest()?;
        Ok(())
    }

    fn write_manifest(&self) -> Result<(), JournalError> {
        let json = serde_json::to_string_pretty(&self.manifest)?;
        let temp_path = self.run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        let manifest_path = self.run_dir.join(MANIFEST_FILE_NAME);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &manifest_path)?;
        Ok(())
    }
}

/// Generate a run id from the wall clock and process id.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("run-{}-{}", timestamp_ms, pid)
}
