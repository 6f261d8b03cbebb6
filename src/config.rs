//! Runtime configuration.
//!
//! Loaded from an optional TOML file with `FOREMAN_`-prefixed environment
//! overrides layered on top. Every field has a default, so an empty
//! deployment starts with the stock dispatch behavior.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

fn default_worker_slots() -> usize {
    5
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_item_timeout_secs() -> u64 {
    // Advisory wall-clock budget per item; flags, never kills.
    4 * 60 * 60
}

fn default_learning_top_k() -> usize {
    3
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".foreman")
}

fn default_test_command() -> Vec<String> {
    vec!["cargo".to_string(), "test".to_string()]
}

/// Configuration for one dispatch run.
#[derive(Debug, Clone, Deserialize)]
pub struct ForemanConfig {
    /// Size of the worker pool.
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,

    /// Control-loop polling period. Latency only, never correctness.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Retry budget per item for blocking-gate failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Promote quality-gate findings to blocking.
    #[serde(default)]
    pub quality_blocking: bool,

    /// Advisory per-item wall-clock budget before the stuck flag.
    /// Zero disables flagging.
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Patterns per category included in dispatch guidance.
    #[serde(default = "default_learning_top_k")]
    pub learning_top_k: usize,

    /// Root for the journal and the persisted learning store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// External agent command handed each work order.
    #[serde(default)]
    pub worker_command: Vec<String>,

    /// Test runner; the gate appends the scope filter when narrowing.
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,

    /// Filter selecting integration tests; absent means the project has
    /// none and gate 2 skips its test half.
    #[serde(default)]
    pub integration_filter: Option<String>,

    /// Quality check commands, each run independently by gate 5.
    #[serde(default)]
    pub quality_commands: Vec<Vec<String>>,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            worker_slots: default_worker_slots(),
            heartbeat_secs: default_heartbeat_secs(),
            max_attempts: default_max_attempts(),
            quality_blocking: false,
            item_timeout_secs: default_item_timeout_secs(),
            learning_top_k: default_learning_top_k(),
            data_dir: default_data_dir(),
            worker_command: Vec::new(),
            test_command: default_test_command(),
            integration_filter: None,
            quality_commands: Vec::new(),
        }
    }
}

impl ForemanConfig {
    /// Load configuration from an optional TOML file plus environment
    /// overrides (`FOREMAN_MAX_ATTEMPTS=5` and friends).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path.to_path_buf())),
            None => builder.add_source(File::with_name("foreman").required(false)),
        };
        builder
            .add_source(Environment::with_prefix("FOREMAN"))
            .build()?
            .try_deserialize()
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    /// Path of the persisted learning store.
    pub fn learning_path(&self) -> PathBuf {
        self.data_dir.join("learning").join("patterns.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ForemanConfig::default();
        assert_eq!(config.worker_slots, 5);
        assert_eq!(config.heartbeat_secs, 10);
        assert_eq!(config.max_attempts, 3);
        assert!(!config.quality_blocking);
        assert_eq!(config.test_command, vec!["cargo", "test"]);
    }

    #[test]
    fn load_reads_toml_overrides() {
        let mut file = NamedTempFile::with_suffix(".toml").expect("temp file");
        writeln!(
            file,
            "worker_slots = 2\nmax_attempts = 5\nquality_blocking = true"
        )
        .expect("write");

        let config = ForemanConfig::load(Some(file.path())).expect("load");
        assert_eq!(config.worker_slots, 2);
        assert_eq!(config.max_attempts, 5);
        assert!(config.quality_blocking);
        // Unspecified fields keep their defaults.
        assert_eq!(config.heartbeat_secs, 10);
    }
}
