//! User configuration, loaded from `config.json` in the data directory.
//!
//! Every key has a default; a missing or partial file is fine and unknown
//! keys are ignored so older daemons tolerate newer configs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
    pub history: HistoryConfig,
    pub cleanup: CleanupConfig,
}

/// `daemon.*`: execution-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Cap on simultaneously executing jobs.
    pub max_concurrent: usize,
    /// Shell interpreter; platform default when unset.
    pub shell: Option<String>,
    /// Arguments placed before the command string (default `-c`).
    pub shell_args: Option<Vec<String>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            shell: None,
            shell_args: None,
        }
    }
}

impl DaemonConfig {
    /// The interpreter and leading args used to run every job command.
    pub fn shell_invocation(&self) -> (String, Vec<String>) {
        let shell = self
            .shell
            .clone()
            .unwrap_or_else(|| default_shell().to_string());
        let args = self
            .shell_args
            .clone()
            .unwrap_or_else(|| vec!["-c".to_string()]);
        (shell, args)
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd"
    } else {
        "sh"
    }
}

/// `jobs.*`: per-job defaults applied at add time when the draft is silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobsConfig {
    /// Default timeout in milliseconds; absent = unlimited.
    #[serde(with = "crate::schedule::serde_opt_duration_ms")]
    pub default_timeout: Option<u64>,
    /// Default retry count (total attempts = retry + 1).
    pub default_retry: u32,
    /// Default working directory; absent = daemon's cwd.
    pub default_cwd: Option<PathBuf>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            default_retry: 0,
            default_cwd: None,
        }
    }
}

/// `logging.*`: daemon log and per-job log rotation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level filter for the daemon log ("ERROR".."TRACE").
    pub level: String,
    /// Rotate a log file once it exceeds this many bytes.
    pub max_file_size: u64,
    /// Rotated predecessors kept per log file.
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            max_file_size: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

/// `history.*`: retention applied on every insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryConfig {
    pub max_entries_per_job: usize,
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries_per_job: 100,
            retention_days: 30,
        }
    }
}

/// `cleanup.*`: the daemon's hourly housekeeping pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanupConfig {
    /// Completed once-jobs older than this are dropped from the catalogue.
    pub completed_job_retention_days: u32,
    /// Per-job log files untouched for this long are deleted.
    pub log_retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            completed_job_retention_days: 7,
            log_retention_days: 30,
        }
    }
}

impl Config {
    /// Load `config.json`, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read config: {}", path.display())),
        }
    }
}
