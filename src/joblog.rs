//! Per-job execution logs.
//!
//! Each job gets `logs/<name>.log` (or `logs/job-<id>.log` when unnamed).
//! Lines are `<ISO-8601 UTC> <LEVEL> [stdout|stderr] <text>`; lifecycle
//! messages from the scheduler carry no stream tag. One writer handle per
//! file keeps appends line-atomic across the executor's two stream readers.

use crate::logging::RotatingLogFile;
use crate::paths::Paths;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

pub struct JobLogs {
    paths: Paths,
    max_size: u64,
    max_files: usize,
    files: Mutex<HashMap<PathBuf, Arc<RotatingLogFile>>>,
}

impl JobLogs {
    pub fn new(paths: Paths, max_size: u64, max_files: usize) -> Self {
        Self {
            paths,
            max_size,
            max_files,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Append a line for a job; failures are logged, never propagated;
    /// losing a log line must not fail an execution.
    pub fn append(
        &self,
        job_id: u64,
        job_name: Option<&str>,
        level: LogLevel,
        stream: Option<&str>,
        message: &str,
    ) {
        let path = self.paths.job_log_file(job_id, job_name);
        let file = {
            let mut files = self.files.lock();
            Arc::clone(files.entry(path.clone()).or_insert_with(|| {
                Arc::new(RotatingLogFile::new(path, self.max_size, self.max_files))
            }))
        };

        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = match stream {
            Some(tag) => format!("{ts} {} [{tag}] {message}", level.as_str()),
            None => format!("{ts} {} {message}", level.as_str()),
        };
        if let Err(e) = file.write_line(&line) {
            tracing::warn!("failed to write job log {}: {e}", file.path().display());
        }
    }

    /// Delete per-job log files whose mtime is older than `age_ms`
    /// (0 = all). Returns the number of files removed.
    pub fn remove_older_than(&self, age_ms: u64) -> std::io::Result<usize> {
        let cutoff = std::time::SystemTime::now() - std::time::Duration::from_millis(age_ms);
        let mut removed = 0;

        let entries = match std::fs::read_dir(&self.paths.logs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            // Current logs and rotated generations ("x.log", "x.log.1").
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".log") || n.contains(".log."));
            if !is_log {
                continue;
            }
            let mtime = entry.metadata()?.modified()?;
            if age_ms == 0 || mtime < cutoff {
                std::fs::remove_file(&path)?;
                self.files.lock().remove(&path);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
