//! Per-user data layout.
//!
//! Everything jobman persists lives under a single data directory
//! (`$JOBMAN_DIR` or `~/.jobman`), except the IPC socket which prefers the
//! user runtime directory when the platform provides one.

use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "JOBMAN_DIR";

/// Resolved locations of every durable and runtime file the daemon touches.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root data directory (e.g. `~/.jobman`).
    pub data_dir: PathBuf,
    /// Runtime directory holding the socket (e.g. `$XDG_RUNTIME_DIR/jobman`).
    pub runtime_dir: PathBuf,
    /// `jobs.json`: durable job catalogue.
    pub jobs_file: PathBuf,
    /// `history.db`: execution history.
    pub history_db: PathBuf,
    /// `config.json`: user configuration.
    pub config_file: PathBuf,
    /// `daemon.pid`: singleton lock.
    pub pid_file: PathBuf,
    /// `daemon.log`: daemon's own log, size-rotated.
    pub daemon_log: PathBuf,
    /// `logs/`: per-job execution logs.
    pub logs_dir: PathBuf,
    /// `jobman.sock`: IPC endpoint.
    pub socket_path: PathBuf,
}

impl Paths {
    /// Resolve the layout, honoring `$JOBMAN_DIR` over the home default.
    pub fn resolve() -> Result<Self> {
        match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Ok(Self::from_data_dir(PathBuf::from(dir))),
            _ => {
                let base = BaseDirs::new().context("could not determine home directory")?;
                let data_dir = base.home_dir().join(".jobman");
                let runtime_dir = runtime_base().unwrap_or_else(|| data_dir.join("run"));
                Ok(Self::with_dirs(data_dir, runtime_dir))
            }
        }
    }

    /// Build the layout rooted at an explicit data directory. The socket
    /// moves under it too, so two instances with different roots never
    /// share an endpoint.
    pub fn from_data_dir(data_dir: PathBuf) -> Self {
        let runtime_dir = data_dir.join("run");
        Self::with_dirs(data_dir, runtime_dir)
    }

    fn with_dirs(data_dir: PathBuf, runtime_dir: PathBuf) -> Self {
        Self {
            jobs_file: data_dir.join("jobs.json"),
            history_db: data_dir.join("history.db"),
            config_file: data_dir.join("config.json"),
            pid_file: data_dir.join("daemon.pid"),
            daemon_log: data_dir.join("daemon.log"),
            logs_dir: data_dir.join("logs"),
            socket_path: runtime_dir.join("jobman.sock"),
            data_dir,
            runtime_dir,
        }
    }

    /// Create the data, runtime and per-job log directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.runtime_dir, &self.logs_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Per-job log file: `logs/<name>.log`, falling back to the id for
    /// unnamed jobs.
    pub fn job_log_file(&self, id: u64, name: Option<&str>) -> PathBuf {
        let stem = name.map_or_else(|| format!("job-{id}"), str::to_string);
        self.logs_dir.join(format!("{stem}.log"))
    }
}

#[cfg(unix)]
fn runtime_base() -> Option<PathBuf> {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|v| !v.is_empty())
        .map(|v| Path::new(&v).join("jobman"))
}

#[cfg(not(unix))]
fn runtime_base() -> Option<PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_data_dir() {
        let paths = Paths::from_data_dir(PathBuf::from("/tmp/jm-test"));
        assert_eq!(paths.jobs_file, PathBuf::from("/tmp/jm-test/jobs.json"));
        assert_eq!(paths.history_db, PathBuf::from("/tmp/jm-test/history.db"));
        assert_eq!(paths.pid_file, PathBuf::from("/tmp/jm-test/daemon.pid"));
        assert_eq!(paths.logs_dir, PathBuf::from("/tmp/jm-test/logs"));
    }

    #[test]
    fn job_log_file_prefers_name() {
        let paths = Paths::from_data_dir(PathBuf::from("/tmp/jm-test"));
        assert_eq!(
            paths.job_log_file(3, Some("backup")),
            PathBuf::from("/tmp/jm-test/logs/backup.log")
        );
        assert_eq!(
            paths.job_log_file(3, None),
            PathBuf::from("/tmp/jm-test/logs/job-3.log")
        );
    }
}
