//! Tracing setup and size-based log rotation.
//!
//! The daemon log and every per-job log share one rotation policy: once a
//! file crosses `logging.maxFileSize` it is renamed to `<name>.1` (shifting
//! older generations up) and a fresh file is started, keeping at most
//! `logging.maxFiles` rotated predecessors.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// An append-only log file that rotates by size. Writes are line-atomic:
/// callers hand over whole lines and the internal lock prevents interleaving.
pub struct RotatingLogFile {
    path: PathBuf,
    max_size: u64,
    max_files: usize,
    state: Mutex<Option<OpenFile>>,
}

struct OpenFile {
    file: File,
    size: u64,
}

impl RotatingLogFile {
    pub fn new(path: PathBuf, max_size: u64, max_files: usize) -> Self {
        Self {
            path,
            max_size: max_size.max(1),
            max_files,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes, rotating first when the write would cross the cap.
    pub fn write_bytes(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut state = self.state.lock();

        let mut open = match state.take() {
            Some(open) => open,
            None => self.open()?,
        };
        if open.size + buf.len() as u64 > self.max_size {
            drop(open);
            self.rotate()?;
            open = self.open()?;
        }

        open.file.write_all(buf)?;
        open.size += buf.len() as u64;
        *state = Some(open);
        Ok(())
    }

    /// Append one formatted line (a trailing newline is added).
    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_bytes(&buf)
    }

    fn open(&self) -> std::io::Result<OpenFile> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let size = file.metadata()?.len();
        Ok(OpenFile { file, size })
    }

    fn rotate(&self) -> std::io::Result<()> {
        if self.max_files == 0 {
            return std::fs::remove_file(&self.path);
        }
        let numbered = |n: usize| {
            let mut os = self.path.as_os_str().to_owned();
            os.push(format!(".{n}"));
            PathBuf::from(os)
        };
        let _ = std::fs::remove_file(numbered(self.max_files));
        for n in (1..self.max_files).rev() {
            let _ = std::fs::rename(numbered(n), numbered(n + 1));
        }
        std::fs::rename(&self.path, numbered(1))
    }
}

/// `MakeWriter` adapter so tracing-subscriber can log through a
/// [`RotatingLogFile`].
#[derive(Clone)]
pub struct RotatingWriter(Arc<RotatingLogFile>);

impl RotatingWriter {
    pub fn new(file: Arc<RotatingLogFile>) -> Self {
        Self(file)
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()))
}

/// CLI-mode logging: human-readable, stderr, `RUST_LOG` wins over config.
pub fn init_cli(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Daemon-mode logging: plain text into the rotated `daemon.log`.
pub fn init_daemon(config: &LoggingConfig, log_path: &Path) -> Result<()> {
    let file = Arc::new(RotatingLogFile::new(
        log_path.to_path_buf(),
        config.max_file_size,
        config.max_files,
    ));
    file.write_bytes(b"")
        .with_context(|| format!("cannot open daemon log: {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.level))
        .with_writer(RotatingWriter::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_lines_in_order() {
        let tmp = TempDir::new().unwrap();
        let log = RotatingLogFile::new(tmp.path().join("t.log"), 1024 * 1024, 3);
        log.write_line("first").unwrap();
        log.write_line("second").unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw, "first\nsecond\n");
    }

    #[test]
    fn rotates_when_size_cap_is_crossed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.log");
        let log = RotatingLogFile::new(path.clone(), 32, 2);

        for i in 0..12 {
            log.write_line(&format!("line number {i}")).unwrap();
        }

        assert!(path.exists());
        assert!(tmp.path().join("t.log.1").exists());
        // Never more than max_files rotated generations.
        assert!(!tmp.path().join("t.log.3").exists());
    }

    #[test]
    fn rotation_shifts_generations() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.log");
        let log = RotatingLogFile::new(path.clone(), 8, 2);

        log.write_line("aaaaaaa").unwrap();
        log.write_line("bbbbbbb").unwrap();
        log.write_line("ccccccc").unwrap();

        let gen1 = std::fs::read_to_string(tmp.path().join("t.log.1")).unwrap();
        let gen2 = std::fs::read_to_string(tmp.path().join("t.log.2")).unwrap();
        assert_eq!(gen2, "aaaaaaa\n");
        assert_eq!(gen1, "bbbbbbb\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ccccccc\n");
    }
}
