//! The durable job catalogue: a pretty-printed JSON array in `jobs.json`.
//!
//! Writes are write-then-rename so a crash mid-save can never leave a torn
//! file, and they are serialized behind a mutex so concurrent snapshot saves
//! from the scheduler and request handlers cannot interleave.

use crate::error::{DaemonError, Result};
use crate::jobs::{lookup_ref_is_numeric, Job};
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;

pub struct JobStore {
    jobs_file: PathBuf,
    write_lock: Mutex<()>,
}

impl JobStore {
    pub fn new(jobs_file: PathBuf) -> Self {
        Self {
            jobs_file,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.jobs_file
    }

    /// Load the catalogue in stored (insertion) order. A missing file is an
    /// empty catalogue, not an error.
    pub fn load(&self) -> Result<Vec<Job>> {
        let raw = match std::fs::read_to_string(&self.jobs_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let jobs: Vec<Job> = serde_json::from_str(&raw).map_err(|e| {
            DaemonError::Internal(format!(
                "corrupt jobs file {}: {e}",
                self.jobs_file.display()
            ))
        })?;
        Ok(jobs)
    }

    /// Atomically replace the catalogue with `jobs`.
    pub fn save(&self, jobs: &[Job]) -> Result<()> {
        let _guard = self.write_lock.lock();

        let dir = self
            .jobs_file
            .parent()
            .ok_or_else(|| DaemonError::Internal("jobs file has no parent directory".into()))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, jobs)?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.persist(&self.jobs_file)
            .map_err(|e| DaemonError::Io(e.error))?;
        Ok(())
    }

    pub fn get_by_id(&self, id: u64) -> Result<Option<Job>> {
        Ok(self.load()?.into_iter().find(|j| j.id == id))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Job>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|j| j.name.as_deref() == Some(name)))
    }

    /// Accepts a numeric id or a name; numeric-looking refs are tried as ids
    /// first and fall back to name lookup.
    pub fn get_by_ref(&self, reference: &str) -> Result<Option<Job>> {
        let jobs = self.load()?;
        Ok(find_by_ref(&jobs, reference).cloned())
    }
}

/// In-memory variant of the ref lookup, shared with the scheduler.
pub fn find_by_ref<'a>(jobs: &'a [Job], reference: &str) -> Option<&'a Job> {
    if lookup_ref_is_numeric(reference) {
        if let Ok(id) = reference.parse::<u64>() {
            if let Some(job) = jobs.iter().find(|j| j.id == id) {
                return Some(job);
            }
        }
    }
    jobs.iter().find(|j| j.name.as_deref() == Some(reference))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn job(id: u64, name: Option<&str>) -> Job {
        Job {
            id,
            name: name.map(Into::into),
            command: "echo hi".into(),
            kind: JobKind::Cron,
            cron: Some("* * * * *".into()),
            run_at: None,
            status: JobStatus::Active,
            tags: vec![],
            env: Default::default(),
            cwd: None,
            shell: None,
            timeout: None,
            retry: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            run_count: 0,
            retry_count: 0,
            last_run: None,
            last_result: None,
            last_exit_code: None,
            next_run: None,
            error: None,
            expired_at: None,
        }
    }

    fn store(tmp: &TempDir) -> JobStore {
        JobStore::new(tmp.path().join("jobs.json"))
    }

    #[test]
    fn missing_file_is_empty_catalogue() {
        let tmp = TempDir::new().unwrap();
        assert!(store(&tmp).load().unwrap().is_empty());
    }

    #[test]
    fn save_load_roundtrip_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let jobs = vec![job(1, Some("a")), job(2, None), job(3, Some("c"))];
        store.save(&jobs).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, jobs);
    }

    #[test]
    fn save_of_loaded_catalogue_is_identity_on_disk() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.save(&[job(1, Some("a")), job(2, None)]).unwrap();

        let first = std::fs::read_to_string(store.path()).unwrap();
        let loaded = store.load().unwrap();
        store.save(&loaded).unwrap();
        let second = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn file_is_pretty_printed_json() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.save(&[job(1, Some("a"))]).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.starts_with("[\n"), "expected pretty JSON, got: {raw}");
    }

    #[test]
    fn corrupt_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        std::fs::write(store.path(), "{definitely not an array").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn ref_lookup_prefers_id_then_name() {
        let jobs = vec![job(1, Some("nightly")), job(2, Some("weekly"))];
        assert_eq!(find_by_ref(&jobs, "2").unwrap().id, 2);
        assert_eq!(find_by_ref(&jobs, "nightly").unwrap().id, 1);
        assert!(find_by_ref(&jobs, "7").is_none());
        assert!(find_by_ref(&jobs, "missing").is_none());
    }

    #[test]
    fn store_level_lookups() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.save(&[job(1, Some("nightly"))]).unwrap();
        assert_eq!(store.get_by_id(1).unwrap().unwrap().id, 1);
        assert!(store.get_by_id(9).unwrap().is_none());
        assert_eq!(store.get_by_name("nightly").unwrap().unwrap().id, 1);
        assert_eq!(store.get_by_ref("1").unwrap().unwrap().id, 1);
    }
}
