//! Execution history, an indexed SQLite table in `history.db`.
//!
//! Retention is enforced on every insert: at most `maxEntriesPerJob` rows
//! per job, and nothing older than `retentionDays`. Executor tasks insert
//! concurrently; the busy timeout plus WAL mode make that safe without any
//! in-process coordination.

use crate::config::HistoryConfig;
use crate::error::{DaemonError, Result};
use crate::jobs::RunStatus;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A recorded execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub job_id: u64,
    pub job_name: Option<String>,
    pub command: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    pub error: Option<String>,
    /// Logical order: execution start as epoch milliseconds.
    pub timestamp: i64,
    pub created_at: DateTime<Utc>,
}

/// Row data for `append`; the store assigns `id`, `timestamp`, `createdAt`.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub job_id: u64,
    pub job_name: Option<String>,
    pub command: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters for `query`. `limit = 0` means no limit.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub job_id: Option<u64>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
    pub order: SortOrder,
}

pub struct HistoryStore {
    db_path: PathBuf,
    retention: HistoryConfig,
}

impl HistoryStore {
    pub fn new(db_path: PathBuf, retention: HistoryConfig) -> Self {
        Self { db_path, retention }
    }

    /// Insert a row, then apply both retention rules for the affected job
    /// inside the same transaction.
    pub fn append(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry> {
        let now = Utc::now();
        let timestamp = entry.start_time.timestamp_millis();

        let id = self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;

            tx.execute(
                "INSERT INTO history (
                    job_id, job_name, command, status, exit_code,
                    start_time, end_time, duration_ms, error, timestamp, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.job_id as i64,
                    entry.job_name,
                    entry.command,
                    entry.status.as_str(),
                    entry.exit_code,
                    entry.start_time.to_rfc3339(),
                    entry.end_time.to_rfc3339(),
                    entry.duration_ms,
                    entry.error,
                    timestamp,
                    now.to_rfc3339(),
                ],
            )?;
            let id = tx.last_insert_rowid();

            let keep = i64::try_from(self.retention.max_entries_per_job.max(1))
                .map_err(|_| DaemonError::Internal("maxEntriesPerJob overflows i64".into()))?;
            tx.execute(
                "DELETE FROM history
                 WHERE job_id = ?1
                   AND id NOT IN (
                     SELECT id FROM history
                     WHERE job_id = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2
                   )",
                params![entry.job_id as i64, keep],
            )?;

            let cutoff = now - chrono::Duration::days(i64::from(self.retention.retention_days));
            tx.execute(
                "DELETE FROM history WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )?;

            tx.commit()?;
            Ok(id)
        })?;

        Ok(HistoryEntry {
            id,
            job_id: entry.job_id,
            job_name: entry.job_name.clone(),
            command: entry.command.clone(),
            status: entry.status,
            exit_code: entry.exit_code,
            start_time: entry.start_time,
            end_time: entry.end_time,
            duration_ms: entry.duration_ms,
            error: entry.error.clone(),
            timestamp,
            created_at: now,
        })
    }

    pub fn query(&self, query: &HistoryQuery) -> Result<Vec<HistoryEntry>> {
        self.with_connection(|conn| {
            let mut sql = String::from(
                "SELECT id, job_id, job_name, command, status, exit_code,
                        start_time, end_time, duration_ms, error, timestamp, created_at
                 FROM history WHERE 1=1",
            );
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(job_id) = query.job_id {
                sql.push_str(" AND job_id = ?");
                args.push(Box::new(job_id as i64));
            }
            if let Some(status) = query.status {
                sql.push_str(" AND status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(since) = query.since {
                sql.push_str(" AND timestamp >= ?");
                args.push(Box::new(since.timestamp_millis()));
            }
            if let Some(until) = query.until {
                sql.push_str(" AND timestamp <= ?");
                args.push(Box::new(until.timestamp_millis()));
            }

            match query.order {
                SortOrder::Asc => sql.push_str(" ORDER BY timestamp ASC, id ASC"),
                SortOrder::Desc => sql.push_str(" ORDER BY timestamp DESC, id DESC"),
            }

            let limit = if query.limit == 0 {
                i64::MAX
            } else {
                query.limit as i64
            };
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(Box::new(limit));
            args.push(Box::new(query.offset as i64));

            let mut stmt = conn.prepare(&sql)?;
            let arg_refs: Vec<&dyn rusqlite::types::ToSql> =
                args.iter().map(|a| a.as_ref()).collect();
            let rows = stmt.query_map(arg_refs.as_slice(), map_history_row)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    /// Remove rows with `createdAt` before `instant`; returns count removed.
    pub fn clear_before(&self, instant: DateTime<Utc>) -> Result<usize> {
        self.with_connection(|conn| {
            let removed = conn.execute(
                "DELETE FROM history WHERE created_at < ?1",
                params![instant.to_rfc3339()],
            )?;
            Ok(removed)
        })
    }

    pub fn clear_job(&self, job_id: u64) -> Result<usize> {
        self.with_connection(|conn| {
            let removed = conn.execute(
                "DELETE FROM history WHERE job_id = ?1",
                params![job_id as i64],
            )?;
            Ok(removed)
        })
    }

    pub fn clear_all(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let removed = conn.execute("DELETE FROM history", [])?;
            Ok(removed)
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets CLI readers query while an executor task is inserting.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id      INTEGER NOT NULL,
                job_name    TEXT,
                command     TEXT NOT NULL,
                status      TEXT NOT NULL,
                exit_code   INTEGER,
                start_time  TEXT NOT NULL,
                end_time    TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                error       TEXT,
                timestamp   INTEGER NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_job_id ON history(job_id);
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);
            CREATE INDEX IF NOT EXISTS idx_history_job_timestamp ON history(job_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_history_status ON history(status);",
        )?;

        f(&conn)
    }
}

fn map_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let status_raw: String = row.get(4)?;
    let status = RunStatus::from_str(&status_raw).map_err(sql_conversion_error)?;
    let start_raw: String = row.get(6)?;
    let end_raw: String = row.get(7)?;
    let created_raw: String = row.get(11)?;

    Ok(HistoryEntry {
        id: row.get(0)?,
        job_id: row.get::<_, i64>(1)? as u64,
        job_name: row.get(2)?,
        command: row.get(3)?,
        status,
        exit_code: row.get(5)?,
        start_time: parse_rfc3339(&start_raw).map_err(sql_conversion_error)?,
        end_time: parse_rfc3339(&end_raw).map_err(sql_conversion_error)?,
        duration_ms: row.get(8)?,
        error: row.get(9)?,
        timestamp: row.get(10)?,
        created_at: parse_rfc3339(&created_raw).map_err(sql_conversion_error)?,
    })
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DaemonError::Internal(format!("invalid timestamp in history DB: {raw}: {e}")))
}

fn sql_conversion_error(err: DaemonError) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> HistoryStore {
        HistoryStore::new(tmp.path().join("history.db"), HistoryConfig::default())
    }

    fn entry(job_id: u64, status: RunStatus, start: DateTime<Utc>) -> NewHistoryEntry {
        NewHistoryEntry {
            job_id,
            job_name: None,
            command: "echo hi".into(),
            status,
            exit_code: if status.is_success() { Some(0) } else { Some(1) },
            start_time: start,
            end_time: start + chrono::Duration::milliseconds(25),
            duration_ms: 25,
            error: None,
        }
    }

    #[test]
    fn append_assigns_logical_order_from_start_time() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let start = Utc::now();

        let row = store.append(&entry(1, RunStatus::Success, start)).unwrap();
        assert_eq!(row.timestamp, start.timestamp_millis());
        assert_eq!(row.duration_ms, 25);
    }

    #[test]
    fn query_default_order_is_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let base = Utc::now();
        for i in 0..3 {
            store
                .append(&entry(1, RunStatus::Success, base + chrono::Duration::seconds(i)))
                .unwrap();
        }

        let rows = store.query(&HistoryQuery::default()).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].timestamp > rows[2].timestamp);

        let rows = store
            .query(&HistoryQuery {
                order: SortOrder::Asc,
                ..HistoryQuery::default()
            })
            .unwrap();
        assert!(rows[0].timestamp < rows[2].timestamp);
    }

    #[test]
    fn query_filters_by_job_status_and_window() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let base = Utc::now();
        store.append(&entry(1, RunStatus::Success, base)).unwrap();
        store
            .append(&entry(1, RunStatus::Failed, base + chrono::Duration::seconds(1)))
            .unwrap();
        store
            .append(&entry(2, RunStatus::Timeout, base + chrono::Duration::seconds(2)))
            .unwrap();

        let rows = store
            .query(&HistoryQuery {
                job_id: Some(1),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store
            .query(&HistoryQuery {
                status: Some(RunStatus::Timeout),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, 2);

        let rows = store
            .query(&HistoryQuery {
                since: Some(base + chrono::Duration::seconds(1)),
                until: Some(base + chrono::Duration::seconds(1)),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RunStatus::Failed);
    }

    #[test]
    fn limit_and_offset_paginate() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let base = Utc::now();
        for i in 0..5 {
            store
                .append(&entry(1, RunStatus::Success, base + chrono::Duration::seconds(i)))
                .unwrap();
        }

        let page = store
            .query(&HistoryQuery {
                limit: 2,
                offset: 2,
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].timestamp, (base + chrono::Duration::seconds(2)).timestamp_millis());
    }

    #[test]
    fn per_job_cap_prunes_oldest() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::new(
            tmp.path().join("history.db"),
            HistoryConfig {
                max_entries_per_job: 2,
                retention_days: 30,
            },
        );
        let base = Utc::now();
        for i in 0..4 {
            store
                .append(&entry(1, RunStatus::Success, base + chrono::Duration::seconds(i)))
                .unwrap();
        }
        // A second job is untouched by job 1's pruning.
        store.append(&entry(2, RunStatus::Success, base)).unwrap();

        let rows = store
            .query(&HistoryQuery {
                job_id: Some(1),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].timestamp,
            (base + chrono::Duration::seconds(3)).timestamp_millis()
        );
        assert_eq!(store.query(&HistoryQuery::default()).unwrap().len(), 3);
    }

    #[test]
    fn clear_operations_report_counts() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let base = Utc::now();
        store.append(&entry(1, RunStatus::Success, base)).unwrap();
        store.append(&entry(2, RunStatus::Failed, base)).unwrap();

        assert_eq!(store.clear_job(1).unwrap(), 1);
        assert_eq!(store.clear_before(Utc::now()).unwrap(), 1);
        assert_eq!(store.clear_all().unwrap(), 0);
    }
}
