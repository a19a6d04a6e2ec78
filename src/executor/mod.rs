//! Runs one job's shell command: spawn, capture, enforce, record.
//!
//! Execution never fails through an error return. Whatever happens (spawn
//! failure, non-zero exit, timeout, stray signal) comes back as an
//! [`ExecutionResult`] so callers can treat a failing job as a normal
//! outcome. Every terminal result, including each retry attempt, lands in
//! the history store.

use crate::config::Config;
use crate::jobs::{HistoryStore, Job, NewHistoryEntry, RunStatus};
use crate::joblog::{JobLogs, LogLevel};
use crate::util::truncate_output;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{sleep, Duration};

/// Delay between retry attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(1);
/// Cap on captured output per stream; the per-job log always gets every line.
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of live output, delivered to an observer before process exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream: StreamKind,
    pub line: String,
}

pub type StreamSink = tokio::sync::mpsc::UnboundedSender<StreamChunk>;

/// Terminal outcome of an execution (or of the final retry attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Default)]
pub struct ExecOptions {
    /// Live observer for `job:run --wait`.
    pub on_stream: Option<StreamSink>,
}

pub struct Executor {
    config: Config,
    history: Arc<HistoryStore>,
    job_logs: Arc<JobLogs>,
}

impl Executor {
    pub fn new(config: Config, history: Arc<HistoryStore>, job_logs: Arc<JobLogs>) -> Self {
        Self {
            config,
            history,
            job_logs,
        }
    }

    pub fn job_logs(&self) -> &Arc<JobLogs> {
        &self.job_logs
    }

    /// Run the job up to `1 + job.retry` times, sleeping between attempts.
    /// Returns the first success or the final failure, with `attempts` set.
    pub async fn execute_with_retry(&self, job: &Job, opts: &ExecOptions) -> ExecutionResult {
        let total = job.retry.saturating_add(1);
        let mut attempt = 1;
        loop {
            let mut result = self.execute(job, opts).await;
            result.attempts = attempt;
            if result.status.is_success() || attempt >= total {
                return result;
            }
            tracing::info!(
                "job {} attempt {attempt}/{total} {}; retrying in {}s",
                job.label(),
                result.status.as_str(),
                RETRY_DELAY.as_secs()
            );
            attempt += 1;
            sleep(RETRY_DELAY).await;
        }
    }

    /// Run the job's command once and record a history row.
    pub async fn execute(&self, job: &Job, opts: &ExecOptions) -> ExecutionResult {
        let start_time = Utc::now();
        let result = self.spawn_and_wait(job, opts, start_time).await;
        self.record(job, &result);
        result
    }

    async fn spawn_and_wait(
        &self,
        job: &Job,
        opts: &ExecOptions,
        start_time: DateTime<Utc>,
    ) -> ExecutionResult {
        let (shell, shell_args) = match &job.shell {
            Some(shell) => (
                shell.clone(),
                self.config
                    .daemon
                    .shell_args
                    .clone()
                    .unwrap_or_else(|| vec!["-c".to_string()]),
            ),
            None => self.config.daemon.shell_invocation(),
        };

        let mut cmd = Command::new(&shell);
        cmd.args(&shell_args)
            .arg(&job.command)
            .envs(&job.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = job.cwd.as_ref().or(self.config.jobs.default_cwd.as_ref()) {
            cmd.current_dir(cwd);
        }
        // Own process group so a timeout kill reaches grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let end_time = Utc::now();
                return ExecutionResult {
                    status: RunStatus::Failed,
                    exit_code: None,
                    signal: None,
                    start_time,
                    end_time,
                    duration_ms: (end_time - start_time).num_milliseconds(),
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("failed to spawn '{shell}': {e}")),
                    attempts: 1,
                };
            }
        };

        let pgid = child.id().map(|pid| pid as i32);

        let stdout_task = self.spawn_reader(job, StreamKind::Stdout, child.stdout.take(), opts);
        let stderr_task = self.spawn_reader(job, StreamKind::Stderr, child.stderr.take(), opts);

        let mut timed_out = false;
        let wait_result = match job.timeout {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        timed_out = true;
                        self.kill_group(&mut child, pgid).await
                    }
                }
            }
            None => child.wait().await,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let end_time = Utc::now();
        let duration_ms = (end_time - start_time).num_milliseconds();

        let (status, exit_code, signal, error) = match wait_result {
            Err(e) => (
                RunStatus::Failed,
                None,
                None,
                Some(format!("failed to wait for child: {e}")),
            ),
            Ok(exit) => {
                if timed_out {
                    let limit = job.timeout.unwrap_or_default();
                    (
                        RunStatus::Timeout,
                        exit.code(),
                        exit_signal(&exit),
                        Some(format!("Job timed out after {limit} ms")),
                    )
                } else {
                    classify_exit(&exit)
                }
            }
        };

        ExecutionResult {
            status,
            exit_code,
            signal,
            start_time,
            end_time,
            duration_ms,
            stdout,
            stderr,
            error,
            attempts: 1,
        }
    }

    /// SIGTERM the whole group, give it a grace period, then SIGKILL.
    async fn kill_group(
        &self,
        child: &mut tokio::process::Child,
        pgid: Option<i32>,
    ) -> std::io::Result<std::process::ExitStatus> {
        signal_group(pgid, TERM_SIGNAL);
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                signal_group(pgid, KILL_SIGNAL);
                child.wait().await
            }
        }
    }

    fn spawn_reader<R>(
        &self,
        job: &Job,
        kind: StreamKind,
        pipe: Option<R>,
        opts: &ExecOptions,
    ) -> tokio::task::JoinHandle<String>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let job_id = job.id;
        let job_name = job.name.clone();
        let job_logs = Arc::clone(&self.job_logs);
        let sink = opts.on_stream.clone();

        tokio::spawn(async move {
            let Some(pipe) = pipe else {
                return String::new();
            };
            let level = match kind {
                StreamKind::Stdout => LogLevel::Info,
                StreamKind::Stderr => LogLevel::Error,
            };
            let mut captured = String::new();
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                job_logs.append(
                    job_id,
                    job_name.as_deref(),
                    level,
                    Some(kind.as_str()),
                    &line,
                );
                if let Some(sink) = &sink {
                    let _ = sink.send(StreamChunk {
                        stream: kind,
                        line: line.clone(),
                    });
                }
                if captured.len() <= MAX_CAPTURED_BYTES {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            truncate_output(&captured, MAX_CAPTURED_BYTES)
        })
    }

    /// History failures must not change the outcome we hand back.
    fn record(&self, job: &Job, result: &ExecutionResult) {
        let entry = NewHistoryEntry {
            job_id: job.id,
            job_name: job.name.clone(),
            command: job.command.clone(),
            status: result.status,
            exit_code: result.exit_code,
            start_time: result.start_time,
            end_time: result.end_time,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
        };
        if let Err(e) = self.history.append(&entry) {
            tracing::warn!("failed to record history for job {}: {e}", job.label());
        }
    }
}

fn classify_exit(
    exit: &std::process::ExitStatus,
) -> (RunStatus, Option<i32>, Option<i32>, Option<String>) {
    match exit.code() {
        Some(0) => (RunStatus::Success, Some(0), None, None),
        Some(code) => (
            RunStatus::Failed,
            Some(code),
            None,
            Some(format!("Process exited with code {code}")),
        ),
        None => {
            let signal = exit_signal(exit);
            let label = signal.map_or_else(|| "unknown".to_string(), |s| s.to_string());
            (
                RunStatus::Killed,
                None,
                signal,
                Some(format!("Job killed with signal {label}")),
            )
        }
    }
}

#[cfg(unix)]
const TERM_SIGNAL: i32 = libc::SIGTERM;
#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const TERM_SIGNAL: i32 = 15;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, signal: i32) {
    if let Some(pgid) = pgid {
        // The child was made its own group leader, so its pid is the pgid.
        unsafe {
            libc::killpg(pgid, signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, _signal: i32) {}

#[cfg(unix)]
fn exit_signal(exit: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    exit.signal()
}

#[cfg(not(unix))]
fn exit_signal(_exit: &std::process::ExitStatus) -> Option<i32> {
    None
}
