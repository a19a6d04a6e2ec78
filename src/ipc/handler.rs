//! Maps wire requests onto scheduler/store/executor operations.

use crate::config::Config;
use crate::error::DaemonError;
use crate::executor::Executor;
use crate::ipc::protocol::{FlushCounts, Request, Response, RunOutcome, TagCount};
use crate::jobs::{HistoryStore, JobStatus};
use crate::joblog::JobLogs;
use crate::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// How long the `stop` reply gets to flush before shutdown begins.
const STOP_REPLY_GRACE: std::time::Duration = std::time::Duration::from_millis(100);

/// Everything a request handler can touch, wired together at daemon start.
pub struct DaemonContext {
    pub config: Config,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<Executor>,
    pub history: Arc<HistoryStore>,
    pub job_logs: Arc<JobLogs>,
    pub started_at: DateTime<Utc>,
    pub shutdown: watch::Sender<bool>,
}

impl DaemonContext {
    fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

pub fn error_response(err: &DaemonError) -> Response {
    let message = match err {
        // Internal detail goes to the log, not the wire.
        DaemonError::Internal(detail) => {
            tracing::error!("internal error while handling request: {detail}");
            "internal error".to_string()
        }
        other => other.to_string(),
    };
    Response::Error { message }
}

/// Handle every request except the streaming `job:run --wait` path, which
/// the server drives so chunks can be written as they arrive.
pub async fn handle_request(ctx: &DaemonContext, request: Request) -> Response {
    match handle_request_inner(ctx, request).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn handle_request_inner(
    ctx: &DaemonContext,
    request: Request,
) -> Result<Response, DaemonError> {
    match request {
        Request::Ping => Ok(Response::Pong),

        Request::Status => Ok(Response::Status {
            running: true,
            pid: std::process::id(),
            uptime_seconds: ctx.uptime_seconds(),
            stats: ctx.scheduler.stats(),
        }),

        Request::Stop => {
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                // Give the reply a moment to reach the client.
                tokio::time::sleep(STOP_REPLY_GRACE).await;
                let _ = shutdown.send(true);
            });
            Ok(Response::Stopped)
        }

        Request::JobAdd { job_data } => {
            let job = ctx.scheduler.add_job(&job_data)?;
            Ok(Response::JobAdded { job })
        }

        Request::JobList { filter } => {
            let jobs = ctx
                .scheduler
                .get_all_jobs()
                .into_iter()
                .filter(|j| filter.matches(j))
                .collect();
            Ok(Response::JobList { jobs })
        }

        Request::JobGet { job } => {
            let job = ctx.scheduler.get_job_by_ref(&job)?;
            Ok(Response::JobGet { job })
        }

        Request::JobRemove { job } => {
            let found = ctx.scheduler.get_job_by_ref(&job)?;
            ctx.scheduler.remove_job(found.id)?;
            Ok(Response::JobRemoved { id: found.id })
        }

        Request::JobUpdate { job, patch } => {
            let found = ctx.scheduler.get_job_by_ref(&job)?;
            let job = ctx.scheduler.update_job(found.id, &patch)?;
            Ok(Response::JobUpdated { job })
        }

        Request::JobPause { job } => {
            let found = ctx.scheduler.get_job_by_ref(&job)?;
            if found.status != JobStatus::Active {
                return Err(DaemonError::conflict(format!(
                    "job {} is {}, only active jobs can be paused",
                    found.label(),
                    found.status.as_str()
                )));
            }
            let job = ctx.scheduler.update_status(found.id, JobStatus::Paused)?;
            Ok(Response::JobPaused { job })
        }

        Request::JobResume { job } => {
            let found = ctx.scheduler.get_job_by_ref(&job)?;
            if found.status != JobStatus::Paused {
                return Err(DaemonError::conflict(format!(
                    "job {} is {}, only paused jobs can be resumed",
                    found.label(),
                    found.status.as_str()
                )));
            }
            let job = ctx.scheduler.update_status(found.id, JobStatus::Active)?;
            Ok(Response::JobResumed { job })
        }

        // wait:true is intercepted by the server; reaching here means fire
        // and forget.
        Request::JobRun { job, wait: _ } => {
            let found = ctx.scheduler.get_job_by_ref(&job)?;
            ctx.scheduler.execute_job(found.id)?;
            Ok(Response::JobRunResult {
                outcome: RunOutcome::queued(),
            })
        }

        Request::TagList => {
            let tags = ctx
                .scheduler
                .tag_list()
                .into_iter()
                .map(|(tag, count)| TagCount { tag, count })
                .collect();
            Ok(Response::TagList { tags })
        }

        Request::TagAdd { jobs, tags } => {
            let jobs = ctx.scheduler.tag_add(&jobs, &tags)?;
            Ok(Response::TagAdd {
                count: jobs.len(),
                jobs,
            })
        }

        Request::TagRemove { jobs, tags } => {
            let jobs = ctx.scheduler.tag_remove(jobs.as_deref(), &tags)?;
            Ok(Response::TagRemove {
                count: jobs.len(),
                jobs,
            })
        }

        Request::TagClear { jobs } => {
            let jobs = ctx.scheduler.tag_clear(jobs.as_deref())?;
            Ok(Response::TagClear {
                count: jobs.len(),
                jobs,
            })
        }

        Request::TagRename { from, to } => {
            let jobs = ctx.scheduler.tag_rename(&from, &to)?;
            Ok(Response::TagRename {
                count: jobs.len(),
                jobs,
            })
        }

        Request::Flush {
            jobs,
            logs,
            logs_age_ms,
            history,
            history_age_ms,
        } => {
            let mut counts = FlushCounts::default();
            if jobs {
                counts.jobs = ctx.scheduler.flush_completed_once()?;
            }
            if logs {
                counts.logs = ctx.job_logs.remove_older_than(logs_age_ms.unwrap_or(0))?;
            }
            if history {
                counts.history = match history_age_ms.unwrap_or(0) {
                    0 => ctx.history.clear_all()?,
                    age_ms => {
                        let cutoff = Utc::now() - chrono::Duration::milliseconds(age_ms as i64);
                        ctx.history.clear_before(cutoff)?
                    }
                };
            }
            Ok(Response::Flush { counts })
        }

        Request::ReloadJobs => {
            let count = ctx.scheduler.load()?;
            Ok(Response::ReloadJobs { count })
        }
    }
}
