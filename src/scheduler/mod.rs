//! Clock-driven dispatch.
//!
//! The scheduler owns the in-memory job catalogue (a cache of `jobs.json`;
//! every mutation persists the full snapshot before returning) and a 1 s
//! tick that collects due jobs and fires them at the executor. Dispatch is
//! fire-and-forget: the tick never awaits an execution, each run gets its
//! own task that reports back through [`Scheduler::finish_run`].

use crate::config::Config;
use crate::error::{DaemonError, Result};
use crate::executor::{ExecOptions, ExecutionResult, Executor};
use crate::jobs::{
    find_by_ref, normalize_tags, Job, JobDraft, JobKind, JobPatch, JobStatus, JobStore, LastResult,
};
use crate::joblog::LogLevel;
use crate::schedule::{next_cron_after, next_run_for, validate_cron};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Fixed tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// A tick gap beyond this multiple of the interval means the host slept.
const WAKE_GAP_TICKS: i64 = 5;

const EXPIRED_ERROR: &str = "Job expired — daemon was not running at scheduled time";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cron: usize,
    pub once: usize,
    pub due_count: usize,
    pub running_count: usize,
}

struct SchedulerState {
    jobs: Vec<Job>,
    last_tick: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    config: Config,
    store: Arc<JobStore>,
    executor: Arc<Executor>,
    state: Mutex<SchedulerState>,
    running: Mutex<HashSet<u64>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: Config, store: Arc<JobStore>, executor: Arc<Executor>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            executor,
            state: Mutex::new(SchedulerState {
                jobs: Vec::new(),
                last_tick: None,
            }),
            running: Mutex::new(HashSet::new()),
            tick_task: Mutex::new(None),
        })
    }

    /// Load the catalogue, reconcile expired once-jobs, arm the tick loop.
    /// Idempotent: a second `start` on a running scheduler is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.tick_task.lock();
        if guard.is_some() {
            return Ok(());
        }
        self.load()?;

        let scheduler = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // A panicking tick must not stop the clock.
                let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    scheduler.tick(Utc::now());
                }));
                if pass.is_err() {
                    tracing::error!("scheduler tick panicked; continuing");
                }
            }
        }));
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Cease ticking. In-flight runs keep going; await them with
    /// [`Scheduler::wait_for_idle`]. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
            let state = self.state.lock();
            if let Err(e) = self.store.save(&state.jobs) {
                tracing::warn!("failed to persist jobs on stop: {e}");
            }
            tracing::info!("scheduler stopped");
        }
    }

    /// Resolve once every in-flight execution has reported back.
    pub async fn wait_for_idle(&self) {
        loop {
            if self.running.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Read the catalogue from disk, expire stale once-jobs, recompute every
    /// active job's `nextRun`, persist. Also the `reload:jobs` entry point.
    pub fn load(&self) -> Result<usize> {
        let now = Utc::now();
        let mut jobs = self.store.load()?;

        for job in &mut jobs {
            if job.kind == JobKind::Once
                && job.status == JobStatus::Active
                && job.run_at.is_some_and(|at| at < now)
            {
                job.status = JobStatus::Failed;
                job.last_result = Some(LastResult::Failed);
                job.error = Some(EXPIRED_ERROR.to_string());
                job.expired_at = Some(now);
                job.next_run = None;
                job.updated_at = now;
                tracing::warn!(
                    "once-job {} expired: scheduled for {}, loaded at {}",
                    job.label(),
                    job.run_at.map(|a| a.to_rfc3339()).unwrap_or_default(),
                    now.to_rfc3339()
                );
                continue;
            }
            job.next_run = next_run_for(job, now)?;
        }

        let count = jobs.len();
        self.store.save(&jobs)?;
        let mut state = self.state.lock();
        state.jobs = jobs;
        Ok(count)
    }

    /// One scheduling pass at `now`. Called by the tick loop; public so the
    /// tick semantics are testable without waiting on wall time.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        let due = {
            let mut state = self.state.lock();

            let woke = match state.last_tick {
                Some(last) => {
                    let gap = now - last;
                    gap > chrono::Duration::seconds(TICK_INTERVAL.as_secs() as i64 * WAKE_GAP_TICKS)
                }
                None => false,
            };
            if woke {
                tracing::warn!(
                    "wake detected: {}s since last tick, repairing stale schedules",
                    (now - state.last_tick.unwrap_or(now)).num_seconds()
                );
            }
            state.last_tick = Some(now);

            let mut dirty = false;

            // After a suspend the parked cron timers are recomputed forward:
            // occurrences missed while asleep never fire. Due jobs skipped by
            // the concurrency cap keep their past nextRun between normal
            // ticks, which is what re-offers them on the next pass.
            if woke {
                for job in &mut state.jobs {
                    if job.status == JobStatus::Active
                        && job.kind == JobKind::Cron
                        && job.next_run.is_some_and(|at| at < now)
                    {
                        match next_run_for(job, now) {
                            Ok(next) => {
                                job.next_run = next;
                                dirty = true;
                            }
                            Err(e) => tracing::error!(
                                "failed to repair schedule for job {}: {e}",
                                job.label()
                            ),
                        }
                    }
                }
            }

            let mut due = Vec::new();
            let max_concurrent = self.config.daemon.max_concurrent.max(1);

            let due_ids: Vec<u64> = state
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Active && j.next_run.is_some_and(|at| at <= now))
                .map(|j| j.id)
                .collect();

            enum Claim {
                Dispatch,
                Overrun,
                Deferred,
            }

            for id in due_ids {
                // Compare-and-insert under the running lock so a concurrent
                // manual run cannot slip past the cap.
                let claim = {
                    let mut running = self.running.lock();
                    if running.contains(&id) {
                        Claim::Overrun
                    } else if running.len() >= max_concurrent {
                        Claim::Deferred
                    } else {
                        running.insert(id);
                        Claim::Dispatch
                    }
                };

                match claim {
                    // A prior run still in flight: the occurrence is dropped,
                    // not queued.
                    Claim::Overrun => {
                        tracing::debug!("job {id} still running, skipping overrun");
                        self.advance_after_fire(&mut state, id, now);
                        dirty = true;
                    }
                    // Cap reached: leave nextRun in the past so the job stays
                    // due and is re-offered next tick.
                    Claim::Deferred => {
                        tracing::debug!("concurrency cap reached, deferring job {id}");
                    }
                    Claim::Dispatch => {
                        match state.jobs.iter().find(|j| j.id == id).cloned() {
                            Some(snapshot) => {
                                self.advance_after_fire(&mut state, id, now);
                                dirty = true;
                                due.push(snapshot);
                            }
                            None => {
                                self.running.lock().remove(&id);
                            }
                        }
                    }
                }
            }

            if dirty {
                if let Err(e) = self.store.save(&state.jobs) {
                    tracing::warn!("failed to persist jobs after tick: {e}");
                }
            }
            due
        };

        for job in due {
            self.dispatch(job);
        }
    }

    /// Re-plan a job that just fired (or whose overrun was dropped): once
    /// completes, cron advances strictly past both its original slot and
    /// `now` so missed occurrences coalesce into this single firing.
    fn advance_after_fire(&self, state: &mut SchedulerState, id: u64, now: DateTime<Utc>) {
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) else {
            return;
        };
        match job.kind {
            JobKind::Once => {
                job.status = JobStatus::Completed;
                job.next_run = None;
                job.updated_at = now;
            }
            JobKind::Cron => {
                let original = job.next_run.unwrap_or(now);
                let expr = job.cron.clone().unwrap_or_default();
                let mut next = next_cron_after(&expr, original).ok().flatten();
                while let Some(at) = next {
                    if at > now {
                        break;
                    }
                    next = next_cron_after(&expr, at).ok().flatten();
                }
                job.next_run = next;
                job.updated_at = now;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        let scheduler = Arc::clone(self);
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let logs = executor.job_logs();
            logs.append(
                job.id,
                job.name.as_deref(),
                LogLevel::Info,
                None,
                &format!("Job started: {}", job.command),
            );
            let result = executor.execute_with_retry(&job, &ExecOptions::default()).await;
            logs.append(
                job.id,
                job.name.as_deref(),
                if result.status.is_success() {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                },
                None,
                &format!(
                    "Job finished: {} (exit code {:?}, {} ms, attempt {})",
                    result.status.as_str(),
                    result.exit_code,
                    result.duration_ms,
                    result.attempts
                ),
            );
            scheduler.finish_run(job.id, &result);
        });
    }

    /// Record an execution's bookkeeping and free its concurrency slot.
    pub fn finish_run(&self, job_id: u64, result: &ExecutionResult) {
        {
            let mut state = self.state.lock();
            if let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) {
                job.run_count += 1;
                job.retry_count += u64::from(result.attempts.saturating_sub(1));
                job.last_run = Some(result.start_time);
                job.last_result = Some(if result.status.is_success() {
                    LastResult::Success
                } else {
                    LastResult::Failed
                });
                job.last_exit_code = result.exit_code;
                job.error = result.error.clone();
                job.updated_at = Utc::now();
            }
            if let Err(e) = self.store.save(&state.jobs) {
                tracing::warn!("failed to persist jobs after run: {e}");
            }
        }
        self.running.lock().remove(&job_id);
    }

    /// Reserve a concurrency slot for a manual run. Errors when the job is
    /// already in flight or the cap is exhausted.
    pub fn claim_slot(&self, job_id: u64) -> Result<()> {
        let mut running = self.running.lock();
        if running.contains(&job_id) {
            return Err(DaemonError::conflict(format!(
                "job {job_id} is already running"
            )));
        }
        if running.len() >= self.config.daemon.max_concurrent.max(1) {
            return Err(DaemonError::conflict("max concurrent jobs reached"));
        }
        running.insert(job_id);
        Ok(())
    }

    pub fn release_slot(&self, job_id: u64) {
        self.running.lock().remove(&job_id);
    }

    /// Manual dispatch, bypassing the schedule but not the concurrency cap.
    pub fn execute_job(self: &Arc<Self>, job_id: u64) -> Result<()> {
        let job = self
            .get_job(job_id)
            .ok_or_else(|| DaemonError::not_found(job_id.to_string()))?;
        self.claim_slot(job_id)?;
        self.dispatch(job);
        Ok(())
    }

    // ── Catalogue mutations ─────────────────────────────────────────

    pub fn add_job(&self, draft: &JobDraft) -> Result<Job> {
        let kind = draft.validate()?;
        let now = Utc::now();

        let mut state = self.state.lock();
        if let Some(name) = &draft.name {
            if state.jobs.iter().any(|j| j.name.as_deref() == Some(name)) {
                return Err(DaemonError::validation(format!(
                    "a job named '{name}' already exists"
                )));
            }
        }

        let id = state.jobs.iter().map(|j| j.id).max().unwrap_or(0) + 1;
        let mut job = Job {
            id,
            name: draft.name.clone(),
            command: draft.command.trim().to_string(),
            kind,
            cron: draft.cron.clone(),
            run_at: draft.run_at,
            status: JobStatus::Active,
            tags: normalize_tags(&draft.tags),
            env: draft.env.clone(),
            cwd: draft.cwd.clone().or_else(|| self.config.jobs.default_cwd.clone()),
            shell: draft.shell.clone(),
            timeout: draft.timeout.or(self.config.jobs.default_timeout),
            retry: draft.retry.unwrap_or(self.config.jobs.default_retry),
            created_at: now,
            updated_at: now,
            run_count: 0,
            retry_count: 0,
            last_run: None,
            last_result: None,
            last_exit_code: None,
            next_run: None,
            error: None,
            expired_at: None,
        };
        job.next_run = next_run_for(&job, now)?;

        state.jobs.push(job.clone());
        self.store.save(&state.jobs)?;
        tracing::info!("added job {} ({})", job.label(), job.kind.as_str());
        Ok(job)
    }

    pub fn update_job(&self, job_id: u64, patch: &JobPatch) -> Result<Job> {
        if patch.is_empty() {
            return Err(DaemonError::validation("update patch is empty"));
        }
        if patch.cron.is_some() && patch.run_at.is_some() {
            return Err(DaemonError::validation(
                "cron and runAt are mutually exclusive",
            ));
        }
        if let Some(expr) = &patch.cron {
            validate_cron(expr)?;
        }
        let now = Utc::now();

        let mut state = self.state.lock();
        if let Some(name) = &patch.name {
            crate::jobs::validate_name(name)?;
            if state
                .jobs
                .iter()
                .any(|j| j.id != job_id && j.name.as_deref() == Some(name))
            {
                return Err(DaemonError::validation(format!(
                    "a job named '{name}' already exists"
                )));
            }
        }

        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| DaemonError::not_found(job_id.to_string()))?;

        if let Some(command) = &patch.command {
            if command.trim().is_empty() {
                return Err(DaemonError::validation("command must not be empty"));
            }
            job.command = command.trim().to_string();
        }
        if let Some(name) = &patch.name {
            job.name = Some(name.clone());
        }
        // Switching trigger kind clears the other field.
        if let Some(expr) = &patch.cron {
            job.cron = Some(expr.clone());
            job.run_at = None;
            job.kind = JobKind::Cron;
        }
        if let Some(at) = patch.run_at {
            job.run_at = Some(at);
            job.cron = None;
            job.kind = JobKind::Once;
        }
        if let Some(tags) = &patch.tags {
            job.tags = normalize_tags(tags);
        }
        if let Some(env) = &patch.env {
            job.env = env.clone();
        }
        if let Some(cwd) = &patch.cwd {
            job.cwd = Some(cwd.clone());
        }
        if let Some(shell) = &patch.shell {
            job.shell = Some(shell.clone());
        }
        if let Some(timeout) = patch.timeout {
            job.timeout = Some(timeout);
        }
        if let Some(retry) = patch.retry {
            job.retry = retry;
        }
        job.updated_at = now;
        job.next_run = next_run_for(job, now)?;

        let updated = job.clone();
        self.store.save(&state.jobs)?;
        Ok(updated)
    }

    pub fn remove_job(&self, job_id: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != job_id);
        if state.jobs.len() == before {
            return Ok(false);
        }
        self.store.save(&state.jobs)?;
        tracing::info!("removed job {job_id}");
        Ok(true)
    }

    pub fn update_status(&self, job_id: u64, status: JobStatus) -> Result<Job> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| DaemonError::not_found(job_id.to_string()))?;

        job.status = status;
        job.updated_at = now;
        // Resume recomputes from now; any non-active state has no next run.
        job.next_run = next_run_for(job, now)?;

        let updated = job.clone();
        self.store.save(&state.jobs)?;
        Ok(updated)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get_all_jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.clone()
    }

    pub fn get_job(&self, job_id: u64) -> Option<Job> {
        self.state.lock().jobs.iter().find(|j| j.id == job_id).cloned()
    }

    pub fn get_job_by_ref(&self, reference: &str) -> Result<Job> {
        let state = self.state.lock();
        find_by_ref(&state.jobs, reference)
            .cloned()
            .ok_or_else(|| DaemonError::not_found(reference.to_string()))
    }

    pub fn stats(&self) -> SchedulerStats {
        let now = Utc::now();
        let state = self.state.lock();
        let running_count = self.running.lock().len();

        let mut stats = SchedulerStats {
            total: state.jobs.len(),
            running_count,
            ..SchedulerStats::default()
        };
        for job in &state.jobs {
            match job.status {
                JobStatus::Active => stats.active += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            match job.kind {
                JobKind::Cron => stats.cron += 1,
                JobKind::Once => stats.once += 1,
            }
            if job.status == JobStatus::Active && job.next_run.is_some_and(|at| at <= now) {
                stats.due_count += 1;
            }
        }
        stats
    }

    // ── Tag operations ──────────────────────────────────────────────

    pub fn tag_list(&self) -> Vec<(String, usize)> {
        let state = self.state.lock();
        let mut tags: Vec<(String, usize)> = Vec::new();
        for job in &state.jobs {
            for tag in &job.tags {
                match tags.iter_mut().find(|(t, _)| t == tag) {
                    Some((_, count)) => *count += 1,
                    None => tags.push((tag.clone(), 1)),
                }
            }
        }
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        tags
    }

    pub fn tag_add(&self, refs: &[String], tags: &[String]) -> Result<Vec<u64>> {
        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Err(DaemonError::validation("no tags given"));
        }
        self.mutate_tagged(Some(refs), |job| {
            let mut changed = false;
            for tag in &tags {
                if !job.tags.contains(tag) {
                    job.tags.push(tag.clone());
                    changed = true;
                }
            }
            changed
        })
    }

    pub fn tag_remove(&self, refs: Option<&[String]>, tags: &[String]) -> Result<Vec<u64>> {
        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Err(DaemonError::validation("no tags given"));
        }
        self.mutate_tagged(refs, |job| {
            let before = job.tags.len();
            job.tags.retain(|t| !tags.contains(t));
            job.tags.len() != before
        })
    }

    pub fn tag_clear(&self, refs: Option<&[String]>) -> Result<Vec<u64>> {
        self.mutate_tagged(refs, |job| {
            let had = !job.tags.is_empty();
            job.tags.clear();
            had
        })
    }

    pub fn tag_rename(&self, from: &str, to: &str) -> Result<Vec<u64>> {
        let from = from.trim().to_ascii_lowercase();
        let to = to.trim().to_ascii_lowercase();
        if from.is_empty() || to.is_empty() {
            return Err(DaemonError::validation("tag names must not be empty"));
        }
        self.mutate_tagged(None, |job| {
            if let Some(pos) = job.tags.iter().position(|t| *t == from) {
                if job.tags.contains(&to) {
                    job.tags.remove(pos);
                } else {
                    job.tags[pos] = to.clone();
                }
                true
            } else {
                false
            }
        })
    }

    /// Apply `f` to the referenced jobs (all jobs when `refs` is `None`),
    /// persist once, and return the ids `f` reported as changed.
    fn mutate_tagged(
        &self,
        refs: Option<&[String]>,
        mut f: impl FnMut(&mut Job) -> bool,
    ) -> Result<Vec<u64>> {
        let mut state = self.state.lock();

        let ids: Vec<u64> = match refs {
            None => state.jobs.iter().map(|j| j.id).collect(),
            Some(refs) => {
                let mut ids = Vec::new();
                for reference in refs {
                    let job = find_by_ref(&state.jobs, reference)
                        .ok_or_else(|| DaemonError::not_found(reference.clone()))?;
                    ids.push(job.id);
                }
                ids
            }
        };

        let now = Utc::now();
        let mut affected = Vec::new();
        for id in ids {
            if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
                if f(job) {
                    job.updated_at = now;
                    affected.push(id);
                }
            }
        }

        if !affected.is_empty() {
            self.store.save(&state.jobs)?;
        }
        Ok(affected)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Drop completed once-jobs from the catalogue (cron jobs are never
    /// flushed). Returns the number removed.
    pub fn flush_completed_once(&self) -> Result<usize> {
        self.remove_completed_once(None)
    }

    /// Drop completed once-jobs whose last update is older than `cutoff`.
    pub fn cleanup_completed_once(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.remove_completed_once(Some(cutoff))
    }

    fn remove_completed_once(&self, cutoff: Option<DateTime<Utc>>) -> Result<usize> {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|j| {
            let flushable = j.kind == JobKind::Once
                && j.status == JobStatus::Completed
                && cutoff.map_or(true, |c| j.updated_at < c);
            !flushable
        });
        let removed = before - state.jobs.len();
        if removed > 0 {
            self.store.save(&state.jobs)?;
        }
        Ok(removed)
    }
}
