//! End-to-end scheduling scenarios driven through the library: real stores,
//! real subprocesses, ticks issued by hand instead of wall time.

use chrono::Utc;
use jobman::config::Config;
use jobman::executor::Executor;
use jobman::jobs::{
    HistoryQuery, HistoryStore, JobDraft, JobStatus, JobStore, LastResult, RunStatus,
};
use jobman::joblog::JobLogs;
use jobman::paths::Paths;
use jobman::scheduler::Scheduler;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    scheduler: Arc<Scheduler>,
    history: Arc<HistoryStore>,
    paths: Paths,
}

fn fixture(tmp: &TempDir, config: Config) -> Fixture {
    let paths = Paths::from_data_dir(tmp.path().to_path_buf());
    paths.ensure_dirs().unwrap();
    let store = Arc::new(JobStore::new(paths.jobs_file.clone()));
    let history = Arc::new(HistoryStore::new(
        paths.history_db.clone(),
        config.history.clone(),
    ));
    let job_logs = Arc::new(JobLogs::new(
        paths.clone(),
        config.logging.max_file_size,
        config.logging.max_files,
    ));
    let executor = Arc::new(Executor::new(
        config.clone(),
        Arc::clone(&history),
        job_logs,
    ));
    let scheduler = Scheduler::new(config, store, executor);
    Fixture {
        scheduler,
        history,
        paths,
    }
}

#[tokio::test]
async fn due_cron_job_executes_and_logs() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(&tmp, Config::default());

    // Every-second cron so the test does not wait out a minute boundary.
    let job = f
        .scheduler
        .add_job(&JobDraft {
            command: "echo hi".into(),
            cron: Some("* * * * * *".into()),
            name: Some("hello".into()),
            ..JobDraft::default()
        })
        .unwrap();
    assert_eq!(job.id, 1);
    assert_eq!(job.status, JobStatus::Active);
    let lead = job.next_run.unwrap() - Utc::now();
    assert!(lead <= chrono::Duration::seconds(1));

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        f.scheduler.tick(Utc::now());
        f.scheduler.wait_for_idle().await;
        if !f.history.query(&HistoryQuery::default()).unwrap().is_empty() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "cron job never fired");
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }

    let rows = f.history.query(&HistoryQuery::default()).unwrap();
    assert_eq!(rows[0].status, RunStatus::Success);
    assert_eq!(rows[0].exit_code, Some(0));
    let drift =
        (rows[0].end_time - rows[0].start_time).num_milliseconds() - rows[0].duration_ms;
    assert!(drift.abs() <= 1);

    // After firing, the cron rhythm continues strictly in the future.
    let after = f.scheduler.get_job(job.id).unwrap();
    assert!(after.next_run.unwrap() > Utc::now() - chrono::Duration::seconds(1));

    let log = std::fs::read_to_string(f.paths.logs_dir.join("hello.log")).unwrap();
    assert!(log.lines().any(|l| l.ends_with("[stdout] hi")));
}

#[tokio::test]
async fn once_job_timeout_records_history_and_completes() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(&tmp, Config::default());

    let job = f
        .scheduler
        .add_job(&JobDraft {
            command: "sleep 2".into(),
            run_at: Some(Utc::now()),
            timeout: Some(200),
            ..JobDraft::default()
        })
        .unwrap();

    f.scheduler.tick(Utc::now());
    f.scheduler.wait_for_idle().await;

    let after = f.scheduler.get_job(job.id).unwrap();
    assert_eq!(after.status, JobStatus::Completed, "completion is about scheduling");
    assert_eq!(after.last_result, Some(LastResult::Failed));

    let rows = f.history.query(&HistoryQuery::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RunStatus::Timeout);
    assert_eq!(rows[0].exit_code, None);
    assert!(rows[0].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn retry_produces_one_history_row_per_attempt() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(&tmp, Config::default());

    let job = f
        .scheduler
        .add_job(&JobDraft {
            command: "exit 1".into(),
            run_at: Some(Utc::now()),
            retry: Some(2),
            ..JobDraft::default()
        })
        .unwrap();

    f.scheduler.tick(Utc::now());
    f.scheduler.wait_for_idle().await;

    let after = f.scheduler.get_job(job.id).unwrap();
    assert_eq!(after.run_count, 1);
    assert_eq!(after.retry_count, 2);
    assert_eq!(after.last_result, Some(LastResult::Failed));
    assert_eq!(after.last_exit_code, Some(1));

    let rows = f.history.query(&HistoryQuery::default()).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status == RunStatus::Failed));
}

#[tokio::test]
async fn expired_once_job_fails_on_load_without_executing() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(&tmp, Config::default());

    let marker = tmp.path().join("should-not-exist");
    f.scheduler
        .add_job(&JobDraft {
            command: format!("touch {}", marker.display()),
            run_at: Some(Utc::now() - chrono::Duration::hours(1)),
            ..JobDraft::default()
        })
        .unwrap();

    // A fresh scheduler over the same files simulates a daemon restart.
    let restarted = fixture(&tmp, Config::default());
    restarted.scheduler.load().unwrap();
    restarted.scheduler.tick(Utc::now());
    restarted.scheduler.wait_for_idle().await;

    let job = restarted.scheduler.get_job(1).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("expired"));
    assert!(!marker.exists(), "expired job must not run");
    assert!(restarted
        .history
        .query(&HistoryQuery::default())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn restart_after_downtime_coalesces_missed_cron_runs() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(&tmp, Config::default());

    f.scheduler
        .add_job(&JobDraft {
            command: "echo every5".into(),
            cron: Some("*/5 * * * *".into()),
            ..JobDraft::default()
        })
        .unwrap();

    // Simulate 17 minutes of downtime: rewrite the stored snapshot with a
    // stale nextRun, then start a fresh scheduler over it.
    let store = JobStore::new(f.paths.jobs_file.clone());
    let mut jobs = store.load().unwrap();
    jobs[0].next_run = Some(Utc::now() - chrono::Duration::minutes(17));
    store.save(&jobs).unwrap();

    let restarted = fixture(&tmp, Config::default());
    restarted.scheduler.load().unwrap();

    let job = restarted.scheduler.get_job(1).unwrap();
    let now = Utc::now();
    assert!(job.next_run.unwrap() > now, "recomputed strictly into the future");
    assert!(job.next_run.unwrap() <= now + chrono::Duration::minutes(5));

    // No backlog of catch-up executions.
    restarted.scheduler.tick(now);
    restarted.scheduler.wait_for_idle().await;
    assert_eq!(restarted.scheduler.get_job(1).unwrap().run_count, 0);
}

#[tokio::test]
async fn concurrency_cap_serializes_simultaneous_jobs() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.max_concurrent = 1;
    let f = fixture(&tmp, config);

    for i in 0..2 {
        f.scheduler
            .add_job(&JobDraft {
                command: format!("echo cap-{i}"),
                run_at: Some(Utc::now()),
                ..JobDraft::default()
            })
            .unwrap();
    }

    f.scheduler.tick(Utc::now());
    let completed_after_first_tick = f
        .scheduler
        .get_all_jobs()
        .iter()
        .filter(|j| j.status == JobStatus::Completed)
        .count();
    assert_eq!(completed_after_first_tick, 1, "cap admits exactly one");

    f.scheduler.wait_for_idle().await;
    f.scheduler.tick(Utc::now());
    f.scheduler.wait_for_idle().await;

    let rows = f.history.query(&HistoryQuery::default()).unwrap();
    assert_eq!(rows.len(), 2, "deferred job ran on a later tick");
}

#[tokio::test]
async fn jobs_file_is_the_authoritative_snapshot() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(&tmp, Config::default());

    f.scheduler
        .add_job(&JobDraft {
            command: "echo persist".into(),
            cron: Some("0 * * * *".into()),
            name: Some("persisted".into()),
            tags: vec!["Infra".into()],
            ..JobDraft::default()
        })
        .unwrap();

    let store = JobStore::new(f.paths.jobs_file.clone());
    let on_disk = store.load().unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].name.as_deref(), Some("persisted"));
    assert_eq!(on_disk[0].tags, vec!["infra".to_string()]);

    // saveJobs(listJobs()) is an identity on disk content.
    let raw_before = std::fs::read_to_string(&f.paths.jobs_file).unwrap();
    store.save(&on_disk).unwrap();
    let raw_after = std::fs::read_to_string(&f.paths.jobs_file).unwrap();
    assert_eq!(raw_before, raw_after);
}
