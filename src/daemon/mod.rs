//! Daemon lifecycle: singleton enforcement, background detach, component
//! wiring, graceful shutdown.
//!
//! Startup order is executor → scheduler → IPC server; shutdown reverses
//! it, letting in-flight runs finish so their history rows are written.

use crate::config::Config;
use crate::executor::Executor;
use crate::ipc::handler::DaemonContext;
use crate::ipc::server;
use crate::jobs::{HistoryStore, JobStore};
use crate::joblog::JobLogs;
use crate::logging;
use crate::paths::Paths;
use crate::scheduler::Scheduler;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Set on the re-exec'd child so it logs to `daemon.log` instead of stderr.
pub const DAEMONIZED_ENV: &str = "JOBMAN_DAEMON_CHILD";

const START_WAIT: Duration = Duration::from_millis(100);
const START_WAIT_ROUNDS: u32 = 50;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// PID from `daemon.pid`, whether or not that process still exists.
pub fn read_pid(paths: &Paths) -> Option<u32> {
    std::fs::read_to_string(&paths.pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// PID of a live daemon, if any. A stale PID file does not count.
pub fn running_pid(paths: &Paths) -> Option<u32> {
    let pid = read_pid(paths)?;
    pid_alive(pid).then_some(pid)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

/// Entry point for `jobman start`. Foreground runs in-process; otherwise a
/// detached copy of this executable is spawned and verified.
pub async fn start(paths: &Paths, foreground: bool) -> Result<()> {
    if let Some(pid) = running_pid(paths) {
        bail!("daemon already running (pid {pid})");
    }
    if foreground {
        return run(paths.clone()).await;
    }
    spawn_detached(paths).await
}

async fn spawn_detached(paths: &Paths) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    std::process::Command::new(exe)
        .args(["start", "--foreground"])
        .env(DAEMONIZED_ENV, "1")
        // An explicit --data-dir must survive the re-exec.
        .env(crate::paths::DATA_DIR_ENV, &paths.data_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn daemon process")?;

    for _ in 0..START_WAIT_ROUNDS {
        tokio::time::sleep(START_WAIT).await;
        if let Some(pid) = running_pid(paths) {
            println!("daemon started (pid {pid})");
            return Ok(());
        }
    }
    bail!(
        "daemon did not come up within {}s; check {}",
        START_WAIT_ROUNDS * START_WAIT.as_millis() as u32 / 1000,
        paths.daemon_log.display()
    );
}

/// The daemon proper. Blocks until a termination signal or a `stop` request.
pub async fn run(paths: Paths) -> Result<()> {
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths.config_file)?;

    if std::env::var_os(DAEMONIZED_ENV).is_some() {
        logging::init_daemon(&config.logging, &paths.daemon_log)?;
    } else {
        logging::init_cli(&config.logging.level);
    }

    if let Some(pid) = running_pid(&paths) {
        bail!("daemon already running (pid {pid})");
    }
    std::fs::write(&paths.pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write PID file: {}", paths.pid_file.display()))?;
    tracing::info!(
        "jobman daemon starting (pid {}, data dir {})",
        std::process::id(),
        paths.data_dir.display()
    );

    // Whatever happens past this point, the PID file and socket come off
    // disk before the process exits.
    let outcome = serve(&paths, config).await;
    for file in [&paths.socket_path, &paths.pid_file] {
        if let Err(e) = std::fs::remove_file(file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {}: {e}", file.display());
            }
        }
    }
    match &outcome {
        Ok(()) => tracing::info!("daemon stopped"),
        Err(e) => tracing::error!("daemon failed: {e:#}"),
    }
    outcome
}

async fn serve(paths: &Paths, config: Config) -> Result<()> {
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
        Arc::clone(&job_logs),
    ));
    let scheduler = Scheduler::new(config.clone(), store, Arc::clone(&executor));
    scheduler.start()?;

    let listener = server::bind(&paths.socket_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(DaemonContext {
        config: config.clone(),
        scheduler: Arc::clone(&scheduler),
        executor,
        history,
        job_logs: Arc::clone(&job_logs),
        started_at: Utc::now(),
        shutdown: shutdown_tx.clone(),
    });
    let server_task = tokio::spawn(server::run(ctx, listener, shutdown_rx.clone()));
    let cleanup_task = spawn_cleanup(config, Arc::clone(&scheduler), job_logs);
    tracing::info!("listening on {}", paths.socket_path.display());

    wait_for_shutdown(shutdown_rx).await;

    tracing::info!("shutting down");
    scheduler.stop();
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    cleanup_task.abort();
    // Runs already in flight finish and record their history.
    scheduler.wait_for_idle().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    async fn recv(kind: SignalKind) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    }

    tokio::select! {
        () = recv(SignalKind::terminate()) => tracing::info!("received SIGTERM"),
        () = recv(SignalKind::interrupt()) => tracing::info!("received SIGINT"),
        _ = shutdown_flag(&mut shutdown_rx) => tracing::info!("stop requested over ipc"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received interrupt"),
        _ = shutdown_flag(&mut shutdown_rx) => tracing::info!("stop requested over ipc"),
    }
}

async fn shutdown_flag(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Hourly housekeeping: old completed once-jobs and stale per-job logs.
/// A retention of 0 days disables the corresponding sweep.
fn spawn_cleanup(
    config: Config,
    scheduler: Arc<Scheduler>,
    job_logs: Arc<JobLogs>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;

            let job_days = config.cleanup.completed_job_retention_days;
            if job_days > 0 {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(job_days));
                match scheduler.cleanup_completed_once(cutoff) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("cleanup: removed {n} completed once-jobs"),
                    Err(e) => tracing::warn!("cleanup of completed jobs failed: {e}"),
                }
            }

            let log_days = config.cleanup.log_retention_days;
            if log_days > 0 {
                let age_ms = u64::from(log_days) * 86_400_000;
                match job_logs.remove_older_than(age_ms) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("cleanup: removed {n} stale job logs"),
                    Err(e) => tracing::warn!("cleanup of job logs failed: {e}"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_data_dir(tmp.path().to_path_buf());

        assert_eq!(read_pid(&paths), None);
        std::fs::write(&paths.pid_file, "12345\n").unwrap();
        assert_eq!(read_pid(&paths), Some(12345));

        std::fs::write(&paths.pid_file, "not a pid").unwrap();
        assert_eq!(read_pid(&paths), None);
    }

    #[cfg(unix)]
    #[test]
    fn running_pid_requires_a_live_process() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_data_dir(tmp.path().to_path_buf());

        // Our own pid is alive by definition.
        std::fs::write(&paths.pid_file, format!("{}\n", std::process::id())).unwrap();
        assert_eq!(running_pid(&paths), Some(std::process::id()));

        // A stale file pointing at a reaped process does not count.
        let mut dead = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = dead.id();
        dead.wait().unwrap();
        std::fs::write(&paths.pid_file, format!("{dead_pid}\n")).unwrap();
        assert_eq!(running_pid(&paths), None);
    }

    #[tokio::test]
    async fn start_refuses_when_already_running() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_data_dir(tmp.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        std::fs::write(&paths.pid_file, format!("{}\n", std::process::id())).unwrap();

        let err = start(&paths, true).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }
}
