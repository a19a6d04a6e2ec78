#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use jobman::config::Config;
use jobman::daemon;
use jobman::executor::StreamKind;
use jobman::ipc::client::{expect_ok, DaemonClient, NotRunning};
use jobman::ipc::protocol::{Request, Response, RunOutcome};
use jobman::jobs::{
    HistoryQuery, HistoryStore, Job, JobDraft, JobKind, JobPatch, JobStatus, JobStore, RunStatus,
    SortOrder,
};
use jobman::paths::Paths;
use jobman::schedule;
use jobman::TagCommands;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Exit code when `stop` finds no daemon to stop.
const EXIT_NOT_RUNNING: i32 = 3;

/// jobman - personal cron and one-shot job scheduler.
#[derive(Parser, Debug)]
#[command(name = "jobman")]
#[command(version)]
#[command(about = "Schedule shell commands by cron expression or one-shot time.", long_about = None)]
struct Cli {
    /// Data directory override (default: ~/.jobman, or $JOBMAN_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon (detached unless --foreground)
    #[command(long_about = "\
Start the scheduler daemon.

By default the daemon detaches into the background, writes its PID file \
and logs to daemon.log under the data directory. With --foreground it \
stays attached to the terminal and logs to stderr.

Examples:
  jobman start
  jobman start --foreground")]
    Start {
        /// Run in the foreground instead of detaching
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status and job statistics
    Status,

    /// Add a new job
    #[command(long_about = "\
Add a job. Exactly one trigger is required: --cron for a recurring job, \
--at (RFC 3339 or +offset) or --in (delay) for a one-shot.

Examples:
  jobman add 'make backup' --cron '0 3 * * *' --name nightly-backup
  jobman add 'say hello' --at 2025-06-01T09:00:00Z
  jobman add './deploy.sh' --in 30m --timeout 10m --retry 2
  jobman add 'env | sort' --env FOO=bar --tag infra")]
    Add {
        /// Shell command line to execute
        command: String,
        /// Cron expression (5 or 6 fields, UTC)
        #[arg(long)]
        cron: Option<String>,
        /// One-shot instant: RFC 3339 timestamp or +offset like +30m
        #[arg(long)]
        at: Option<String>,
        /// One-shot delay from now ("30m", "2h", "90s")
        #[arg(long = "in", value_name = "DURATION")]
        r#in: Option<String>,
        /// Unique job name ([A-Za-z0-9_-], not all digits)
        #[arg(long)]
        name: Option<String>,
        /// Tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Extra environment entries KEY=VALUE (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Shell override for this job
        #[arg(long)]
        shell: Option<String>,
        /// Kill the run after this long ("200ms", "5m")
        #[arg(long)]
        timeout: Option<String>,
        /// Retry count on failure (total attempts = retry + 1)
        #[arg(long)]
        retry: Option<u32>,
    },
    /// List jobs, optionally filtered
    List {
        /// Filter by status (active, paused, completed, failed)
        #[arg(long)]
        status: Option<String>,
        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,
        /// Filter by trigger kind (cron, once)
        #[arg(long = "type", value_name = "KIND")]
        job_type: Option<String>,
    },
    /// Show one job in full
    Get {
        /// Job id or name
        job: String,
    },
    /// Remove a job
    Remove {
        /// Job id or name
        job: String,
    },
    /// Update fields of an existing job
    #[command(long_about = "\
Update one or more fields. Setting --cron switches the job to recurring \
and clears its one-shot time; --at does the opposite.

Examples:
  jobman update nightly-backup --cron '0 4 * * *'
  jobman update 3 --command 'echo replaced' --retry 1")]
    Update {
        /// Job id or name
        job: String,
        /// New command line
        #[arg(long)]
        command: Option<String>,
        /// New cron expression
        #[arg(long)]
        cron: Option<String>,
        /// New one-shot instant (RFC 3339 or +offset)
        #[arg(long)]
        at: Option<String>,
        /// New job name
        #[arg(long)]
        name: Option<String>,
        /// Replace the tag set (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Replace environment entries KEY=VALUE (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,
        /// New working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// New shell override
        #[arg(long)]
        shell: Option<String>,
        /// New timeout
        #[arg(long)]
        timeout: Option<String>,
        /// New retry count
        #[arg(long)]
        retry: Option<u32>,
    },
    /// Pause an active job
    Pause {
        /// Job id or name
        job: String,
    },
    /// Resume a paused job
    Resume {
        /// Job id or name
        job: String,
    },
    /// Run a job immediately, bypassing its schedule
    Run {
        /// Job id or name
        job: String,
        /// Stay attached: stream output and report the result
        #[arg(long)]
        wait: bool,
    },
    /// Manage tags
    #[command(subcommand)]
    Tag(TagCommands),
    /// Show execution history (reads history.db directly)
    History {
        /// Only this job (id or name)
        #[arg(long)]
        job: Option<String>,
        /// Only this outcome (success, failed, timeout, killed)
        #[arg(long)]
        status: Option<String>,
        /// Maximum rows (0 = all)
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Rows to skip
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Oldest first instead of newest first
        #[arg(long)]
        asc: bool,
    },
    /// Print the tail of a job's log file
    Logs {
        /// Job id or name
        job: String,
        /// Number of trailing lines
        #[arg(long, default_value = "50")]
        lines: usize,
    },
    /// Remove completed once-jobs, old logs and/or history
    #[command(long_about = "\
Flush bookkeeping data. Pick categories explicitly or use --all. \
Cron jobs are never removed, only completed one-shots.

Examples:
  jobman flush --jobs
  jobman flush --all --yes
  jobman flush --history --history-age 7d")]
    Flush {
        /// Remove completed once-jobs
        #[arg(long)]
        jobs: bool,
        /// Remove per-job log files
        #[arg(long)]
        logs: bool,
        /// Only logs older than this ("7d"; default: all)
        #[arg(long, value_name = "DURATION")]
        logs_age: Option<String>,
        /// Prune history rows
        #[arg(long)]
        history: bool,
        /// Only history older than this ("30d"; default: all)
        #[arg(long, value_name = "DURATION")]
        history_age: Option<String>,
        /// Everything
        #[arg(long)]
        all: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Make the daemon re-read jobs.json
    Reload,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let paths = match cli.data_dir {
        Some(dir) => Paths::from_data_dir(dir),
        None => Paths::resolve()?,
    };
    let client = DaemonClient::new(&paths.socket_path);

    match cli.command {
        Commands::Start { foreground } => {
            daemon::start(&paths, foreground).await?;
            Ok(0)
        }

        Commands::Stop => match client.request(&Request::Stop).await {
            Ok(Response::Stopped) => {
                println!("daemon stopped");
                Ok(0)
            }
            Ok(other) => bail!("unexpected reply: {other:?}"),
            Err(e) if e.downcast_ref::<NotRunning>().is_some() => {
                eprintln!("daemon is not running");
                Ok(EXIT_NOT_RUNNING)
            }
            Err(e) => Err(e),
        },

        Commands::Status => match client.request(&Request::Status).await {
            Ok(response) => {
                let Response::Status {
                    running,
                    pid,
                    uptime_seconds,
                    stats,
                } = expect_ok(response)?
                else {
                    bail!("unexpected status reply");
                };
                println!("daemon:  {}", if running { "running" } else { "stopped" });
                println!("pid:     {pid}");
                println!("uptime:  {}", format_uptime(uptime_seconds));
                println!(
                    "jobs:    {} total ({} active, {} paused, {} completed, {} failed)",
                    stats.total, stats.active, stats.paused, stats.completed, stats.failed
                );
                println!(
                    "         {} cron, {} once | {} due, {} running",
                    stats.cron, stats.once, stats.due_count, stats.running_count
                );
                Ok(0)
            }
            Err(e) if e.downcast_ref::<NotRunning>().is_some() => {
                println!("daemon:  not running");
                Ok(1)
            }
            Err(e) => Err(e),
        },

        Commands::Add {
            command,
            cron,
            at,
            r#in,
            name,
            tags,
            env,
            cwd,
            shell,
            timeout,
            retry,
        } => {
            let now = Utc::now();
            let triggers = [cron.is_some(), at.is_some(), r#in.is_some()]
                .iter()
                .filter(|set| **set)
                .count();
            if triggers != 1 {
                bail!("exactly one of --cron, --at or --in is required");
            }
            let run_at = match (&at, &r#in) {
                (Some(at), _) => Some(schedule::parse_run_at(at, now)?),
                (None, Some(delay)) => {
                    let ms = schedule::parse_duration_ms(delay)?;
                    Some(now + chrono::Duration::milliseconds(ms as i64))
                }
                (None, None) => None,
            };

            let draft = JobDraft {
                command,
                name,
                cron,
                run_at,
                tags,
                env: parse_env_pairs(&env)?,
                cwd,
                shell,
                timeout: timeout
                    .as_deref()
                    .map(schedule::parse_duration_ms)
                    .transpose()?,
                retry,
            };

            let response = expect_ok(
                client
                    .request(&Request::JobAdd { job_data: draft })
                    .await?,
            )?;
            let Response::JobAdded { job } = response else {
                bail!("unexpected reply");
            };
            println!("✅ added job {} (id {})", job.label(), job.id);
            print_job(&job);
            Ok(0)
        }

        Commands::List {
            status,
            tag,
            job_type,
        } => {
            let filter = jobman::ipc::protocol::JobFilter {
                status: status.as_deref().map(JobStatus::from_str).transpose()?,
                tag,
                job_type: match job_type.as_deref() {
                    None => None,
                    Some("cron") => Some(JobKind::Cron),
                    Some("once") => Some(JobKind::Once),
                    Some(other) => bail!("unknown job type '{other}', use cron or once"),
                },
            };
            let response = expect_ok(client.request(&Request::JobList { filter }).await?)?;
            let Response::JobList { jobs } = response else {
                bail!("unexpected reply");
            };
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(0);
            }
            println!(
                "{:<4} {:<18} {:<5} {:<9} {:<20} {:<16} COMMAND",
                "ID", "NAME", "TYPE", "STATUS", "NEXT RUN", "TAGS"
            );
            for job in jobs {
                println!(
                    "{:<4} {:<18} {:<5} {:<9} {:<20} {:<16} {}",
                    job.id,
                    job.name.as_deref().unwrap_or("-"),
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.next_run.map_or_else(|| "-".to_string(), format_instant),
                    if job.tags.is_empty() {
                        "-".to_string()
                    } else {
                        job.tags.join(",")
                    },
                    job.command
                );
            }
            Ok(0)
        }

        Commands::Get { job } => {
            let response = expect_ok(client.request(&Request::JobGet { job }).await?)?;
            let Response::JobGet { job } = response else {
                bail!("unexpected reply");
            };
            print_job(&job);
            Ok(0)
        }

        Commands::Remove { job } => {
            let response = expect_ok(client.request(&Request::JobRemove { job }).await?)?;
            let Response::JobRemoved { id } = response else {
                bail!("unexpected reply");
            };
            println!("removed job {id}");
            Ok(0)
        }

        Commands::Update {
            job,
            command,
            cron,
            at,
            name,
            tags,
            env,
            cwd,
            shell,
            timeout,
            retry,
        } => {
            let run_at = at
                .as_deref()
                .map(|raw| schedule::parse_run_at(raw, Utc::now()))
                .transpose()?;
            let patch = JobPatch {
                command,
                name,
                cron,
                run_at,
                tags: if tags.is_empty() { None } else { Some(tags) },
                env: if env.is_empty() {
                    None
                } else {
                    Some(parse_env_pairs(&env)?)
                },
                cwd,
                shell,
                timeout: timeout
                    .as_deref()
                    .map(schedule::parse_duration_ms)
                    .transpose()?,
                retry,
            };
            if patch.is_empty() {
                bail!("nothing to update; pass at least one field flag");
            }
            let response = expect_ok(client.request(&Request::JobUpdate { job, patch }).await?)?;
            let Response::JobUpdated { job } = response else {
                bail!("unexpected reply");
            };
            println!("updated job {}", job.label());
            print_job(&job);
            Ok(0)
        }

        Commands::Pause { job } => {
            let response = expect_ok(client.request(&Request::JobPause { job }).await?)?;
            let Response::JobPaused { job } = response else {
                bail!("unexpected reply");
            };
            println!("⏸️  paused job {}", job.label());
            Ok(0)
        }

        Commands::Resume { job } => {
            let response = expect_ok(client.request(&Request::JobResume { job }).await?)?;
            let Response::JobResumed { job } = response else {
                bail!("unexpected reply");
            };
            println!(
                "▶️  resumed job {}, next run {}",
                job.label(),
                job.next_run.map_or_else(|| "-".to_string(), format_instant)
            );
            Ok(0)
        }

        Commands::Run { job, wait } => {
            if !wait {
                let response =
                    expect_ok(client.request(&Request::JobRun { job, wait }).await?)?;
                let Response::JobRunResult { .. } = response else {
                    bail!("unexpected reply");
                };
                println!("queued");
                return Ok(0);
            }

            let request = Request::JobRun { job, wait: true };
            let response = client
                .request_streaming(&request, |stream, line| match stream {
                    StreamKind::Stdout => println!("{line}"),
                    StreamKind::Stderr => eprintln!("{line}"),
                })
                .await?;
            let Response::JobRunResult {
                outcome: RunOutcome::Finished(result),
            } = expect_ok(response)?
            else {
                bail!("unexpected reply");
            };
            eprintln!(
                "-- {} (exit code {}, {} ms, {} attempt{})",
                result.status.as_str(),
                result
                    .exit_code
                    .map_or_else(|| "-".to_string(), |c| c.to_string()),
                result.duration_ms,
                result.attempts,
                if result.attempts == 1 { "" } else { "s" }
            );
            Ok(if result.status == RunStatus::Success { 0 } else { 1 })
        }

        Commands::Tag(tag_command) => {
            let request = match tag_command {
                TagCommands::List => Request::TagList,
                TagCommands::Add { tags, jobs } => Request::TagAdd { jobs, tags },
                TagCommands::Remove { tags, jobs } => Request::TagRemove {
                    jobs: if jobs.is_empty() { None } else { Some(jobs) },
                    tags,
                },
                TagCommands::Clear { jobs } => Request::TagClear {
                    jobs: if jobs.is_empty() { None } else { Some(jobs) },
                },
                TagCommands::Rename { from, to } => Request::TagRename { from, to },
            };
            match expect_ok(client.request(&request).await?)? {
                Response::TagList { tags } => {
                    if tags.is_empty() {
                        println!("no tags");
                    }
                    for entry in tags {
                        println!("{:<20} {} job(s)", entry.tag, entry.count);
                    }
                }
                Response::TagAdd { count, jobs }
                | Response::TagRemove { count, jobs }
                | Response::TagClear { count, jobs }
                | Response::TagRename { count, jobs } => {
                    println!("{count} job(s) affected: {jobs:?}");
                }
                other => bail!("unexpected reply: {other:?}"),
            }
            Ok(0)
        }

        Commands::History {
            job,
            status,
            limit,
            offset,
            asc,
        } => {
            let config = Config::load_or_default(&paths.config_file)?;
            let store = HistoryStore::new(paths.history_db.clone(), config.history);
            let job_id = match job {
                None => None,
                Some(reference) => Some(
                    JobStore::new(paths.jobs_file.clone())
                        .get_by_ref(&reference)?
                        .with_context(|| format!("job not found: {reference}"))?
                        .id,
                ),
            };

            let entries = store.query(&HistoryQuery {
                job_id,
                status: status.as_deref().map(RunStatus::from_str).transpose()?,
                since: None,
                until: None,
                limit,
                offset,
                order: if asc { SortOrder::Asc } else { SortOrder::Desc },
            })?;
            if entries.is_empty() {
                println!("no history");
                return Ok(0);
            }
            println!(
                "{:<6} {:<6} {:<18} {:<9} {:<5} {:<20} {:>8}  COMMAND",
                "ID", "JOB", "NAME", "STATUS", "EXIT", "STARTED", "MS"
            );
            for entry in entries {
                println!(
                    "{:<6} {:<6} {:<18} {:<9} {:<5} {:<20} {:>8}  {}",
                    entry.id,
                    entry.job_id,
                    entry.job_name.as_deref().unwrap_or("-"),
                    entry.status.as_str(),
                    entry
                        .exit_code
                        .map_or_else(|| "-".to_string(), |c| c.to_string()),
                    format_instant(entry.start_time),
                    entry.duration_ms,
                    entry.command
                );
            }
            Ok(0)
        }

        Commands::Logs { job, lines } => {
            let found = JobStore::new(paths.jobs_file.clone())
                .get_by_ref(&job)?
                .with_context(|| format!("job not found: {job}"))?;
            let log_path = paths.job_log_file(found.id, found.name.as_deref());
            let raw = match std::fs::read_to_string(&log_path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("no log yet for job {}", found.label());
                    return Ok(0);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to read {}", log_path.display()))
                }
            };
            let all: Vec<&str> = raw.lines().collect();
            let start = all.len().saturating_sub(lines);
            for line in &all[start..] {
                println!("{line}");
            }
            Ok(0)
        }

        Commands::Flush {
            jobs,
            logs,
            logs_age,
            history,
            history_age,
            all,
            yes,
        } => {
            let (jobs, logs, history) = if all {
                (true, true, true)
            } else {
                (jobs, logs, history)
            };
            if !(jobs || logs || history) {
                bail!("pick at least one of --jobs, --logs, --history (or --all)");
            }

            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt("This permanently deletes data. Continue?")
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("aborted");
                    return Ok(1);
                }
            }

            let request = Request::Flush {
                jobs,
                logs,
                logs_age_ms: logs_age
                    .as_deref()
                    .map(schedule::parse_duration_ms)
                    .transpose()?,
                history,
                history_age_ms: history_age
                    .as_deref()
                    .map(schedule::parse_duration_ms)
                    .transpose()?,
            };
            let Response::Flush { counts } = expect_ok(client.request(&request).await?)? else {
                bail!("unexpected reply");
            };
            println!(
                "flushed: {} job(s), {} log file(s), {} history row(s)",
                counts.jobs, counts.logs, counts.history
            );
            Ok(0)
        }

        Commands::Reload => {
            let Response::ReloadJobs { count } = expect_ok(client.request(&Request::ReloadJobs).await?)?
            else {
                bail!("unexpected reply");
            };
            println!("reloaded {count} job(s)");
            Ok(0)
        }
    }
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid --env '{pair}', expected KEY=VALUE"))?;
        if key.is_empty() {
            bail!("invalid --env '{pair}': empty variable name");
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

fn print_job(job: &Job) {
    println!("  id:        {}", job.id);
    if let Some(name) = &job.name {
        println!("  name:      {name}");
    }
    println!("  command:   {}", job.command);
    println!("  type:      {}", job.kind.as_str());
    if let Some(expr) = &job.cron {
        println!("  cron:      {expr}");
    }
    if let Some(at) = job.run_at {
        println!("  run at:    {}", format_instant(at));
    }
    println!("  status:    {}", job.status.as_str());
    if !job.tags.is_empty() {
        println!("  tags:      {}", job.tags.join(", "));
    }
    if let Some(cwd) = &job.cwd {
        println!("  cwd:       {}", cwd.display());
    }
    if let Some(shell) = &job.shell {
        println!("  shell:     {shell}");
    }
    if let Some(timeout) = job.timeout {
        println!("  timeout:   {timeout} ms");
    }
    if job.retry > 0 {
        println!("  retry:     {}", job.retry);
    }
    println!(
        "  next run:  {}",
        job.next_run.map_or_else(|| "-".to_string(), format_instant)
    );
    if let Some(last) = job.last_run {
        println!(
            "  last run:  {} ({}, exit {})",
            format_instant(last),
            job.last_result
                .map_or("-", |r| if r == jobman::jobs::LastResult::Success {
                    "success"
                } else {
                    "failed"
                }),
            job.last_exit_code
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        );
    }
    if let Some(error) = &job.error {
        println!("  error:     {error}");
    }
    println!("  runs:      {} ({} retries)", job.run_count, job.retry_count);
}
