//! Accepts client connections and frames the request/response traffic.
//!
//! One task per connection; within a connection requests are handled
//! sequentially so responses keep arrival order and a streaming run's
//! chunks always precede its terminal `job:run:result`.

use crate::error::DaemonError;
use crate::executor::ExecOptions;
use crate::ipc::handler::{self, DaemonContext};
use crate::ipc::protocol::{Request, Response, RunOutcome};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

/// Bind the socket, removing a stale file from a previous daemon first.
pub fn bind(socket_path: &std::path::Path) -> Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket: {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind socket: {}", socket_path.display()))
}

/// Accept loop. Returns when the shutdown flag flips; open connections are
/// dropped at that point, in-flight job executions are not.
pub async fn run(
    ctx: Arc<DaemonContext>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("ipc server shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.context("accept failed")?;
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, stream).await {
                        tracing::debug!("connection closed with error: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_connection(ctx: Arc<DaemonContext>, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                write_response(
                    &mut write_half,
                    &Response::Error {
                        message: format!("malformed request: {e}"),
                    },
                )
                .await?;
                continue;
            }
        };

        match request {
            Request::JobRun { job, wait: true } => {
                handle_streaming_run(&ctx, &mut write_half, &job).await?;
            }
            request => {
                let is_stop = matches!(request, Request::Stop);
                let (response, panicked) = run_isolated(Arc::clone(&ctx), request).await;
                write_response(&mut write_half, &response).await?;
                if panicked {
                    // A panicked handler gets its error reply, then the
                    // connection is closed rather than trusted further.
                    return Ok(());
                }
                if is_stop {
                    // The daemon is about to shut down; nothing more to read.
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Run the handler in its own task so a panic poisons only this connection,
/// not the daemon. The flag tells the caller to hang up afterwards.
async fn run_isolated(ctx: Arc<DaemonContext>, request: Request) -> (Response, bool) {
    let handle = tokio::spawn(async move { handler::handle_request(&ctx, request).await });
    match handle.await {
        Ok(response) => (response, false),
        Err(e) if e.is_panic() => {
            tracing::error!("request handler panicked");
            (
                Response::Error {
                    message: "internal error".to_string(),
                },
                true,
            )
        }
        Err(_) => (
            Response::Error {
                message: "request cancelled".to_string(),
            },
            false,
        ),
    }
}

/// `job:run` with `wait:true`: claim a slot, execute inline, forwarding
/// each output line to the client before the terminal result.
async fn handle_streaming_run(
    ctx: &Arc<DaemonContext>,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    reference: &str,
) -> Result<()> {
    let job = match ctx.scheduler.get_job_by_ref(reference) {
        Ok(job) => job,
        Err(e) => {
            return write_response(write_half, &handler::error_response(&e)).await;
        }
    };
    if let Err(e) = ctx.scheduler.claim_slot(job.id) {
        return write_response(write_half, &handler::error_response(&e)).await;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let executor = Arc::clone(&ctx.executor);
    let job_for_exec = job.clone();
    let exec_task = tokio::spawn(async move {
        let opts = ExecOptions {
            on_stream: Some(tx),
        };
        executor.execute_with_retry(&job_for_exec, &opts).await
    });

    // The sender lives inside the executor task; this loop ends when the
    // process is done and the channel closes.
    let mut client_gone = false;
    while let Some(chunk) = rx.recv().await {
        if client_gone {
            continue;
        }
        let response = Response::JobRunOutput {
            stream: chunk.stream,
            chunk: chunk.line,
        };
        // A client that hung up mid-stream aborts delivery, not the run.
        if write_response(write_half, &response).await.is_err() {
            client_gone = true;
        }
    }

    match exec_task.await {
        Ok(result) => {
            ctx.scheduler.finish_run(job.id, &result);
            if !client_gone {
                write_response(
                    write_half,
                    &Response::JobRunResult {
                        outcome: RunOutcome::Finished(result),
                    },
                )
                .await?;
            }
        }
        Err(e) => {
            ctx.scheduler.release_slot(job.id);
            tracing::error!("execution task failed for job {}: {e}", job.label());
            if !client_gone {
                let err = DaemonError::Internal(format!("execution task failed: {e}"));
                write_response(write_half, &handler::error_response(&err)).await?;
            }
        }
    }
    Ok(())
}

async fn write_response(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    Ok(())
}
