//! Client side of the socket protocol, used by the CLI.

use crate::executor::StreamKind;
use crate::ipc::protocol::{Request, Response};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::Duration;

/// Unary requests time out quickly; a dead daemon should not hang the CLI.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DaemonClient {
    socket_path: PathBuf,
}

/// The daemon is not reachable on its socket. The CLI maps this to its
/// dedicated exit code on the `stop` path.
#[derive(Debug, thiserror::Error)]
#[error("daemon is not running")]
pub struct NotRunning;

impl DaemonClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|_| anyhow!(NotRunning))
    }

    /// One request, one response, bounded wait.
    pub async fn request(&self, request: &Request) -> Result<Response> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.request_unbounded(request))
            .await
            .context("daemon did not respond in time")?
    }

    async fn request_unbounded(&self, request: &Request) -> Result<Response> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, request).await?;

        let mut lines = BufReader::new(read_half).lines();
        let line = lines
            .next_line()
            .await?
            .context("daemon closed the connection without replying")?;
        Ok(serde_json::from_str(&line)
            .with_context(|| format!("unparseable response: {line}"))?)
    }

    /// `job:run --wait`: unbounded, invoking `on_chunk` for every output
    /// line until the terminal response arrives.
    pub async fn request_streaming(
        &self,
        request: &Request,
        mut on_chunk: impl FnMut(StreamKind, &str),
    ) -> Result<Response> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, request).await?;

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = lines
                .next_line()
                .await?
                .context("daemon closed the connection mid-stream")?;
            let response: Response = serde_json::from_str(&line)
                .with_context(|| format!("unparseable response: {line}"))?;
            match response {
                Response::JobRunOutput { stream, chunk } => on_chunk(stream, &chunk),
                terminal => return Ok(terminal),
            }
        }
    }

    /// True when something answers `ping` on the socket.
    pub async fn is_daemon_responsive(&self) -> bool {
        matches!(self.request(&Request::Ping).await, Ok(Response::Pong))
    }
}

/// A response that should have been `expected` but was the error sentinel
/// becomes a CLI error.
pub fn expect_ok(response: Response) -> Result<Response> {
    match response {
        Response::Error { message } => bail!("{message}"),
        other => Ok(other),
    }
}

async fn write_frame(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    request: &Request,
) -> Result<()> {
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_socket_is_not_running() {
        let tmp = TempDir::new().unwrap();
        let client = DaemonClient::new(&tmp.path().join("nope.sock"));
        let err = client.request(&Request::Ping).await.unwrap_err();
        assert!(err.downcast_ref::<NotRunning>().is_some());
        assert!(!client.is_daemon_responsive().await);
    }

    #[test]
    fn expect_ok_rejects_the_error_sentinel() {
        assert!(expect_ok(Response::Pong).is_ok());
        let err = expect_ok(Response::Error {
            message: "job not found: 9".into(),
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "job not found: 9");
    }
}
