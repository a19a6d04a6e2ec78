use thiserror::Error;

/// Error kinds visible at the protocol boundary.
///
/// Execution outcomes (non-zero exit, timeout, kill) are *values* carried in
/// an [`crate::executor::ExecutionResult`], never errors. A job failing is
/// the executor doing its work correctly.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Rejected input: invalid cron, bad name, both `cron` and `runAt`, etc.
    #[error("{0}")]
    Validation(String),

    /// Job lookup by id or name failed.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Daemon already running, job already in flight, concurrency cap hit.
    #[error("{0}")]
    Conflict(String),

    /// A durable file could not be read or written.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Anything we did not anticipate. Logged in full, reported generically.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(reference: impl Into<String>) -> Self {
        Self::NotFound(reference.into())
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

impl From<rusqlite::Error> for DaemonError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(format!("history database: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
