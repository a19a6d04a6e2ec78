//! The local-socket request/response layer.
//!
//! Transport is a Unix-domain stream socket carrying one JSON object per
//! line (UTF-8, newline-delimited, no length prefix). Requests and
//! responses are tagged enums so the dispatcher is exhaustive while the
//! wire keeps the original `type`-string shape.

pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use handler::DaemonContext;
pub use protocol::{FlushCounts, JobFilter, Request, Response, RunOutcome, TagCount};
