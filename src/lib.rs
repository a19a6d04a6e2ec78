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
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps,
    clippy::unused_self
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod joblog;
pub mod jobs;
pub mod logging;
pub mod paths;
pub mod schedule;
pub mod scheduler;
pub(crate) mod util;

pub use config::Config;
pub use paths::Paths;

/// Tag management subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TagCommands {
    /// List all tags in use, with job counts
    List,
    /// Add tags to one or more jobs
    #[command(long_about = "\
Add tags to jobs.

Tags are lowercased and deduplicated. Jobs are referenced by id or name.

Examples:
  jobman tag add backup --job nightly --job 3
  jobman tag add infra monitoring --job 1")]
    Add {
        /// Tags to add
        #[arg(required = true)]
        tags: Vec<String>,
        /// Jobs to tag (id or name)
        #[arg(long = "job", required = true)]
        jobs: Vec<String>,
    },
    /// Remove tags from jobs (all jobs when none given)
    Remove {
        /// Tags to remove
        #[arg(required = true)]
        tags: Vec<String>,
        /// Jobs to untag (id or name); omit to touch every job
        #[arg(long = "job")]
        jobs: Vec<String>,
    },
    /// Clear every tag from jobs (all jobs when none given)
    Clear {
        /// Jobs to clear (id or name); omit to touch every job
        #[arg(long = "job")]
        jobs: Vec<String>,
    },
    /// Rename a tag across the whole catalogue
    Rename {
        /// Current tag name
        from: String,
        /// New tag name
        to: String,
    },
}
