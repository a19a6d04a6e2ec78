//! Wire message shapes. The `type` strings here are the protocol contract;
//! everything else rides on serde.

use crate::executor::{ExecutionResult, StreamKind};
use crate::jobs::{Job, JobDraft, JobKind, JobPatch, JobStatus};
use crate::scheduler::SchedulerStats;
use serde::{Deserialize, Serialize};

/// Optional `job:list` filter. The trigger-kind key is `jobType` because the
/// envelope already spends `type` on the message tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tag: Option<String>,
    pub job_type: Option<JobKind>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.map_or(true, |k| job.kind == k)
            && self
                .tag
                .as_ref()
                .map_or(true, |t| job.tags.iter().any(|jt| jt == t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "stop")]
    Stop,

    #[serde(rename = "job:add")]
    JobAdd {
        #[serde(rename = "jobData")]
        job_data: JobDraft,
    },
    #[serde(rename = "job:list")]
    JobList {
        #[serde(flatten)]
        filter: JobFilter,
    },
    #[serde(rename = "job:get")]
    JobGet { job: String },
    #[serde(rename = "job:remove")]
    JobRemove { job: String },
    #[serde(rename = "job:update")]
    JobUpdate { job: String, patch: JobPatch },
    #[serde(rename = "job:pause")]
    JobPause { job: String },
    #[serde(rename = "job:resume")]
    JobResume { job: String },
    #[serde(rename = "job:run")]
    JobRun {
        job: String,
        #[serde(default)]
        wait: bool,
    },

    #[serde(rename = "tag:list")]
    TagList,
    #[serde(rename = "tag:add")]
    TagAdd { jobs: Vec<String>, tags: Vec<String> },
    #[serde(rename = "tag:remove")]
    TagRemove {
        #[serde(default)]
        jobs: Option<Vec<String>>,
        tags: Vec<String>,
    },
    #[serde(rename = "tag:clear")]
    TagClear {
        #[serde(default)]
        jobs: Option<Vec<String>>,
    },
    #[serde(rename = "tag:rename")]
    TagRename { from: String, to: String },

    #[serde(rename = "flush")]
    Flush {
        #[serde(default)]
        jobs: bool,
        #[serde(default)]
        logs: bool,
        #[serde(rename = "logsAgeMs", default)]
        logs_age_ms: Option<u64>,
        #[serde(default)]
        history: bool,
        #[serde(rename = "historyAgeMs", default)]
        history_age_ms: Option<u64>,
    },
    #[serde(rename = "reload:jobs")]
    ReloadJobs,
}

/// Tag mutation result: how many jobs changed and which.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushCounts {
    pub jobs: usize,
    pub logs: usize,
    pub history: usize,
}

/// `job:run:result` payload: either a queued acknowledgement (fire and
/// forget) or the flattened terminal result of a waited run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Queued { status: QueuedMarker },
    Finished(ExecutionResult),
}

impl RunOutcome {
    pub fn queued() -> Self {
        Self::Queued {
            status: QueuedMarker::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedMarker {
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "status")]
    Status {
        running: bool,
        pid: u32,
        #[serde(rename = "uptimeSeconds")]
        uptime_seconds: u64,
        stats: SchedulerStats,
    },
    #[serde(rename = "stopped")]
    Stopped,

    #[serde(rename = "job:added")]
    JobAdded { job: Job },
    #[serde(rename = "job:list:result")]
    JobList { jobs: Vec<Job> },
    #[serde(rename = "job:get:result")]
    JobGet { job: Job },
    #[serde(rename = "job:removed")]
    JobRemoved { id: u64 },
    #[serde(rename = "job:updated")]
    JobUpdated { job: Job },
    #[serde(rename = "job:paused")]
    JobPaused { job: Job },
    #[serde(rename = "job:resumed")]
    JobResumed { job: Job },
    /// One live output line of a waited run; always precedes the terminal
    /// `job:run:result` on the same connection.
    #[serde(rename = "job:run:output")]
    JobRunOutput { stream: StreamKind, chunk: String },
    #[serde(rename = "job:run:result")]
    JobRunResult {
        #[serde(flatten)]
        outcome: RunOutcome,
    },

    #[serde(rename = "tag:list:result")]
    TagList { tags: Vec<TagCount> },
    #[serde(rename = "tag:add:result")]
    TagAdd { count: usize, jobs: Vec<u64> },
    #[serde(rename = "tag:remove:result")]
    TagRemove { count: usize, jobs: Vec<u64> },
    #[serde(rename = "tag:clear:result")]
    TagClear { count: usize, jobs: Vec<u64> },
    #[serde(rename = "tag:rename:result")]
    TagRename { count: usize, jobs: Vec<u64> },

    #[serde(rename = "flush:result")]
    Flush {
        #[serde(flatten)]
        counts: FlushCounts,
    },
    #[serde(rename = "reload:jobs:result")]
    ReloadJobs { count: usize },

    #[serde(rename = "error")]
    Error { message: String },
}
