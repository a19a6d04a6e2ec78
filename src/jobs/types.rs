use crate::error::{DaemonError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Which scheduling field drives the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Cron,
    Once,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Once => "once",
        }
    }
}

/// Scheduling state, not execution outcome: a once-job that ran and failed
/// is still `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DaemonError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Outcome of the most recent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastResult {
    Success,
    Failed,
}

/// Terminal status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Timeout,
    Killed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "killed" => Ok(Self::Killed),
            other => Err(DaemonError::validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// A scheduled job as stored in `jobs.json` and sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(
        default,
        with = "crate::schedule::serde_opt_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub retry_count: u64,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<LastResult>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Display handle: the name when present, `#<id>` otherwise.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

/// Input shape for `job:add` (`jobData` on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobDraft {
    pub command: String,
    pub name: Option<String>,
    pub cron: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub shell: Option<String>,
    #[serde(with = "crate::schedule::serde_opt_duration_ms")]
    pub timeout: Option<u64>,
    pub retry: Option<u32>,
}

impl JobDraft {
    /// Validate everything that does not need the catalogue (uniqueness is
    /// the scheduler's job).
    pub fn validate(&self) -> Result<JobKind> {
        if self.command.trim().is_empty() {
            return Err(DaemonError::validation("command must not be empty"));
        }
        let kind = match (&self.cron, &self.run_at) {
            (Some(_), Some(_)) => {
                return Err(DaemonError::validation(
                    "cron and runAt are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(DaemonError::validation(
                    "either cron or runAt must be set",
                ))
            }
            (Some(expr), None) => {
                crate::schedule::validate_cron(expr)?;
                JobKind::Cron
            }
            (None, Some(_)) => JobKind::Once,
        };
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        Ok(kind)
    }
}

/// Partial update for `job:update`. Setting `cron` clears `runAt` and the
/// other way around; sending both is rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPatch {
    pub command: Option<String>,
    pub name: Option<String>,
    pub cron: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub cwd: Option<PathBuf>,
    pub shell: Option<String>,
    #[serde(with = "crate::schedule::serde_opt_duration_ms")]
    pub timeout: Option<u64>,
    pub retry: Option<u32>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.command.is_none()
            && self.name.is_none()
            && self.cron.is_none()
            && self.run_at.is_none()
            && self.tags.is_none()
            && self.env.is_none()
            && self.cwd.is_none()
            && self.shell.is_none()
            && self.timeout.is_none()
            && self.retry.is_none()
    }
}

/// Job names must be safe as log-file stems and must never shadow an id.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DaemonError::validation("name must not be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DaemonError::validation(format!(
            "invalid name '{name}': only letters, digits, '_' and '-' are allowed"
        )));
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(DaemonError::validation(format!(
            "invalid name '{name}': an all-digit name would collide with id lookup"
        )));
    }
    Ok(())
}

/// Whether a job reference string should be tried as an id first.
pub fn lookup_ref_is_numeric(reference: &str) -> bool {
    !reference.is_empty() && reference.chars().all(|c| c.is_ascii_digit())
}

/// Normalize a tag set: lowercase, drop empties, dedup preserving first
/// occurrence.
pub(crate) fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_ascii_lowercase();
        if !tag.is_empty() && !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron_draft() -> JobDraft {
        JobDraft {
            command: "echo hi".into(),
            cron: Some("* * * * *".into()),
            ..JobDraft::default()
        }
    }

    #[test]
    fn draft_requires_exactly_one_trigger() {
        let mut both = cron_draft();
        both.run_at = Some(Utc::now());
        assert!(both.validate().is_err());

        let neither = JobDraft {
            command: "echo hi".into(),
            ..JobDraft::default()
        };
        assert!(neither.validate().is_err());

        assert_eq!(cron_draft().validate().unwrap(), JobKind::Cron);
    }

    #[test]
    fn draft_rejects_empty_command() {
        let mut draft = cron_draft();
        draft.command = "   ".into();
        assert!(draft.validate().is_err());
    }

    #[test]
    fn draft_rejects_bad_cron() {
        let mut draft = cron_draft();
        draft.cron = Some("99 * * * *".into());
        assert!(draft.validate().is_err());
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("backup-daily_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("semi;colon").is_err());
        // All digits collides with id lookup.
        assert!(validate_name("12345").is_err());
        assert!(validate_name("12345x").is_ok());
    }

    #[test]
    fn numeric_ref_detection() {
        assert!(lookup_ref_is_numeric("42"));
        assert!(!lookup_ref_is_numeric("42x"));
        assert!(!lookup_ref_is_numeric(""));
    }

    #[test]
    fn tags_are_lowercased_and_deduped() {
        let tags = normalize_tags(&[
            "Backup".into(),
            "backup".into(),
            "  NIGHTLY ".into(),
            "".into(),
        ]);
        assert_eq!(tags, vec!["backup".to_string(), "nightly".to_string()]);
    }

    #[test]
    fn job_wire_shape_is_camel_case() {
        let job = Job {
            id: 1,
            name: Some("demo".into()),
            command: "echo hi".into(),
            kind: JobKind::Cron,
            cron: Some("* * * * *".into()),
            run_at: None,
            status: JobStatus::Active,
            tags: vec![],
            env: BTreeMap::new(),
            cwd: None,
            shell: None,
            timeout: Some(1500),
            retry: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            run_count: 0,
            retry_count: 0,
            last_run: None,
            last_result: None,
            last_exit_code: None,
            next_run: None,
            error: None,
            expired_at: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "cron");
        assert_eq!(value["status"], "active");
        assert_eq!(value["timeout"], 1500);
        assert!(value.get("runAt").is_none());
        assert!(value.get("lastRun").is_some(), "bookkeeping stays explicit");
    }

    #[test]
    fn draft_accepts_human_timeout() {
        let draft: JobDraft =
            serde_json::from_str(r#"{"command":"sleep 2","runAt":"2030-01-01T00:00:00Z","timeout":"200ms"}"#)
                .unwrap();
        assert_eq!(draft.timeout, Some(200));
        assert_eq!(draft.validate().unwrap(), JobKind::Once);
    }
}
