//! Cron evaluation and time-string parsing.
//!
//! Cron expressions use standard 5-field syntax (minute hour day month
//! weekday) or 6-field with a leading seconds column, always evaluated in
//! UTC. Occurrence computation is strictly-after: a reference instant that
//! falls exactly on a cron point yields the following one.

use crate::error::{DaemonError, Result};
use crate::jobs::{Job, JobKind, JobStatus};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Expand a 5-field expression to the 6-field form the `cron` crate expects.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {}", expr.trim())),
        6 => Ok(expr.trim().to_string()),
        n => Err(DaemonError::validation(format!(
            "invalid cron expression '{expr}': expected 5 or 6 fields, got {n}"
        ))),
    }
}

pub fn validate_cron(expr: &str) -> Result<()> {
    parse_cron(expr).map(|_| ())
}

fn parse_cron(expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| DaemonError::validation(format!("invalid cron expression '{expr}': {e}")))
}

/// First occurrence strictly after `after`, in UTC.
pub fn next_cron_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expr)?;
    Ok(schedule.after(&after).next())
}

/// Compute what `nextRun` should be for a job at rest.
///
/// Once-jobs keep their `runAt` even when it is already past; the due
/// detector or load-time reconciliation deals with that. Non-active jobs
/// have no next run.
pub fn next_run_for(job: &Job, reference: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if job.status != JobStatus::Active {
        return Ok(None);
    }
    match job.kind {
        JobKind::Once => Ok(job.run_at),
        JobKind::Cron => {
            let expr = job.cron.as_deref().ok_or_else(|| {
                DaemonError::Internal(format!("cron job {} has no expression", job.id))
            })?;
            next_cron_after(expr, reference)
        }
    }
}

/// Parse a human duration: "200ms", "30s", "5m", "2h", "1d".
///
/// A bare number is taken as milliseconds, matching the wire encoding of
/// timeouts. Returns the value in milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DaemonError::validation("duration must not be empty"));
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (num, unit) = input.split_at(split);
    let amount: u64 = num
        .parse()
        .map_err(|_| DaemonError::validation(format!("invalid duration '{input}'")))?;

    let ms = match unit.trim() {
        "" | "ms" => amount,
        "s" => amount.saturating_mul(1_000),
        "m" => amount.saturating_mul(60_000),
        "h" => amount.saturating_mul(3_600_000),
        "d" => amount.saturating_mul(86_400_000),
        other => {
            return Err(DaemonError::validation(format!(
                "unsupported duration unit '{other}', use ms/s/m/h/d"
            )))
        }
    };
    Ok(ms)
}

/// Parse a run-at instant: RFC 3339, or a `+<duration>` offset from `now`.
pub fn parse_run_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Some(rest) = input.strip_prefix('+') {
        let ms = parse_duration_ms(rest)?;
        return Ok(now + chrono::Duration::milliseconds(ms as i64));
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DaemonError::validation(format!("invalid timestamp '{input}': {e}")))
}

/// Serde adapter for optional millisecond durations that also accepts
/// human strings ("200ms", "30m") on the way in.
pub mod serde_opt_duration_ms {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Human(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u64>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ms) => ser.serialize_some(ms),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
        let raw = Option::<Raw>::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(Raw::Millis(ms)) => Ok(Some(ms)),
            Some(Raw::Human(s)) => super::parse_duration_ms(&s)
                .map(Some)
                .map_err(|e| D::Error::custom(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalize_prepends_seconds_field() {
        assert_eq!(normalize_cron("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(normalize_cron("0 9 * * 1-5").unwrap(), "0 0 9 * * 1-5");
        assert_eq!(
            normalize_cron("*/10 * * * * *").unwrap(),
            "*/10 * * * * *"
        );
    }

    #[test]
    fn normalize_rejects_wrong_field_count() {
        assert!(normalize_cron("* * *").is_err());
        assert!(normalize_cron("* * * * * * *").is_err());
    }

    #[test]
    fn validate_rejects_garbage() {
        assert!(validate_cron("not a cron").is_err());
        assert!(validate_cron("61 * * * *").is_err());
        assert!(validate_cron("*/5 * * * *").is_ok());
    }

    #[test]
    fn hourly_cron_at_last_millisecond_rolls_to_next_hour() {
        let reference = Utc
            .with_ymd_and_hms(2025, 3, 10, 14, 59, 59)
            .unwrap()
            .checked_add_signed(chrono::Duration::milliseconds(999))
            .unwrap();
        let next = next_cron_after("0 * * * *", reference).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap());
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let on_the_minute = Utc.with_ymd_and_hms(2025, 3, 10, 14, 5, 0).unwrap();
        let next = next_cron_after("* * * * *", on_the_minute).unwrap().unwrap();
        assert!(next > on_the_minute);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 14, 6, 0).unwrap());
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration_ms("200ms").unwrap(), 200);
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_duration_ms("2h").unwrap(), 7_200_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
        assert_eq!(parse_duration_ms("750").unwrap(), 750);
    }

    #[test]
    fn duration_rejects_unknown_unit() {
        assert!(parse_duration_ms("3w").is_err());
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("abc").is_err());
    }

    #[test]
    fn run_at_accepts_rfc3339_and_offsets() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_run_at("2025-06-02T08:30:00Z", now).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 8, 30, 0).unwrap()
        );
        assert_eq!(
            parse_run_at("+30m", now).unwrap(),
            now + chrono::Duration::minutes(30)
        );
        assert!(parse_run_at("tomorrow-ish", now).is_err());
    }
}
