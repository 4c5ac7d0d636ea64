//! Durable job record and its status machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned job identifier.
///
/// Backends assign this on first save (identity column in SQL, shared counter
/// in memory); a record carries `None` only before it has ever been saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Job execution status.
///
/// Stored by name (never by ordinal) so reordering variants can't corrupt
/// existing rows. `Canceling` is a request written by an external actor; the
/// runner observes it and moves the record to `Canceled`. `Interrupted` is
/// assigned during crash recovery when a run's outcome cannot be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Succeeded,
    Failed,
    TimedOut,
    Canceling,
    Canceled,
    Interrupted,
    FailedToLoadType,
}

impl JobStatus {
    /// Stable storage name for the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Canceling => "canceling",
            JobStatus::Canceled => "canceled",
            JobStatus::Interrupted => "interrupted",
            JobStatus::FailedToLoadType => "failed_to_load_type",
        }
    }

    /// A terminal record is never mutated again except for historical reads.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::TimedOut
                | JobStatus::Canceled
                | JobStatus::Interrupted
                | JobStatus::FailedToLoadType
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a stored status name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status: {0}")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "timed_out" => Ok(JobStatus::TimedOut),
            "canceling" => Ok(JobStatus::Canceling),
            "canceled" => Ok(JobStatus::Canceled),
            "interrupted" => Ok(JobStatus::Interrupted),
            "failed_to_load_type" => Ok(JobStatus::FailedToLoadType),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// Durable representation of one job instance.
///
/// Exactly one record exists per logical enqueue event; repeated firings of a
/// recurring schedule produce new records sharing `schedule_name`.
///
/// Field invariants:
/// - `id` is `None` only before the first save
/// - `start_date` is set when the record first leaves `Queued`
/// - `finish_date` is set only on a terminal status
/// - `exception` is set only on failure statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Option<JobId>,
    pub name: String,
    pub job_type: String,
    pub data: String,
    pub status: JobStatus,
    pub exception: Option<String>,
    pub queue_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub schedule_name: Option<String>,
}

impl JobRecord {
    /// Create a fresh `Queued` record for one enqueue event.
    pub fn queued(
        name: impl Into<String>,
        job_type: impl Into<String>,
        data: impl Into<String>,
        queue_date: DateTime<Utc>,
        schedule_name: Option<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            job_type: job_type.into(),
            data: data.into(),
            status: JobStatus::Queued,
            exception: None,
            queue_date,
            start_date: None,
            finish_date: None,
            schedule_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        let all = [
            JobStatus::Queued,
            JobStatus::Started,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Canceling,
            JobStatus::Canceled,
            JobStatus::Interrupted,
            JobStatus::FailedToLoadType,
        ];
        for status in all {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_name_is_rejected() {
        let err = "exploded".parse::<JobStatus>().unwrap_err();
        assert_eq!(err, ParseJobStatusError("exploded".to_string()));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
        assert!(!JobStatus::Canceling.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Interrupted.is_terminal());
        assert!(JobStatus::FailedToLoadType.is_terminal());
    }

    #[test]
    fn queued_record_starts_clean() {
        let record = JobRecord::queued(
            "Nightly cleanup",
            "cleanup",
            "{}",
            Utc::now(),
            Some("nightly".to_string()),
        );
        assert!(record.id.is_none());
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.start_date.is_none());
        assert!(record.finish_date.is_none());
        assert!(record.exception.is_none());
        assert_eq!(record.schedule_name.as_deref(), Some("nightly"));
    }
}
