//! Domain models for attachments, jobs, heartbeats and metrics.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extraction::ErrorKind;

/// Primary key of an attachment row.
pub type AttachmentId = i64;

/// Primary key of an extraction job row.
pub type JobId = i64;

// =============================================================================
// ATTACHMENTS
// =============================================================================

/// A document registered for text extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    /// Filesystem path of the stored document.
    pub path: String,
    /// Declared MIME type, if known.
    pub content_type: Option<String>,
    pub file_size: i64,
    /// Hex-encoded SHA-256 of the file contents.
    pub checksum: Option<String>,
    pub extracted_text: Option<String>,
    pub extraction_confidence: Option<f64>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to register a new attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAttachment {
    pub filename: String,
    pub path: String,
    pub content_type: Option<String>,
    pub file_size: i64,
    pub checksum: Option<String>,
}

// =============================================================================
// JOBS
// =============================================================================

/// Status of an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
    RetryPending,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::RetryPending,
        JobStatus::Complete,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::RetryPending => "retry_pending",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Queued or in flight. At most one active job per attachment exists
    /// when enqueues request de-duplication.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::RetryPending
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            "retry_pending" => Ok(JobStatus::RetryPending),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A queued unit of extraction work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub attachment_id: AttachmentId,
    pub status: JobStatus,
    /// Worker currently holding the claim.
    pub worker_id: Option<String>,
    /// Higher runs sooner.
    pub priority: i32,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a `retry_pending` job may be claimed again.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Outcome of a failed attempt, as decided by the queue's retry policy.
#[derive(Debug, Clone)]
pub struct FailureUpdate {
    /// Unit reporting the failure. The update only applies while it still
    /// owns the job.
    pub worker_id: String,
    /// Either `RetryPending` or `Failed`.
    pub status: JobStatus,
    pub retry_count: i32,
    pub error_message: String,
    pub error_kind: ErrorKind,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
}

/// A job joined with its latest metric and attachment name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    #[serde(flatten)]
    pub job: Job,
    pub filename: Option<String>,
    pub extraction_time_ms: Option<i64>,
    pub confidence: Option<f64>,
    pub error_kind: Option<ErrorKind>,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub retry_pending: i64,
    /// Row count per status name, including terminal states.
    pub totals: BTreeMap<String, i64>,
    /// Completions recorded in the metrics table over the last 24 hours.
    pub completed_24h: i64,
    /// Mean successful extraction time over the same window.
    pub avg_extraction_ms_24h: Option<f64>,
}

impl QueueStats {
    /// Jobs waiting to be claimed (pending plus retry_pending).
    pub fn queue_depth(&self) -> i64 {
        self.pending + self.retry_pending
    }
}

// =============================================================================
// WORKERS
// =============================================================================

/// Lifecycle state of a worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Processing,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(WorkerState::Starting),
            "idle" => Ok(WorkerState::Idle),
            "processing" => Ok(WorkerState::Processing),
            "stopping" => Ok(WorkerState::Stopping),
            "stopped" => Ok(WorkerState::Stopped),
            other => Err(format!("unknown worker state: {}", other)),
        }
    }
}

/// Persisted liveness record for one worker unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerState,
    pub current_job_id: Option<JobId>,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// METRICS
// =============================================================================

/// One finalized extraction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMetric {
    pub id: i64,
    pub job_id: JobId,
    pub attachment_id: AttachmentId,
    pub worker_id: Option<String>,
    pub extraction_time_ms: i64,
    pub confidence: Option<f64>,
    /// `complete`, `retry_pending` or `failed`.
    pub status: JobStatus,
    pub error_kind: Option<ErrorKind>,
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Aggregates over the metrics table for a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub completed: i64,
    pub retried: i64,
    pub failed: i64,
    pub avg_extraction_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_job_status_invalid() {
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_active_and_terminal_partition() {
        for status in JobStatus::ALL {
            assert_ne!(status.is_active(), status.is_terminal());
        }
        assert!(JobStatus::RetryPending.is_active());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_job_status_serde_matches_as_str() {
        for status in JobStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_worker_state_roundtrip() {
        for state in [
            WorkerState::Starting,
            WorkerState::Idle,
            WorkerState::Processing,
            WorkerState::Stopping,
            WorkerState::Stopped,
        ] {
            assert_eq!(state.to_string().parse::<WorkerState>().unwrap(), state);
        }
    }

    #[test]
    fn test_queue_depth() {
        let stats = QueueStats {
            pending: 3,
            processing: 2,
            retry_pending: 4,
            ..Default::default()
        };
        assert_eq!(stats.queue_depth(), 7);
    }
}
