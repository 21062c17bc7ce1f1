//! Repository and extractor traits.
//!
//! The durable store implements the repository traits in `lectern-db`; the
//! worker pool consumes extractors through [`Extractor`].

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Attachment, AttachmentId, Extraction, ExtractionError, ExtractionMetric, FailureUpdate, Job,
    JobHistoryEntry, JobId, JobStatus, MetricsSummary, NewAttachment, QueueStats, Result,
    WorkerHeartbeat,
};

// =============================================================================
// ATTACHMENT REPOSITORY TRAITS
// =============================================================================

/// Repository for attachment records.
#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    /// Insert a new attachment row.
    async fn insert(&self, attachment: NewAttachment) -> Result<Attachment>;

    /// Register a file from disk, computing size, checksum and content type.
    /// Returns the existing row when the path is already registered.
    async fn register_file(&self, path: &Path) -> Result<Attachment>;

    /// Get attachment by ID.
    async fn get(&self, id: AttachmentId) -> Result<Option<Attachment>>;

    /// Check whether an attachment exists.
    async fn exists(&self, id: AttachmentId) -> Result<bool>;

    /// Store extracted text and confidence.
    async fn update_extraction(&self, id: AttachmentId, text: &str, confidence: f64)
        -> Result<()>;

    /// List attachments that have no extracted text yet.
    async fn list_unextracted(&self, limit: i64) -> Result<Vec<Attachment>>;
}

// =============================================================================
// JOB REPOSITORY TRAITS
// =============================================================================

/// Repository for extraction job rows.
///
/// Every state transition is a single guarded statement (or a short
/// transaction that starts with one), so concurrent callers never both win.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a pending job.
    async fn insert(&self, attachment_id: AttachmentId, priority: i32) -> Result<Job>;

    /// Insert a pending job unless an active job exists for the attachment.
    async fn insert_deduplicated(
        &self,
        attachment_id: AttachmentId,
        priority: i32,
    ) -> Result<Option<Job>>;

    /// Claim the best `retry_pending` job whose retry time has passed.
    async fn claim_retry(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Claim the best `pending` job.
    async fn claim_pending(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Mark a job complete and record its metric, provided `worker_id`
    /// still owns it.
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        elapsed_ms: i64,
        confidence: Option<f64>,
    ) -> Result<Option<Job>>;

    /// Apply a failure decision to a processing job and record its metric.
    ///
    /// Guarded on the reporting owner and on the retry count observed when
    /// the decision was made.
    async fn record_failure(
        &self,
        job_id: JobId,
        expected_retry_count: i32,
        update: &FailureUpdate,
    ) -> Result<Option<Job>>;

    /// Return a processing job to pending without touching retry state.
    async fn release(&self, job_id: JobId) -> Result<bool>;

    /// Cancel a job that has not been claimed.
    async fn cancel(&self, job_id: JobId) -> Result<bool>;

    /// Reset processing jobs started before `cutoff` to pending.
    async fn cleanup_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Reset failed jobs to pending (one job, or all when `None`).
    async fn retry_failed(&self, job_id: Option<JobId>) -> Result<u64>;

    /// Get job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// List jobs in a status, most recent first.
    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>>;

    /// Most recent jobs joined with their latest metric.
    async fn recent(&self, limit: i64) -> Result<Vec<JobHistoryEntry>>;

    /// Counts by status plus metrics aggregates since `window_start`.
    async fn stats(&self, window_start: DateTime<Utc>) -> Result<QueueStats>;

    /// Pending plus retry_pending.
    async fn queue_depth(&self) -> Result<i64>;
}

// =============================================================================
// WORKER REPOSITORY TRAITS
// =============================================================================

/// Repository for worker liveness rows.
#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// Insert or update a worker's heartbeat row.
    async fn upsert(&self, heartbeat: &WorkerHeartbeat) -> Result<()>;

    /// Get the heartbeat row for a worker.
    async fn get(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>>;

    /// List all heartbeat rows, most recent first.
    async fn list(&self) -> Result<Vec<WorkerHeartbeat>>;
}

/// Read access to extraction metrics. Rows are written by the job
/// repository as part of `complete` and `record_failure`.
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    /// All metric rows recorded for a job, oldest first.
    async fn for_job(&self, job_id: JobId) -> Result<Vec<ExtractionMetric>>;

    /// Aggregates since `window_start`.
    async fn summary(&self, window_start: DateTime<Utc>) -> Result<MetricsSummary>;
}

// =============================================================================
// EXTRACTOR TRAITS
// =============================================================================

/// A text extraction strategy for one family of document formats.
///
/// Extractors are registered in an `ExtractorRegistry`, which resolves the
/// first extractor whose `can_handle` accepts a file.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Human-readable name of this extractor.
    fn name(&self) -> &str;

    /// Whether this extractor accepts the file, judged by path and declared
    /// content type.
    fn can_handle(&self, path: &Path, content_type: Option<&str>) -> bool;

    /// Extract text from the file.
    async fn extract(&self, path: &Path) -> std::result::Result<Extraction, ExtractionError>;

    /// Check if the extractor's external dependencies are available.
    async fn health_check(&self) -> bool {
        true
    }
}
