//! Durable extraction queue.
//!
//! `QueueManager` owns the job lifecycle on top of the store: enqueue with
//! optional de-duplication, two-tier claiming, completion, classified failure
//! with escalating backoff, release, cancellation and stale-job recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use lectern_core::defaults::{
    EVENT_BUS_CAPACITY, MISSING_CAPABILITY_MIN_DELAY_MS, RETRY_DELAYS_MS, STATS_WINDOW_HOURS,
};
use lectern_core::{
    AttachmentId, AttachmentRepository, Error, ErrorKind, FailureUpdate, Job, JobHistoryEntry,
    JobId, JobRepository, JobStatus, QueueStats, Result,
};
use lectern_db::Database;

/// Escalating retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before retry `n` is `delays[n - 1]`; later retries reuse the last entry.
    pub delays: Vec<Duration>,
    /// Lower bound for `MissingCapability` failures.
    pub missing_capability_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: RETRY_DELAYS_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            missing_capability_floor: Duration::from_millis(MISSING_CAPABILITY_MIN_DELAY_MS),
        }
    }
}

/// What `failed` does with a job.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    /// `RetryPending` or `Failed`.
    pub status: JobStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryPolicy {
    /// Create a policy with a custom delay table.
    pub fn new(delays: Vec<Duration>, missing_capability_floor: Duration) -> Self {
        Self {
            delays,
            missing_capability_floor,
        }
    }

    /// Backoff before the given retry (1-based) for a failure of `kind`.
    pub fn delay_for(&self, kind: ErrorKind, retry_count: i32) -> Duration {
        let index = usize::try_from(retry_count.max(1) - 1).unwrap_or(0);
        let base = self
            .delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO);

        if kind == ErrorKind::MissingCapability {
            base.max(self.missing_capability_floor)
        } else {
            base
        }
    }

    /// Decide the outcome of a failed attempt.
    ///
    /// Retries while `retry_count + 1 <= max_retries` and the kind is not
    /// permanent; otherwise the job fails for good.
    pub fn decide(
        &self,
        current_retry_count: i32,
        kind: ErrorKind,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let retry_count = current_retry_count.saturating_add(1);

        if retry_count <= max_retries && !kind.is_permanent() {
            let delay = chrono::Duration::from_std(self.delay_for(kind, retry_count))
                .unwrap_or_else(|_| chrono::Duration::zero());
            RetryDecision {
                status: JobStatus::RetryPending,
                retry_count,
                next_retry_at: Some(now + delay),
            }
        } else {
            RetryDecision {
                status: JobStatus::Failed,
                retry_count,
                next_retry_at: None,
            }
        }
    }
}

/// Event emitted by the queue manager.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job was added.
    Enqueued {
        job_id: JobId,
        attachment_id: AttachmentId,
        priority: i32,
    },
    /// A worker claimed a job.
    Claimed { job_id: JobId, worker_id: String },
    /// A job finished successfully.
    Completed {
        job_id: JobId,
        attachment_id: AttachmentId,
        elapsed_ms: i64,
    },
    /// An attempt failed; `will_retry` tells whether it is scheduled again.
    Failed {
        job_id: JobId,
        attachment_id: AttachmentId,
        kind: ErrorKind,
        error: String,
        retry_count: i32,
        will_retry: bool,
    },
    /// An in-flight job was handed back to the queue.
    Released { job_id: JobId },
    /// A queued job was cancelled.
    Cancelled { job_id: JobId },
}

/// Job lifecycle manager over the durable store.
#[derive(Clone)]
pub struct QueueManager {
    db: Database,
    policy: RetryPolicy,
    event_tx: broadcast::Sender<QueueEvent>,
    /// Notify handle for event-driven worker wake.
    notify: Arc<Notify>,
}

impl QueueManager {
    /// Create a queue manager with the default retry policy.
    pub fn new(db: Database) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            db,
            policy: RetryPolicy::default(),
            event_tx,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Get a receiver for queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Get the notification handle signalled whenever new work is queued.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Queue an attachment for extraction.
    ///
    /// Returns `None` when `deduplicate` is set and the attachment already has
    /// a pending, processing or retry_pending job.
    pub async fn enqueue(
        &self,
        attachment_id: AttachmentId,
        priority: i32,
        deduplicate: bool,
    ) -> Result<Option<JobId>> {
        if !self.db.attachments.exists(attachment_id).await? {
            return Err(Error::AttachmentNotFound(attachment_id));
        }

        let job = if deduplicate {
            match self.db.jobs.insert_deduplicated(attachment_id, priority).await? {
                Some(job) => job,
                None => {
                    debug!(
                        subsystem = "queue",
                        attachment_id, "Attachment already queued, skipping"
                    );
                    return Ok(None);
                }
            }
        } else {
            self.db.jobs.insert(attachment_id, priority).await?
        };

        info!(
            subsystem = "queue",
            op = "enqueue",
            job_id = job.id,
            attachment_id,
            priority,
            "Job enqueued"
        );
        self.emit(QueueEvent::Enqueued {
            job_id: job.id,
            attachment_id,
            priority,
        });
        self.notify.notify_waiters();
        Ok(Some(job.id))
    }

    /// Queue several attachments, returning the ids of the jobs created.
    ///
    /// Stops at the first missing attachment; jobs queued before it remain.
    pub async fn enqueue_batch(
        &self,
        attachment_ids: &[AttachmentId],
        priority: i32,
        deduplicate: bool,
    ) -> Result<Vec<JobId>> {
        let mut job_ids = Vec::with_capacity(attachment_ids.len());
        for &attachment_id in attachment_ids {
            if let Some(job_id) = self.enqueue(attachment_id, priority, deduplicate).await? {
                job_ids.push(job_id);
            }
        }
        Ok(job_ids)
    }

    /// Claim the next eligible job for `worker_id`.
    ///
    /// Due retries are served before fresh work; within a tier, higher
    /// priority wins, then the earliest retry time or creation time.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let job = match self.db.jobs.claim_retry(worker_id, now).await? {
            Some(job) => Some(job),
            None => self.db.jobs.claim_pending(worker_id, now).await?,
        };

        if let Some(ref job) = job {
            debug!(
                subsystem = "queue",
                op = "claim",
                job_id = job.id,
                attachment_id = job.attachment_id,
                worker_id,
                retry_count = job.retry_count,
                "Job claimed"
            );
            self.emit(QueueEvent::Claimed {
                job_id: job.id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }

    /// Mark a processing job complete and record its metric.
    ///
    /// Returns false when the job is no longer processing under `worker_id`
    /// (for example it was reclaimed by a stale sweep). Callers treat that as
    /// authoritative.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        elapsed_ms: i64,
        confidence: Option<f64>,
    ) -> Result<bool> {
        match self
            .db
            .jobs
            .complete(job_id, worker_id, elapsed_ms, confidence)
            .await?
        {
            Some(job) => {
                info!(
                    subsystem = "queue",
                    op = "complete",
                    job_id,
                    attachment_id = job.attachment_id,
                    duration_ms = elapsed_ms,
                    "Job completed"
                );
                self.emit(QueueEvent::Completed {
                    job_id,
                    attachment_id: job.attachment_id,
                    elapsed_ms,
                });
                Ok(true)
            }
            None => {
                warn!(
                    subsystem = "queue",
                    op = "complete",
                    job_id,
                    worker_id,
                    "Job not processing under this worker, completion ignored"
                );
                Ok(false)
            }
        }
    }

    /// Record a failed attempt and schedule a retry or fail the job.
    ///
    /// Returns false when the job is no longer processing under `worker_id`.
    pub async fn failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        kind: ErrorKind,
        max_retries: i32,
        elapsed_ms: i64,
    ) -> Result<bool> {
        let job = match self.db.jobs.get(job_id).await? {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.worker_id.as_deref() == Some(worker_id) =>
            {
                job
            }
            _ => {
                warn!(
                    subsystem = "queue",
                    op = "failed",
                    job_id,
                    worker_id,
                    "Job not processing under this worker, failure ignored"
                );
                return Ok(false);
            }
        };

        let decision = self
            .policy
            .decide(job.retry_count, kind, max_retries, Utc::now());
        let update = FailureUpdate {
            worker_id: worker_id.to_string(),
            status: decision.status,
            retry_count: decision.retry_count,
            error_message: error_message.to_string(),
            error_kind: kind,
            next_retry_at: decision.next_retry_at,
            elapsed_ms,
        };

        let Some(updated) = self
            .db
            .jobs
            .record_failure(job_id, job.retry_count, &update)
            .await?
        else {
            warn!(
                subsystem = "queue",
                op = "failed",
                job_id,
                "Job changed owner before failure was recorded"
            );
            return Ok(false);
        };

        let will_retry = updated.status == JobStatus::RetryPending;
        if will_retry {
            warn!(
                subsystem = "queue",
                op = "failed",
                job_id,
                attachment_id = updated.attachment_id,
                error_kind = %kind,
                retry_count = updated.retry_count,
                max_retries,
                next_retry_at = ?updated.next_retry_at,
                error = error_message,
                "Job failed, retry scheduled"
            );
        } else {
            warn!(
                subsystem = "queue",
                op = "failed",
                job_id,
                attachment_id = updated.attachment_id,
                error_kind = %kind,
                retry_count = updated.retry_count,
                error = error_message,
                "Job failed permanently"
            );
        }

        self.emit(QueueEvent::Failed {
            job_id,
            attachment_id: updated.attachment_id,
            kind,
            error: error_message.to_string(),
            retry_count: updated.retry_count,
            will_retry,
        });
        Ok(true)
    }

    /// Return a processing job to pending without counting an attempt.
    pub async fn release(&self, job_id: JobId) -> Result<bool> {
        let released = self.db.jobs.release(job_id).await?;
        if released {
            info!(subsystem = "queue", op = "release", job_id, "Job released");
            self.emit(QueueEvent::Released { job_id });
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    /// Cancel a pending or retry_pending job.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let cancelled = self.db.jobs.cancel(job_id).await?;
        if cancelled {
            info!(subsystem = "queue", op = "cancel", job_id, "Job cancelled");
            self.emit(QueueEvent::Cancelled { job_id });
        }
        Ok(cancelled)
    }

    /// Reset jobs stuck in processing for longer than `threshold`.
    pub async fn cleanup_stale_jobs(&self, threshold: Duration) -> Result<u64> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| Error::InvalidInput(format!("stale threshold out of range: {}", e)))?;
        let reset = self.db.jobs.cleanup_stale(Utc::now() - threshold).await?;

        if !reset.is_empty() {
            warn!(
                subsystem = "queue",
                op = "cleanup_stale",
                count = reset.len(),
                job_ids = ?reset,
                "Reset stale processing jobs"
            );
            self.notify.notify_waiters();
        }
        Ok(reset.len() as u64)
    }

    /// Reset failed jobs to pending: one job, or every failed job when `None`.
    pub async fn retry_failed(&self, job_id: Option<JobId>) -> Result<u64> {
        let count = self.db.jobs.retry_failed(job_id).await?;
        if count > 0 {
            info!(
                subsystem = "queue",
                op = "retry_failed",
                count,
                job_id = ?job_id,
                "Failed jobs requeued"
            );
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Counts by status plus 24-hour completion metrics.
    pub async fn stats(&self) -> Result<QueueStats> {
        let window_start = Utc::now() - chrono::Duration::hours(STATS_WINDOW_HOURS);
        self.db.jobs.stats(window_start).await
    }

    pub async fn queue_depth(&self) -> Result<i64> {
        self.db.jobs.queue_depth().await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.db.jobs.get(job_id).await
    }

    /// Jobs that exhausted their retries, most recent first.
    pub async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        self.db.jobs.list_by_status(JobStatus::Failed, limit).await
    }

    /// Recent jobs joined with their latest metric.
    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<JobHistoryEntry>> {
        self.db.jobs.recent(limit).await
    }
}
