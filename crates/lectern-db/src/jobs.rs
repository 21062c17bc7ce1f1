//! Extraction job repository implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use lectern_core::{
    AttachmentId, ErrorKind, FailureUpdate, Job, JobHistoryEntry, JobId, JobRepository, JobStatus,
    QueueStats, Result,
};

use crate::metrics::metrics_summary;
use crate::retry::with_retry;
use crate::{from_millis, from_millis_opt, parse_column, to_millis, to_millis_ceil};

const JOB_COLUMNS: &str = "id, attachment_id, status, worker_id, priority, retry_count, \
     error_message, created_at, started_at, completed_at, next_retry_at";

const INSERT_METRIC_SQL: &str = "INSERT INTO extraction_metrics
     (job_id, attachment_id, worker_id, extraction_time_ms, confidence, status, error_kind, file_size, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, (SELECT file_size FROM attachments WHERE id = ?), ?)";

/// SQLite implementation of JobRepository.
#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    /// Create a new SqliteJobRepository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claim one job matching `filter`, choosing by `order_by`, with a single
    /// guarded UPDATE. SQLite serializes writers, so the inner SELECT and the
    /// status guard see the same snapshot and only one caller wins.
    async fn claim_where(
        &self,
        op: &'static str,
        filter: &str,
        order_by: &str,
        filter_binds_now: bool,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let pool = &self.pool;
        let now_ms = to_millis(now);
        let sql = format!(
            "UPDATE extraction_jobs
             SET status = 'processing', worker_id = ?, started_at = ?
             WHERE id = (
                 SELECT id FROM extraction_jobs
                 WHERE {filter}
                 ORDER BY {order_by}
                 LIMIT 1
             )
               AND status IN ('pending', 'retry_pending')
             RETURNING {JOB_COLUMNS}"
        );
        let sql = sql.as_str();
        let row = with_retry(op, || async move {
            let mut query = sqlx::query(sql).bind(worker_id).bind(now_ms);
            if filter_binds_now {
                query = query.bind(now_ms);
            }
            query.fetch_optional(pool).await
        })
        .await?;
        row.map(|r| parse_job_row(&r)).transpose()
    }
}

/// Parse a row selected with `JOB_COLUMNS`.
pub(crate) fn parse_job_row(row: &SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        attachment_id: row.try_get("attachment_id")?,
        status: parse_column("status", &status)?,
        worker_id: row.try_get("worker_id")?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: from_millis_opt(row.try_get("started_at")?),
        completed_at: from_millis_opt(row.try_get("completed_at")?),
        next_retry_at: from_millis_opt(row.try_get("next_retry_at")?),
    })
}

fn parse_error_kind(value: Option<String>) -> Result<Option<ErrorKind>> {
    value
        .map(|v| parse_column::<ErrorKind>("error_kind", &v))
        .transpose()
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert(&self, attachment_id: AttachmentId, priority: i32) -> Result<Job> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let sql = format!(
            "INSERT INTO extraction_jobs (attachment_id, status, priority, retry_count, created_at)
             VALUES (?, 'pending', ?, 0, ?)
             RETURNING {JOB_COLUMNS}"
        );
        let sql = sql.as_str();
        let row = with_retry("job_insert", || async move {
            sqlx::query(sql)
                .bind(attachment_id)
                .bind(priority)
                .bind(now)
                .fetch_one(pool)
                .await
        })
        .await?;
        parse_job_row(&row)
    }

    async fn insert_deduplicated(
        &self,
        attachment_id: AttachmentId,
        priority: i32,
    ) -> Result<Option<Job>> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());

        // Atomic check-and-insert: INSERT ... WHERE NOT EXISTS cannot race with
        // a concurrent enqueue of the same attachment.
        let sql = format!(
            "INSERT INTO extraction_jobs (attachment_id, status, priority, retry_count, created_at)
             SELECT ?, 'pending', ?, 0, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM extraction_jobs
                 WHERE attachment_id = ?
                   AND status IN ('pending', 'processing', 'retry_pending')
             )
             RETURNING {JOB_COLUMNS}"
        );
        let sql = sql.as_str();
        let row = with_retry("job_insert_deduplicated", || async move {
            sqlx::query(sql)
                .bind(attachment_id)
                .bind(priority)
                .bind(now)
                .bind(attachment_id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(|r| parse_job_row(&r)).transpose()
    }

    async fn claim_retry(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.claim_where(
            "job_claim_retry",
            "status = 'retry_pending' AND next_retry_at <= ?",
            "priority DESC, next_retry_at ASC, id ASC",
            true,
            worker_id,
            now,
        )
        .await
    }

    async fn claim_pending(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.claim_where(
            "job_claim_pending",
            "status = 'pending'",
            "priority DESC, created_at ASC, id ASC",
            false,
            worker_id,
            now,
        )
        .await
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        elapsed_ms: i64,
        confidence: Option<f64>,
    ) -> Result<Option<Job>> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let sql = format!(
            "UPDATE extraction_jobs
             SET status = 'complete', completed_at = ?, error_message = NULL, next_retry_at = NULL
             WHERE id = ? AND status = 'processing' AND worker_id = ?
             RETURNING {JOB_COLUMNS}"
        );
        let sql = sql.as_str();

        let row = with_retry("job_complete", || async move {
            let mut tx = pool.begin().await?;
            let row = sqlx::query(sql)
                .bind(now)
                .bind(job_id)
                .bind(worker_id)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(ref r) = row {
                let attachment_id: i64 = r.try_get("attachment_id")?;
                sqlx::query(INSERT_METRIC_SQL)
                    .bind(job_id)
                    .bind(attachment_id)
                    .bind(worker_id)
                    .bind(elapsed_ms)
                    .bind(confidence)
                    .bind(JobStatus::Complete.as_str())
                    .bind(None::<String>)
                    .bind(attachment_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok::<_, sqlx::Error>(row)
        })
        .await?;

        row.map(|r| parse_job_row(&r)).transpose()
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        expected_retry_count: i32,
        update: &FailureUpdate,
    ) -> Result<Option<Job>> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let completed_at = (update.status == JobStatus::Failed).then_some(now);
        let next_retry_at = update.next_retry_at.map(to_millis_ceil);
        let sql = format!(
            "UPDATE extraction_jobs
             SET status = ?, retry_count = ?, error_message = ?, worker_id = NULL,
                 next_retry_at = ?, completed_at = ?
             WHERE id = ? AND status = 'processing' AND retry_count = ? AND worker_id = ?
             RETURNING {JOB_COLUMNS}"
        );
        let sql = sql.as_str();

        let row = with_retry("job_record_failure", || async move {
            let mut tx = pool.begin().await?;
            let row = sqlx::query(sql)
                .bind(update.status.as_str())
                .bind(update.retry_count)
                .bind(&update.error_message)
                .bind(next_retry_at)
                .bind(completed_at)
                .bind(job_id)
                .bind(expected_retry_count)
                .bind(&update.worker_id)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(ref r) = row {
                let attachment_id: i64 = r.try_get("attachment_id")?;
                sqlx::query(INSERT_METRIC_SQL)
                    .bind(job_id)
                    .bind(attachment_id)
                    .bind(&update.worker_id)
                    .bind(update.elapsed_ms)
                    .bind(None::<f64>)
                    .bind(update.status.as_str())
                    .bind(update.error_kind.as_str())
                    .bind(attachment_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok::<_, sqlx::Error>(row)
        })
        .await?;

        row.map(|r| parse_job_row(&r)).transpose()
    }

    async fn release(&self, job_id: JobId) -> Result<bool> {
        let pool = &self.pool;
        let result = with_retry("job_release", || async move {
            sqlx::query(
                "UPDATE extraction_jobs
                 SET status = 'pending', worker_id = NULL, started_at = NULL
                 WHERE id = ? AND status = 'processing'",
            )
            .bind(job_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let result = with_retry("job_cancel", || async move {
            sqlx::query(
                "UPDATE extraction_jobs
                 SET status = 'cancelled', completed_at = ?
                 WHERE id = ? AND status IN ('pending', 'retry_pending')",
            )
            .bind(now)
            .bind(job_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let pool = &self.pool;
        let cutoff = to_millis(cutoff);
        with_retry("job_cleanup_stale", || async move {
            sqlx::query_scalar(
                "UPDATE extraction_jobs
                 SET status = 'pending', worker_id = NULL, started_at = NULL
                 WHERE status = 'processing' AND started_at < ?
                 RETURNING id",
            )
            .bind(cutoff)
            .fetch_all(pool)
            .await
        })
        .await
    }

    async fn retry_failed(&self, job_id: Option<JobId>) -> Result<u64> {
        let pool = &self.pool;
        let result = with_retry("job_retry_failed", || async move {
            sqlx::query(
                "UPDATE extraction_jobs
                 SET status = 'pending', retry_count = 0, error_message = NULL, worker_id = NULL,
                     started_at = NULL, completed_at = NULL, next_retry_at = NULL
                 WHERE status = 'failed' AND (? IS NULL OR id = ?)",
            )
            .bind(job_id)
            .bind(job_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let pool = &self.pool;
        let sql = format!("SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE id = ?");
        let sql = sql.as_str();
        let row = with_retry("job_get", || async move {
            sqlx::query(sql).bind(job_id).fetch_optional(pool).await
        })
        .await?;
        row.map(|r| parse_job_row(&r)).transpose()
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM extraction_jobs
             WHERE status = ?
             ORDER BY COALESCE(completed_at, created_at) DESC, id DESC
             LIMIT ?"
        );
        let sql = sql.as_str();
        let rows = with_retry("job_list_by_status", || async move {
            sqlx::query(sql)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await
        })
        .await?;
        rows.iter().map(parse_job_row).collect()
    }

    async fn recent(&self, limit: i64) -> Result<Vec<JobHistoryEntry>> {
        let pool = &self.pool;
        let rows = with_retry("job_recent", || async move {
            sqlx::query(
                "SELECT j.id AS id, j.attachment_id AS attachment_id, j.status AS status,
                        j.worker_id AS worker_id, j.priority AS priority,
                        j.retry_count AS retry_count, j.error_message AS error_message,
                        j.created_at AS created_at, j.started_at AS started_at,
                        j.completed_at AS completed_at, j.next_retry_at AS next_retry_at,
                        a.filename AS filename,
                        m.extraction_time_ms AS extraction_time_ms,
                        m.confidence AS confidence,
                        m.error_kind AS error_kind
                 FROM extraction_jobs j
                 LEFT JOIN attachments a ON a.id = j.attachment_id
                 LEFT JOIN extraction_metrics m
                        ON m.id = (SELECT MAX(id) FROM extraction_metrics WHERE job_id = j.id)
                 ORDER BY j.created_at DESC, j.id DESC
                 LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await
        })
        .await?;

        rows.iter()
            .map(|row| -> Result<JobHistoryEntry> {
                Ok(JobHistoryEntry {
                    job: parse_job_row(row)?,
                    filename: row.try_get("filename")?,
                    extraction_time_ms: row.try_get("extraction_time_ms")?,
                    confidence: row.try_get("confidence")?,
                    error_kind: parse_error_kind(row.try_get("error_kind")?)?,
                })
            })
            .collect()
    }

    async fn stats(&self, window_start: DateTime<Utc>) -> Result<QueueStats> {
        let pool = &self.pool;
        let counts: Vec<(String, i64)> = with_retry("job_stats", || async move {
            sqlx::query_as("SELECT status, COUNT(*) FROM extraction_jobs GROUP BY status")
                .fetch_all(pool)
                .await
        })
        .await?;

        let totals: BTreeMap<String, i64> = counts.into_iter().collect();
        let count = |status: JobStatus| totals.get(status.as_str()).copied().unwrap_or(0);
        let summary = metrics_summary(pool, window_start).await?;

        Ok(QueueStats {
            pending: count(JobStatus::Pending),
            processing: count(JobStatus::Processing),
            retry_pending: count(JobStatus::RetryPending),
            completed_24h: summary.completed,
            avg_extraction_ms_24h: summary.avg_extraction_ms,
            totals,
        })
    }

    async fn queue_depth(&self) -> Result<i64> {
        let pool = &self.pool;
        with_retry("job_queue_depth", || async move {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM extraction_jobs WHERE status IN ('pending', 'retry_pending')",
            )
            .fetch_one(pool)
            .await
        })
        .await
    }
}
