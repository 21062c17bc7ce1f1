//! Extraction metrics repository implementation.
//!
//! Metric rows are appended by the job repository in the same transaction
//! that finalizes an attempt; this module only reads them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use lectern_core::{ExtractionMetric, JobId, MetricsRepository, MetricsSummary, Result};

use crate::retry::with_retry;
use crate::{from_millis, parse_column, to_millis};

/// SQLite implementation of MetricsRepository.
#[derive(Clone)]
pub struct SqliteMetricsRepository {
    pool: SqlitePool,
}

impl SqliteMetricsRepository {
    /// Create a new SqliteMetricsRepository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Aggregate metrics recorded at or after `window_start`.
pub(crate) async fn metrics_summary(
    pool: &SqlitePool,
    window_start: DateTime<Utc>,
) -> Result<MetricsSummary> {
    let since = to_millis(window_start);
    let row = with_retry("metrics_summary", || async move {
        sqlx::query(
            "SELECT
                 COALESCE(SUM(CASE WHEN status = 'complete' THEN 1 ELSE 0 END), 0) AS completed,
                 COALESCE(SUM(CASE WHEN status = 'retry_pending' THEN 1 ELSE 0 END), 0) AS retried,
                 COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                 AVG(CASE WHEN status = 'complete' THEN extraction_time_ms END) AS avg_ms
             FROM extraction_metrics
             WHERE created_at >= ?",
        )
        .bind(since)
        .fetch_one(pool)
        .await
    })
    .await?;

    Ok(MetricsSummary {
        completed: row.try_get("completed")?,
        retried: row.try_get("retried")?,
        failed: row.try_get("failed")?,
        avg_extraction_ms: row.try_get("avg_ms")?,
    })
}

#[async_trait]
impl MetricsRepository for SqliteMetricsRepository {
    async fn for_job(&self, job_id: JobId) -> Result<Vec<ExtractionMetric>> {
        let pool = &self.pool;
        let rows = with_retry("metrics_for_job", || async move {
            sqlx::query("SELECT * FROM extraction_metrics WHERE job_id = ? ORDER BY id")
                .bind(job_id)
                .fetch_all(pool)
                .await
        })
        .await?;

        rows.iter()
            .map(|row| -> Result<ExtractionMetric> {
                let status: String = row.try_get("status")?;
                let error_kind: Option<String> = row.try_get("error_kind")?;
                Ok(ExtractionMetric {
                    id: row.try_get("id")?,
                    job_id: row.try_get("job_id")?,
                    attachment_id: row.try_get("attachment_id")?,
                    worker_id: row.try_get("worker_id")?,
                    extraction_time_ms: row.try_get("extraction_time_ms")?,
                    confidence: row.try_get("confidence")?,
                    status: parse_column("status", &status)?,
                    error_kind: error_kind
                        .map(|k| parse_column("error_kind", &k))
                        .transpose()?,
                    file_size: row.try_get("file_size")?,
                    created_at: from_millis(row.try_get("created_at")?),
                })
            })
            .collect()
    }

    async fn summary(&self, window_start: DateTime<Utc>) -> Result<MetricsSummary> {
        metrics_summary(&self.pool, window_start).await
    }
}
