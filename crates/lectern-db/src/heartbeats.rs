//! Worker heartbeat repository implementation.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use lectern_core::{HeartbeatRepository, Result, WorkerHeartbeat};

use crate::retry::with_retry;
use crate::{from_millis, parse_column, to_millis};

/// SQLite implementation of HeartbeatRepository.
#[derive(Clone)]
pub struct SqliteHeartbeatRepository {
    pool: SqlitePool,
}

impl SqliteHeartbeatRepository {
    /// Create a new SqliteHeartbeatRepository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_heartbeat_row(row: &SqliteRow) -> Result<WorkerHeartbeat> {
    let status: String = row.try_get("status")?;
    Ok(WorkerHeartbeat {
        worker_id: row.try_get("worker_id")?,
        last_heartbeat: from_millis(row.try_get("last_heartbeat")?),
        status: parse_column("status", &status)?,
        current_job_id: row.try_get("current_job_id")?,
        jobs_completed: row.try_get("jobs_completed")?,
        jobs_failed: row.try_get("jobs_failed")?,
        started_at: from_millis(row.try_get("started_at")?),
    })
}

#[async_trait]
impl HeartbeatRepository for SqliteHeartbeatRepository {
    async fn upsert(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        let pool = &self.pool;
        with_retry("heartbeat_upsert", || async move {
            sqlx::query(
                "INSERT INTO worker_heartbeats
                     (worker_id, last_heartbeat, status, current_job_id, jobs_completed, jobs_failed, started_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(worker_id) DO UPDATE SET
                     last_heartbeat = excluded.last_heartbeat,
                     status = excluded.status,
                     current_job_id = excluded.current_job_id,
                     jobs_completed = excluded.jobs_completed,
                     jobs_failed = excluded.jobs_failed,
                     started_at = excluded.started_at",
            )
            .bind(&heartbeat.worker_id)
            .bind(to_millis(heartbeat.last_heartbeat))
            .bind(heartbeat.status.as_str())
            .bind(heartbeat.current_job_id)
            .bind(heartbeat.jobs_completed)
            .bind(heartbeat.jobs_failed)
            .bind(to_millis(heartbeat.started_at))
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>> {
        let pool = &self.pool;
        let row = with_retry("heartbeat_get", || async move {
            sqlx::query("SELECT * FROM worker_heartbeats WHERE worker_id = ?")
                .bind(worker_id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(|r| parse_heartbeat_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkerHeartbeat>> {
        let pool = &self.pool;
        let rows = with_retry("heartbeat_list", || async move {
            sqlx::query("SELECT * FROM worker_heartbeats ORDER BY last_heartbeat DESC, worker_id")
                .fetch_all(pool)
                .await
        })
        .await?;
        rows.iter().map(parse_heartbeat_row).collect()
    }
}
