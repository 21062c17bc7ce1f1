//! Serializable snapshots of worker pool state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lectern_core::{JobId, QueueStats, WorkerState};

/// Point-in-time view of one worker unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub state: WorkerState,
    pub current_job_id: Option<JobId>,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Pool-wide throughput since start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub uptime_secs: f64,
    /// Processed jobs per second of uptime.
    pub throughput_per_sec: f64,
    /// Mean extraction time of successful jobs this run.
    pub avg_extraction_ms: Option<f64>,
}

impl ThroughputStats {
    pub(crate) fn compute(
        succeeded: u64,
        failed: u64,
        total_extraction_ms: u64,
        uptime_secs: f64,
    ) -> Self {
        let processed = succeeded + failed;
        let throughput_per_sec = if uptime_secs > 0.0 {
            processed as f64 / uptime_secs
        } else {
            0.0
        };
        let avg_extraction_ms =
            (succeeded > 0).then(|| total_extraction_ms as f64 / succeeded as f64);

        Self {
            jobs_processed: processed,
            jobs_succeeded: succeeded,
            jobs_failed: failed,
            uptime_secs,
            throughput_per_sec,
            avg_extraction_ms,
        }
    }
}

/// Full status report of a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_name: String,
    pub running: bool,
    pub paused: bool,
    pub num_workers: usize,
    /// Units currently holding a job.
    pub active_workers: usize,
    /// Pending plus retry_pending jobs.
    pub queue_depth: i64,
    /// Jobs in processing across all pools sharing the store.
    pub processing: i64,
    pub workers: Vec<WorkerSnapshot>,
    pub stats: ThroughputStats,
    pub queue: QueueStats,
}
