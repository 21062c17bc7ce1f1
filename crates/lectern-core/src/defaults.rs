//! Centralized default constants for lectern.
//!
//! **This module is the single source of truth** for shared default values.
//! The store, the queue manager and the worker pool reference these
//! constants instead of defining their own magic numbers.

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of worker units in a pool.
pub const WORKER_COUNT: usize = 2;

/// Default pool name, used as the worker id prefix.
pub const WORKER_POOL_NAME: &str = "extract";

/// Default per-extraction timeout in seconds.
pub const EXTRACTION_TIMEOUT_SECS: u64 = 300;

/// Default heartbeat publish interval in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Base idle poll interval in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Floor applied to the idle poll interval when read from the environment.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Ceiling for the idle poll backoff in milliseconds.
pub const MAX_POLL_BACKOFF_MS: u64 = 5000;

/// Growth factor applied per consecutive empty poll.
pub const POLL_BACKOFF_FACTOR: f64 = 1.5;

/// Exponent cap for the idle poll backoff.
pub const POLL_BACKOFF_MAX_STEPS: u32 = 5;

/// Sleep slice while the pool is paused, in milliseconds.
pub const PAUSED_POLL_MS: u64 = 100;

/// Default graceful stop timeout in seconds.
pub const STOP_TIMEOUT_SECS: u64 = 60;

/// Default broadcast channel capacity for queue and worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum retry count for failed jobs.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Default priority for newly enqueued jobs (higher runs sooner).
pub const JOB_DEFAULT_PRIORITY: i32 = 0;

/// Escalating retry delays in milliseconds, indexed by `retry_count - 1`.
///
/// Attempts beyond the table length reuse the last entry.
pub const RETRY_DELAYS_MS: [u64; 5] = [500, 2_000, 10_000, 30_000, 60_000];

/// Minimum retry delay for a missing extractor capability (30 seconds).
///
/// Missing tools need an operator, so retrying quickly only burns attempts.
pub const MISSING_CAPABILITY_MIN_DELAY_MS: u64 = 30_000;

/// Age after which a `processing` job is considered abandoned (30 minutes).
pub const STALE_JOB_THRESHOLD_SECS: u64 = 1800;

/// Window used for rolling queue statistics (24 hours).
pub const STATS_WINDOW_HOURS: i64 = 24;

/// Default number of rows returned by job history listings.
pub const RECENT_JOBS_LIMIT: i64 = 20;

// =============================================================================
// DATABASE
// =============================================================================

/// Default SQLite database URL for the worker binary.
pub const DATABASE_URL: &str = "sqlite://lectern.db?mode=rwc";

/// Maximum attempts for a store call that hits lock contention.
pub const STORE_MAX_RETRIES: u32 = 5;

/// First contention backoff delay in milliseconds (doubles per attempt).
pub const STORE_RETRY_BASE_MS: u64 = 100;

/// SQLite busy timeout in milliseconds.
pub const STORE_BUSY_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// EXTRACTION
// =============================================================================

/// Timeout for a single external extraction command in seconds.
pub const EXTRACTION_CMD_TIMEOUT_SECS: u64 = 120;

/// Confidence reported for pandoc-converted documents.
pub const DOCUMENT_CONVERT_CONFIDENCE: f64 = 0.95;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_strictly_increasing() {
        for pair in RETRY_DELAYS_MS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_missing_capability_floor_within_table() {
        let max = RETRY_DELAYS_MS[RETRY_DELAYS_MS.len() - 1];
        assert!(MISSING_CAPABILITY_MIN_DELAY_MS <= max);
    }

    #[test]
    fn test_poll_backoff_bounds() {
        assert!(MIN_POLL_INTERVAL_MS <= POLL_INTERVAL_MS);
        assert!(POLL_INTERVAL_MS <= MAX_POLL_BACKOFF_MS);
    }
}
