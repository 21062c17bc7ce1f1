//! Retry-on-contention for store calls.
//!
//! SQLite reports `SQLITE_BUSY` / `SQLITE_LOCKED` when another connection
//! holds the write lock past the busy timeout. Those calls are retried with
//! jittered exponential backoff before the error reaches the caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use lectern_core::defaults::{STORE_MAX_RETRIES, STORE_RETRY_BASE_MS};
use lectern_core::{Error, Result};

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Whether the error is transient lock contention.
pub fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Backoff before retry number `attempt` (zero-based), jittered 0.5x to 1.5x.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = STORE_RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Run a store call, retrying on contention.
///
/// Non-contention errors return immediately. After `STORE_MAX_RETRIES`
/// attempts the last error is returned as [`Error::Database`].
pub async fn with_retry<T, F, Fut>(op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        subsystem = "database",
                        component = "retry",
                        op,
                        attempts = attempt + 1,
                        "Store call succeeded after contention"
                    );
                }
                return Ok(value);
            }
            Err(e) if is_contention(&e) && attempt + 1 < STORE_MAX_RETRIES => {
                let delay = backoff_delay(attempt);
                warn!(
                    subsystem = "database",
                    component = "retry",
                    op,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store contention, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(Error::Database(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delay_grows() {
        for attempt in 0..4 {
            let base = STORE_RETRY_BASE_MS * (1 << attempt);
            let delay = backoff_delay(attempt).as_millis() as u64;
            assert!(delay >= base / 2, "attempt {} delay {}", attempt, delay);
            assert!(delay <= base * 3 / 2, "attempt {} delay {}", attempt, delay);
        }
    }

    #[test]
    fn test_row_not_found_is_not_contention() {
        assert!(!is_contention(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_with_retry_passes_through_success() {
        let value = with_retry("test", || async { Ok::<_, sqlx::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(matches!(result, Err(Error::Database(sqlx::Error::RowNotFound))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
