//! # lectern-db
//!
//! SQLite durable store for the lectern extraction queue.
//!
//! This crate provides:
//! - Connection pooling (WAL journal, busy timeout, foreign keys)
//! - Embedded schema migrations
//! - Retry on lock contention for every repository call
//! - Repositories for attachments, extraction jobs, heartbeats and metrics

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

pub mod attachments;
pub mod heartbeats;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod retry;

pub use attachments::{content_type_from_extension, detect_content_type, SqliteAttachmentRepository};
pub use heartbeats::SqliteHeartbeatRepository;
pub use jobs::SqliteJobRepository;
pub use metrics::SqliteMetricsRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, open_pool, PoolConfig};
pub use retry::{is_contention, with_retry};

// Re-export core types
pub use lectern_core::*;

/// Database handle bundling the pool and every repository.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: SqlitePool,
    /// Attachment repository.
    pub attachments: SqliteAttachmentRepository,
    /// Extraction job repository.
    pub jobs: SqliteJobRepository,
    /// Worker heartbeat repository.
    pub heartbeats: SqliteHeartbeatRepository,
    /// Extraction metrics repository.
    pub metrics: SqliteMetricsRepository,
}

impl Database {
    /// Create a new database handle from a connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            attachments: SqliteAttachmentRepository::new(pool.clone()),
            jobs: SqliteJobRepository::new(pool.clone()),
            heartbeats: SqliteHeartbeatRepository::new(pool.clone()),
            metrics: SqliteMetricsRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect to a database URL such as `sqlite://lectern.db?mode=rwc`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Connect to a database URL with a custom pool configuration.
    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(database_url, config).await?;
        Ok(Self::new(pool))
    }

    /// Open (creating if needed) a database file.
    pub async fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let pool = open_pool(path.as_ref(), config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection in the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Convert a timestamp to the stored representation (unix milliseconds).
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Like [`to_millis`], rounding any sub-millisecond remainder up.
///
/// Used for "not before" times so the stored value never precedes the
/// computed one.
pub(crate) fn to_millis_ceil(ts: DateTime<Utc>) -> i64 {
    let ms = ts.timestamp_millis();
    if ts.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms + 1
    }
}

/// Convert a stored unix-millisecond value back into a timestamp.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Map a stored enum string through `FromStr`, reporting corrupt values.
pub(crate) fn parse_column<T>(column: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| Error::Internal(format!("invalid {} value: {}", column, e)))
}
