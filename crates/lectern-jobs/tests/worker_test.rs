//! End-to-end tests for the extraction worker pool.
//!
//! Each test runs a real pool against a fresh SQLite file and scripted
//! extractors keyed by file extension.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use lectern_db::{Database, PoolConfig};
use lectern_jobs::{
    AttachmentRepository, ErrorKind, ExtractionWorker, Extraction, ExtractionError, Extractor,
    ExtractorRegistry, HeartbeatRepository, Job, JobId, JobStatus, MetricsRepository,
    QueueManager, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerManager, WorkerState,
};

// =============================================================================
// HELPERS
// =============================================================================

async fn setup() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(
        dir.path().join("worker.db"),
        PoolConfig::default().max_connections(8),
    )
    .await
    .expect("open database");
    db.migrate().await.expect("migrate");
    (dir, db)
}

/// Write a file and register it as an attachment.
async fn register(db: &Database, dir: &TempDir, name: &str, contents: &[u8]) -> i64 {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write file");
    db.attachments
        .register_file(&path)
        .await
        .expect("register file")
        .id
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_num_workers(1)
        .with_poll_interval(Duration::from_millis(50))
        .with_max_poll_backoff(Duration::from_millis(200))
        .with_heartbeat_interval(Duration::from_millis(100))
}

async fn wait_for_job_status(
    queue: &QueueManager,
    job_id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = queue
            .get_job(job_id)
            .await
            .expect("get job")
            .expect("job exists");
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {:?}, expected {:?}",
            job_id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// Sleeps before returning text; handles `.slow` files.
struct SlowExtractor {
    delay: Duration,
}

#[async_trait]
impl Extractor for SlowExtractor {
    fn name(&self) -> &str {
        "slow"
    }

    fn can_handle(&self, path: &Path, _content_type: Option<&str>) -> bool {
        has_ext(path, "slow")
    }

    async fn extract(&self, _path: &Path) -> Result<Extraction, ExtractionError> {
        tokio::time::sleep(self.delay).await;
        Ok(Extraction::new("finally", 0.8))
    }
}

/// Panics on every call; handles `.boom` files.
struct PanickingExtractor;

#[async_trait]
impl Extractor for PanickingExtractor {
    fn name(&self) -> &str {
        "boom"
    }

    fn can_handle(&self, path: &Path, _content_type: Option<&str>) -> bool {
        has_ext(path, "boom")
    }

    async fn extract(&self, _path: &Path) -> Result<Extraction, ExtractionError> {
        panic!("extractor exploded");
    }
}

/// Fails with a fixed error kind; handles `.fail` files.
struct FailingExtractor {
    kind: ErrorKind,
}

#[async_trait]
impl Extractor for FailingExtractor {
    fn name(&self) -> &str {
        "failing"
    }

    fn can_handle(&self, path: &Path, _content_type: Option<&str>) -> bool {
        has_ext(path, "fail")
    }

    async fn extract(&self, _path: &Path) -> Result<Extraction, ExtractionError> {
        Err(ExtractionError::new(self.kind, "scripted failure"))
    }
}

fn pool(db: &Database, config: WorkerConfig) -> ExtractionWorker {
    WorkerBuilder::new(db.clone())
        .with_config(config)
        .with_extractor(Arc::new(SlowExtractor {
            delay: Duration::from_secs(30),
        }))
        .with_extractor(Arc::new(PanickingExtractor))
        .with_extractor(Arc::new(FailingExtractor {
            kind: ErrorKind::Permanent,
        }))
        .build()
}

async fn last_error_kind(db: &Database, job_id: JobId) -> Option<ErrorKind> {
    db.metrics
        .for_job(job_id)
        .await
        .expect("metrics")
        .last()
        .and_then(|m| m.error_kind)
}

// =============================================================================
// END TO END
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_complete_text_attachment() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "hello.txt", b"Hello, lectern!\nSecond line.").await;

    let worker = pool(&db, fast_config().with_num_workers(2));
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    let handle = worker.start().await.unwrap();

    wait_for_job_status(worker.queue(), job_id, JobStatus::Complete, Duration::from_secs(10))
        .await;

    let attachment = db.attachments.get(att).await.unwrap().unwrap();
    assert_eq!(
        attachment.extracted_text.as_deref(),
        Some("Hello, lectern!\nSecond line.")
    );
    assert_eq!(attachment.extraction_confidence, Some(1.0));

    let metrics = db.metrics.for_job(job_id).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].status, JobStatus::Complete);

    assert!(handle.stop(Duration::from_secs(5)).await);
    assert!(!handle.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_jobs_processed_once_each() {
    let (dir, db) = setup().await;
    let mut ids = Vec::new();
    for i in 0..8 {
        let att = register(&db, &dir, &format!("doc{}.txt", i), b"some text").await;
        ids.push(att);
    }

    let worker = pool(&db, fast_config().with_num_workers(3));
    let jobs = worker.enqueue_batch(&ids, 0, true).await.unwrap();
    assert_eq!(jobs.len(), 8);
    worker.start().await.unwrap();

    for job_id in &jobs {
        wait_for_job_status(worker.queue(), *job_id, JobStatus::Complete, Duration::from_secs(10))
            .await;
        assert_eq!(db.metrics.for_job(*job_id).await.unwrap().len(), 1);
    }

    let status = worker.get_status().await.unwrap();
    assert_eq!(status.stats.jobs_succeeded, 8);
    assert_eq!(status.stats.jobs_failed, 0);
    assert!(status.stats.avg_extraction_ms.is_some());
    assert!(worker.stop(Duration::from_secs(5)).await);
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_during_extraction_releases_job() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "long.slow", b"payload").await;

    let worker = pool(&db, fast_config());
    let mut events = worker.subscribe();
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    let handle = worker.start().await.unwrap();

    wait_for_job_status(worker.queue(), job_id, JobStatus::Processing, Duration::from_secs(5))
        .await;

    assert!(handle.stop(Duration::from_secs(5)).await);

    let job = worker.queue().get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.worker_id.is_none());
    assert!(db.metrics.for_job(job_id).await.unwrap().is_empty());

    let mut released = false;
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::JobReleased { job_id: id, .. } = event {
            assert_eq!(id, job_id);
            released = true;
        }
    }
    assert!(released, "expected a JobReleased event");
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let (_dir, db) = setup().await;
    let worker = pool(&db, fast_config().with_num_workers(2));

    assert!(worker.stop(Duration::from_secs(1)).await);
    worker.start().await.unwrap();
    worker.start().await.unwrap();

    let status = worker.get_status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.workers.len(), 2);

    assert!(worker.stop(Duration::from_secs(5)).await);
    assert!(worker.stop(Duration::from_secs(5)).await);
    assert!(!worker.is_running());
}

#[tokio::test]
async fn test_pool_restarts_after_stop() {
    let (dir, db) = setup().await;
    let worker = pool(&db, fast_config());
    worker.start().await.unwrap();
    assert!(worker.stop(Duration::from_secs(5)).await);

    let att = register(&db, &dir, "again.txt", b"restart").await;
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();
    wait_for_job_status(worker.queue(), job_id, JobStatus::Complete, Duration::from_secs(10))
        .await;
    assert!(worker.stop(Duration::from_secs(5)).await);
}

// =============================================================================
// FAILURE CLASSIFICATION
// =============================================================================

#[tokio::test]
async fn test_timeout_fails_when_no_retries_left() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "stuck.slow", b"payload").await;

    let worker = pool(
        &db,
        fast_config()
            .with_max_retries(0)
            .with_extraction_timeout(Duration::from_millis(200)),
    );
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    let job =
        wait_for_job_status(worker.queue(), job_id, JobStatus::Failed, Duration::from_secs(10))
            .await;
    assert!(job.error_message.unwrap().contains("timeout"));
    assert_eq!(last_error_kind(&db, job_id).await, Some(ErrorKind::Timeout));
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_timeout_schedules_retry() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "retry.slow", b"payload").await;

    let worker = pool(
        &db,
        fast_config().with_extraction_timeout(Duration::from_millis(100)),
    );
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    let job = wait_for_job_status(
        worker.queue(),
        job_id,
        JobStatus::RetryPending,
        Duration::from_secs(10),
    )
    .await;
    assert!(job.retry_count >= 1);
    assert!(job.next_retry_at.unwrap() > job.created_at);
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_empty_file_is_corruption() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "empty.txt", b"").await;

    let worker = pool(&db, fast_config().with_max_retries(5));
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    let job =
        wait_for_job_status(worker.queue(), job_id, JobStatus::Failed, Duration::from_secs(10))
            .await;
    assert_eq!(job.retry_count, 1);
    assert!(job.error_message.unwrap().contains("empty"));
    assert_eq!(
        last_error_kind(&db, job_id).await,
        Some(ErrorKind::Corruption)
    );
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_missing_file_is_corruption() {
    let (dir, db) = setup().await;
    let path: PathBuf = dir.path().join("vanished.txt");
    let att = register(&db, &dir, "vanished.txt", b"here for now").await;
    std::fs::remove_file(&path).unwrap();

    let worker = pool(&db, fast_config().with_max_retries(5));
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    wait_for_job_status(worker.queue(), job_id, JobStatus::Failed, Duration::from_secs(10))
        .await;
    assert_eq!(
        last_error_kind(&db, job_id).await,
        Some(ErrorKind::Corruption)
    );
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_unsupported_type_is_classified() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "model.xyz", b"\x00\x01\x02").await;

    let worker = pool(&db, fast_config().with_max_retries(0));
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    wait_for_job_status(worker.queue(), job_id, JobStatus::Failed, Duration::from_secs(10))
        .await;
    assert_eq!(
        last_error_kind(&db, job_id).await,
        Some(ErrorKind::Unsupported)
    );
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_permanent_extractor_error_is_terminal() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "scripted.fail", b"payload").await;

    let worker = pool(&db, fast_config().with_max_retries(5));
    let mut events = worker.subscribe();
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    let job =
        wait_for_job_status(worker.queue(), job_id, JobStatus::Failed, Duration::from_secs(10))
            .await;
    assert_eq!(job.error_message.as_deref(), Some("scripted failure"));

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::JobFailed { kind, .. } = event {
            assert_eq!(kind, ErrorKind::Permanent);
            saw_failure = true;
        }
    }
    assert!(saw_failure);
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panic_is_unknown_and_worker_survives() {
    let (dir, db) = setup().await;
    let bad = register(&db, &dir, "bad.boom", b"payload").await;
    let good = register(&db, &dir, "good.txt", b"still alive").await;

    let worker = pool(&db, fast_config().with_max_retries(0));
    let bad_job = worker.enqueue(bad, 5, true).await.unwrap().unwrap();
    let good_job = worker.enqueue(good, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();

    let job =
        wait_for_job_status(worker.queue(), bad_job, JobStatus::Failed, Duration::from_secs(10))
            .await;
    assert!(job.error_message.unwrap().contains("extractor exploded"));
    assert_eq!(last_error_kind(&db, bad_job).await, Some(ErrorKind::Unknown));

    wait_for_job_status(
        worker.queue(),
        good_job,
        JobStatus::Complete,
        Duration::from_secs(10),
    )
    .await;

    let status = worker.get_status().await.unwrap();
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].jobs_failed, 1);
    assert_eq!(status.workers[0].jobs_completed, 1);
    assert!(worker.stop(Duration::from_secs(5)).await);
}

// =============================================================================
// PAUSE, RECOVERY, HEARTBEATS, STATUS
// =============================================================================

#[tokio::test]
async fn test_pause_gates_claims() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "paused.txt", b"wait for it").await;

    let worker = pool(&db, fast_config());
    worker.start().await.unwrap();
    assert!(worker.pause());
    assert!(worker.is_paused());

    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        worker.queue().get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
    assert!(worker.get_status().await.unwrap().paused);

    assert!(worker.resume());
    wait_for_job_status(worker.queue(), job_id, JobStatus::Complete, Duration::from_secs(10))
        .await;
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_start_recovers_stale_jobs() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "orphan.txt", b"left behind").await;

    let worker = pool(
        &db,
        fast_config().with_stale_threshold(Duration::from_secs(60)),
    );
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.queue().claim("crashed-0-00000000").await.unwrap().unwrap();

    let old = (Utc::now() - chrono::Duration::minutes(10)).timestamp_millis();
    sqlx::query("UPDATE extraction_jobs SET started_at = ? WHERE id = ?")
        .bind(old)
        .bind(job_id)
        .execute(db.pool())
        .await
        .unwrap();

    worker.start().await.unwrap();
    let job =
        wait_for_job_status(worker.queue(), job_id, JobStatus::Complete, Duration::from_secs(10))
            .await;
    assert_ne!(job.worker_id.as_deref(), Some("crashed-0-00000000"));
    assert!(worker.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_heartbeats_written_and_marked_stopped() {
    let (_dir, db) = setup().await;
    let worker = pool(&db, fast_config().with_num_workers(2).with_pool_name("hb"));
    worker.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if db.heartbeats.list().await.unwrap().len() == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no heartbeats");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let status = worker.get_status().await.unwrap();
    for unit in &status.workers {
        assert!(unit.worker_id.starts_with("hb-"));
        let suffix = unit.worker_id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    assert!(worker.stop(Duration::from_secs(5)).await);
    let beats = db.heartbeats.list().await.unwrap();
    assert_eq!(beats.len(), 2);
    assert!(beats.iter().all(|b| b.status == WorkerState::Stopped));
}

#[tokio::test]
async fn test_status_reports_queue_and_workers() {
    let (dir, db) = setup().await;
    let worker = pool(&db, fast_config().with_num_workers(3));
    let a = register(&db, &dir, "queued-a.txt", b"a").await;
    let b = register(&db, &dir, "queued-b.txt", b"b").await;
    worker.enqueue_batch(&[a, b], 0, true).await.unwrap();

    let status = worker.get_status().await.unwrap();
    assert!(!status.running);
    assert_eq!(status.num_workers, 3);
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.active_workers, 0);
    assert!(status.workers.is_empty());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["queue"]["pending"], 2);
}

#[tokio::test]
async fn test_history_and_retry_failed_pass_through() {
    let (dir, db) = setup().await;
    let att = register(&db, &dir, "again.fail", b"payload").await;

    let worker = pool(&db, fast_config());
    let job_id = worker.enqueue(att, 0, true).await.unwrap().unwrap();
    worker.start().await.unwrap();
    wait_for_job_status(worker.queue(), job_id, JobStatus::Failed, Duration::from_secs(10))
        .await;
    assert!(worker.stop(Duration::from_secs(5)).await);

    let failed = worker.failed_jobs(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    let history = worker.recent_jobs(10).await.unwrap();
    assert_eq!(history[0].error_kind, Some(ErrorKind::Permanent));

    assert_eq!(worker.retry_failed(Some(job_id)).await.unwrap(), 1);
    assert_eq!(
        worker.queue().get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

// =============================================================================
// MANAGER
// =============================================================================

#[tokio::test]
async fn test_manager_named_pools() {
    let (dir, db) = setup().await;
    let manager = WorkerManager::new(db.clone(), Arc::new(ExtractorRegistry::with_builtins()));

    manager.create_pool("text", fast_config()).await.unwrap();
    manager.create_pool("bulk", fast_config()).await.unwrap();
    assert!(manager.create_pool("text", fast_config()).await.is_err());
    assert_eq!(manager.names().await, vec!["bulk", "text"]);

    manager.start_all().await.unwrap();
    let text = manager.get("text").await.unwrap();
    assert_eq!(text.config().pool_name, "text");

    let att = register(&db, &dir, "managed.txt", b"managed").await;
    let job_id = text.enqueue(att, 0, true).await.unwrap().unwrap();
    wait_for_job_status(text.queue(), job_id, JobStatus::Complete, Duration::from_secs(10))
        .await;

    let results = manager.stop_all(Duration::from_secs(5)).await;
    assert_eq!(results.len(), 2);
    assert!(results.values().all(|stopped| *stopped));

    assert_eq!(manager.remove("bulk", Duration::from_secs(1)).await, Some(true));
    assert!(manager.get("bulk").await.is_none());
    assert_eq!(manager.remove("bulk", Duration::from_secs(1)).await, None);
}
