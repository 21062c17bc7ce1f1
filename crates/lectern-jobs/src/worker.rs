//! Extraction worker pool.
//!
//! A pool owns a fixed number of worker units plus one heartbeat loop. Each
//! unit claims jobs from the [`QueueManager`], runs the matching extractor on
//! its own task under a timeout, and reports the outcome back to the queue.
//! Per-unit state is kept in memory behind a single lock; all cross-worker
//! coordination goes through the store.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lectern_core::defaults::{
    EVENT_BUS_CAPACITY, EXTRACTION_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, JOB_MAX_RETRIES,
    MAX_POLL_BACKOFF_MS, MIN_POLL_INTERVAL_MS, PAUSED_POLL_MS, POLL_BACKOFF_FACTOR,
    POLL_BACKOFF_MAX_STEPS, POLL_INTERVAL_MS, STALE_JOB_THRESHOLD_SECS, WORKER_COUNT,
    WORKER_POOL_NAME,
};
use lectern_core::{
    AttachmentId, AttachmentRepository, ErrorKind, Extraction, ExtractionError, Extractor,
    HeartbeatRepository, Job, JobHistoryEntry, JobId, Result, WorkerHeartbeat, WorkerState,
};
use lectern_db::Database;

use crate::pause::PauseState;
use crate::queue::{QueueEvent, QueueManager, RetryPolicy};
use crate::registry::ExtractorRegistry;
use crate::status::{PoolStatus, ThroughputStats, WorkerSnapshot};

/// Configuration for an extraction worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix of every worker id in the pool.
    pub pool_name: String,
    /// Number of worker units.
    pub num_workers: usize,
    /// Retry ceiling passed to `failed`.
    pub max_retries: i32,
    /// Bound on a single extraction.
    pub extraction_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Base idle poll interval.
    pub poll_interval: Duration,
    /// Ceiling for the idle backoff.
    pub max_poll_backoff: Duration,
    /// Processing jobs older than this are reset when the pool starts.
    pub stale_threshold: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_name: WORKER_POOL_NAME.to_string(),
            num_workers: WORKER_COUNT,
            max_retries: JOB_MAX_RETRIES,
            extraction_timeout: Duration::from_secs(EXTRACTION_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            max_poll_backoff: Duration::from_millis(MAX_POLL_BACKOFF_MS),
            stale_threshold: Duration::from_secs(STALE_JOB_THRESHOLD_SECS),
            retry_policy: RetryPolicy::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EXTRACTION_WORKERS` | `2` | Worker units (min 1) |
    /// | `EXTRACTION_MAX_RETRIES` | `3` | Retry ceiling |
    /// | `EXTRACTION_TIMEOUT_SECS` | `300` | Per-extraction bound (min 1) |
    /// | `EXTRACTION_HEARTBEAT_SECS` | `10` | Heartbeat interval (min 1) |
    /// | `EXTRACTION_POLL_INTERVAL_MS` | `1000` | Base idle poll (min 100) |
    /// | `EXTRACTION_STALE_THRESHOLD_SECS` | `1800` | Stale job age at startup sweep |
    /// | `EXTRACTION_POOL_NAME` | `extract` | Worker id prefix |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let num_workers = env_parse::<usize>("EXTRACTION_WORKERS")
            .unwrap_or(WORKER_COUNT)
            .max(1);

        let max_retries = env_parse::<i32>("EXTRACTION_MAX_RETRIES")
            .unwrap_or(JOB_MAX_RETRIES)
            .max(0);

        let extraction_timeout = Duration::from_secs(
            env_parse::<u64>("EXTRACTION_TIMEOUT_SECS")
                .unwrap_or(EXTRACTION_TIMEOUT_SECS)
                .max(1),
        );

        let heartbeat_interval = Duration::from_secs(
            env_parse::<u64>("EXTRACTION_HEARTBEAT_SECS")
                .unwrap_or(HEARTBEAT_INTERVAL_SECS)
                .max(1),
        );

        let poll_interval = Duration::from_millis(
            env_parse::<u64>("EXTRACTION_POLL_INTERVAL_MS")
                .unwrap_or(POLL_INTERVAL_MS)
                .max(MIN_POLL_INTERVAL_MS),
        );

        let stale_threshold = Duration::from_secs(
            env_parse::<u64>("EXTRACTION_STALE_THRESHOLD_SECS")
                .unwrap_or(STALE_JOB_THRESHOLD_SECS),
        );

        let pool_name = std::env::var("EXTRACTION_POOL_NAME")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.pool_name);

        Self {
            pool_name,
            num_workers,
            max_retries,
            extraction_timeout,
            heartbeat_interval,
            poll_interval,
            max_poll_backoff: defaults.max_poll_backoff,
            stale_threshold,
            retry_policy: defaults.retry_policy,
        }
    }

    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Set the number of worker units (min 1).
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }

    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_backoff(mut self, max: Duration) -> Self {
        self.max_poll_backoff = max;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Idle wait after `empty_polls` consecutive empty claims.
///
/// `min(poll * 1.5^min(empty_polls, 5), max)`.
pub fn idle_backoff(poll: Duration, empty_polls: u32, max: Duration) -> Duration {
    let steps = empty_polls.min(POLL_BACKOFF_MAX_STEPS) as i32;
    poll.mul_f64(POLL_BACKOFF_FACTOR.powi(steps)).min(max)
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker unit started.
    WorkerStarted { worker_id: String },
    /// A worker unit exited its loop.
    WorkerStopped { worker_id: String },
    /// A unit began processing a job.
    JobStarted {
        worker_id: String,
        job_id: JobId,
        attachment_id: AttachmentId,
    },
    /// A job completed successfully.
    JobCompleted {
        worker_id: String,
        job_id: JobId,
        attachment_id: AttachmentId,
        elapsed_ms: i64,
        confidence: f64,
    },
    /// An attempt failed.
    JobFailed {
        worker_id: String,
        job_id: JobId,
        attachment_id: AttachmentId,
        kind: ErrorKind,
        error: String,
    },
    /// A job was handed back to the queue during shutdown.
    JobReleased { worker_id: String, job_id: JobId },
}

/// In-memory state of one worker unit.
#[derive(Debug, Clone)]
struct UnitState {
    worker_id: String,
    state: WorkerState,
    current_job_id: Option<JobId>,
    jobs_completed: i64,
    jobs_failed: i64,
    started_at: DateTime<Utc>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl UnitState {
    fn new(worker_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            state: WorkerState::Starting,
            current_job_id: None,
            jobs_completed: 0,
            jobs_failed: 0,
            started_at,
            last_heartbeat: None,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            state: self.state,
            current_job_id: self.current_job_id,
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat,
        }
    }

    fn heartbeat(&self, now: DateTime<Utc>) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            last_heartbeat: now,
            status: self.state,
            current_job_id: self.current_job_id,
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct PoolState {
    running: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    units: Vec<UnitState>,
    unit_tasks: Vec<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
    succeeded: u64,
    failed: u64,
    total_extraction_ms: u64,
}

struct PoolInner {
    db: Database,
    queue: QueueManager,
    registry: Arc<ExtractorRegistry>,
    config: WorkerConfig,
    pause: PauseState,
    state: Mutex<PoolState>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

/// Result of running one claimed job through an extractor.
enum Execution {
    Extracted(Extraction),
    Failed(ExtractionError),
    /// Shutdown arrived while the extraction was running.
    Interrupted,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn is_shutting_down(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn update_unit(&self, index: usize, f: impl FnOnce(&mut UnitState)) {
        if let Some(unit) = self.lock_state().units.get_mut(index) {
            f(unit);
        }
    }

    /// Validate the attachment and its file before handing it to an extractor.
    async fn prepare(
        &self,
        job: &Job,
    ) -> std::result::Result<(PathBuf, Option<String>), ExtractionError> {
        let attachment = match self.db.attachments.get(job.attachment_id).await {
            Ok(Some(attachment)) => attachment,
            Ok(None) => {
                return Err(ExtractionError::corruption(format!(
                    "attachment {} not found",
                    job.attachment_id
                )))
            }
            Err(e) => {
                return Err(ExtractionError::unknown(format!(
                    "failed to load attachment {}: {}",
                    job.attachment_id, e
                )))
            }
        };

        let path = PathBuf::from(&attachment.path);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtractionError::corruption(format!("file not found: {}", path.display()))
            } else {
                ExtractionError::corruption(format!("file unreadable: {}: {}", path.display(), e))
            }
        })?;

        if !metadata.is_file() {
            return Err(ExtractionError::corruption(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        if metadata.len() == 0 {
            return Err(ExtractionError::corruption(format!(
                "file is empty: {}",
                path.display()
            )));
        }

        Ok((path, attachment.content_type))
    }

    /// Run the extraction on its own task, bounded by the configured timeout
    /// and abandoned if shutdown arrives first.
    async fn execute(&self, job: &Job, shutdown: &mut watch::Receiver<bool>) -> Execution {
        let (path, content_type) = match self.prepare(job).await {
            Ok(prepared) => prepared,
            Err(e) => return Execution::Failed(e),
        };

        let registry = self.registry.clone();
        let mut task =
            tokio::spawn(async move { registry.extract(&path, content_type.as_deref()).await });
        let timeout = self.config.extraction_timeout;

        tokio::select! {
            res = tokio::time::timeout(timeout, &mut task) => match res {
                Ok(Ok(Ok(extraction))) => Execution::Extracted(extraction),
                Ok(Ok(Err(e))) => Execution::Failed(e),
                Ok(Err(join_err)) => {
                    let message = if join_err.is_panic() {
                        format!("extractor panicked: {}", panic_message(&*join_err.into_panic()))
                    } else {
                        format!("extraction task cancelled: {}", join_err)
                    };
                    Execution::Failed(ExtractionError::unknown(message))
                }
                Err(_) => {
                    task.abort();
                    Execution::Failed(ExtractionError::timeout(format!(
                        "extraction exceeded timeout of {:?}",
                        timeout
                    )))
                }
            },
            _ = wait_for_shutdown(shutdown) => {
                task.abort();
                Execution::Interrupted
            }
        }
    }

    /// Report a successful extraction. Returns true when the job completed.
    async fn report_success(
        &self,
        index: usize,
        worker_id: &str,
        job: &Job,
        extraction: Extraction,
    ) -> bool {
        let elapsed_ms = extraction.elapsed_ms();

        if let Err(e) = self
            .db
            .attachments
            .update_extraction(job.attachment_id, &extraction.text, extraction.confidence)
            .await
        {
            error!(
                subsystem = "jobs",
                component = "worker",
                worker_id,
                job_id = job.id,
                error = %e,
                "Failed to store extracted text"
            );
            let failure = ExtractionError::unknown(format!("failed to store extracted text: {}", e));
            self.report_failure(index, worker_id, job, failure, elapsed_ms)
                .await;
            return false;
        }

        match self
            .queue
            .complete(job.id, worker_id, elapsed_ms, Some(extraction.confidence))
            .await
        {
            Ok(true) => {
                {
                    let mut state = self.lock_state();
                    state.succeeded += 1;
                    state.total_extraction_ms += u64::try_from(elapsed_ms).unwrap_or(0);
                    if let Some(unit) = state.units.get_mut(index) {
                        unit.jobs_completed += 1;
                    }
                }
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    worker_id,
                    job_id = job.id,
                    attachment_id = job.attachment_id,
                    duration_ms = elapsed_ms,
                    confidence = extraction.confidence,
                    chars = extraction.text.len(),
                    "Extraction completed"
                );
                self.emit(WorkerEvent::JobCompleted {
                    worker_id: worker_id.to_string(),
                    job_id: job.id,
                    attachment_id: job.attachment_id,
                    elapsed_ms,
                    confidence: extraction.confidence,
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    worker_id,
                    job_id = job.id,
                    error = %e,
                    "Failed to mark job as completed"
                );
                false
            }
        }
    }

    async fn report_failure(
        &self,
        index: usize,
        worker_id: &str,
        job: &Job,
        failure: ExtractionError,
        elapsed_ms: i64,
    ) {
        let recorded = self
            .queue
            .failed(
                job.id,
                worker_id,
                &failure.message,
                failure.kind,
                self.config.max_retries,
                elapsed_ms,
            )
            .await;

        match recorded {
            Ok(true) => {
                {
                    let mut state = self.lock_state();
                    state.failed += 1;
                    if let Some(unit) = state.units.get_mut(index) {
                        unit.jobs_failed += 1;
                    }
                }
                self.emit(WorkerEvent::JobFailed {
                    worker_id: worker_id.to_string(),
                    job_id: job.id,
                    attachment_id: job.attachment_id,
                    kind: failure.kind,
                    error: failure.message,
                });
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    worker_id,
                    job_id = job.id,
                    error = %e,
                    "Failed to record job failure"
                );
            }
        }
    }

    async fn release_job(&self, worker_id: &str, job_id: JobId) {
        match self.queue.release(job_id).await {
            Ok(true) => self.emit(WorkerEvent::JobReleased {
                worker_id: worker_id.to_string(),
                job_id,
            }),
            Ok(false) => {}
            Err(e) => error!(
                subsystem = "jobs",
                component = "worker",
                worker_id,
                job_id,
                error = %e,
                "Failed to release job"
            ),
        }
    }

    /// Process one claimed job. Returns false when the unit should exit.
    async fn run_job(
        &self,
        index: usize,
        worker_id: &str,
        job: Job,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        self.update_unit(index, |unit| {
            unit.state = WorkerState::Processing;
            unit.current_job_id = Some(job.id);
        });
        self.emit(WorkerEvent::JobStarted {
            worker_id: worker_id.to_string(),
            job_id: job.id,
            attachment_id: job.attachment_id,
        });
        debug!(
            subsystem = "jobs",
            component = "worker",
            worker_id,
            job_id = job.id,
            attachment_id = job.attachment_id,
            retry_count = job.retry_count,
            "Processing job"
        );

        let started = Instant::now();
        let execution = match AssertUnwindSafe(self.execute(&job, shutdown))
            .catch_unwind()
            .await
        {
            Ok(execution) => execution,
            Err(payload) => Execution::Failed(ExtractionError::unknown(format!(
                "worker panicked: {}",
                panic_message(&*payload)
            ))),
        };
        let wall_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let keep_running = match execution {
            Execution::Extracted(extraction) => {
                let extraction = if extraction.elapsed.is_zero() {
                    extraction.with_elapsed(started.elapsed())
                } else {
                    extraction
                };
                self.report_success(index, worker_id, &job, extraction)
                    .await;
                true
            }
            Execution::Failed(failure) => {
                self.report_failure(index, worker_id, &job, failure, wall_ms)
                    .await;
                true
            }
            Execution::Interrupted => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    worker_id,
                    job_id = job.id,
                    "Shutdown during extraction, releasing job"
                );
                self.release_job(worker_id, job.id).await;
                false
            }
        };

        self.update_unit(index, |unit| {
            unit.current_job_id = None;
            if unit.state == WorkerState::Processing {
                unit.state = WorkerState::Idle;
            }
        });
        keep_running
    }

    /// Upsert one heartbeat row per unit.
    async fn write_heartbeats(&self) {
        let now = Utc::now();
        let beats: Vec<WorkerHeartbeat> = self
            .lock_state()
            .units
            .iter()
            .map(|unit| unit.heartbeat(now))
            .collect();

        for beat in beats {
            match self.db.heartbeats.upsert(&beat).await {
                Ok(()) => {
                    let mut state = self.lock_state();
                    if let Some(unit) = state
                        .units
                        .iter_mut()
                        .find(|u| u.worker_id == beat.worker_id)
                    {
                        unit.last_heartbeat = Some(now);
                    }
                }
                Err(e) => warn!(
                    subsystem = "jobs",
                    component = "heartbeat",
                    worker_id = %beat.worker_id,
                    error = %e,
                    "Failed to write heartbeat"
                ),
            }
        }
    }
}

async fn run_unit(
    inner: Arc<PoolInner>,
    index: usize,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    inner.update_unit(index, |unit| unit.state = WorkerState::Idle);
    inner.emit(WorkerEvent::WorkerStarted {
        worker_id: worker_id.clone(),
    });
    info!(
        subsystem = "jobs",
        component = "worker",
        worker_id = %worker_id,
        "Worker started"
    );

    let notify = inner.queue.job_notify();
    let paused_poll = Duration::from_millis(PAUSED_POLL_MS);
    let mut empty_polls: u32 = 0;

    while !is_shutting_down(&shutdown) {
        if inner.pause.is_paused() {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {}
                _ = sleep(paused_poll) => {}
            }
            continue;
        }

        // Registered before the claim so an enqueue in between still wakes us.
        let notified = notify.notified();

        let job = match inner.queue.claim(&worker_id).await {
            Ok(job) => job,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to claim job"
                );
                None
            }
        };

        match job {
            Some(job) => {
                empty_polls = 0;
                if !inner.run_job(index, &worker_id, job, &mut shutdown).await {
                    break;
                }
            }
            None => {
                let wait = idle_backoff(
                    inner.config.poll_interval,
                    empty_polls,
                    inner.config.max_poll_backoff,
                );
                empty_polls = empty_polls.saturating_add(1);
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => {}
                    _ = notified => empty_polls = 0,
                    _ = sleep(wait) => {}
                }
            }
        }
    }

    inner.update_unit(index, |unit| unit.state = WorkerState::Stopped);
    inner.emit(WorkerEvent::WorkerStopped {
        worker_id: worker_id.clone(),
    });
    info!(
        subsystem = "jobs",
        component = "worker",
        worker_id = %worker_id,
        "Worker stopped"
    );
}

async fn run_heartbeat(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => inner.write_heartbeats().await,
        }
    }
}

/// A pool of extraction worker units.
#[derive(Clone)]
pub struct ExtractionWorker {
    inner: Arc<PoolInner>,
}

impl ExtractionWorker {
    /// Create a stopped pool.
    pub fn new(db: Database, registry: Arc<ExtractorRegistry>, config: WorkerConfig) -> Self {
        let queue = QueueManager::new(db.clone()).with_policy(config.retry_policy.clone());
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                db,
                queue,
                registry,
                config,
                pause: PauseState::new(),
                state: Mutex::new(PoolState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &QueueManager {
        &self.inner.queue
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn registry(&self) -> &Arc<ExtractorRegistry> {
        &self.inner.registry
    }

    /// Start the pool and return a handle for signal-driven shutdown.
    ///
    /// Idempotent. Stale jobs left behind by a previous run are reset to
    /// pending before any unit starts claiming.
    pub async fn start(&self) -> Result<ShutdownHandle> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.lock_state().running {
            debug!(
                subsystem = "jobs",
                pool = %self.inner.config.pool_name,
                "Pool already running"
            );
            return Ok(self.shutdown_handle());
        }

        let config = &self.inner.config;
        let needed = u32::try_from(config.num_workers + 2).unwrap_or(u32::MAX);
        let max_connections = self.inner.db.pool().options().get_max_connections();
        if max_connections < needed {
            warn!(
                subsystem = "jobs",
                pool = %config.pool_name,
                max_connections,
                needed,
                "Store pool is smaller than workers + 2, units may wait for connections"
            );
        }

        let reset = self
            .inner
            .queue
            .cleanup_stale_jobs(config.stale_threshold)
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let now = Utc::now();
        let worker_ids: Vec<String> = (0..config.num_workers)
            .map(|i| {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("{}-{}-{}", config.pool_name, i, &suffix[..8])
            })
            .collect();

        {
            let mut state = self.inner.lock_state();
            *state = PoolState {
                running: true,
                shutdown_tx: Some(shutdown_tx),
                units: worker_ids
                    .iter()
                    .map(|id| UnitState::new(id.clone(), now))
                    .collect(),
                started_at: Some(Instant::now()),
                ..PoolState::default()
            };
            for (index, worker_id) in worker_ids.into_iter().enumerate() {
                state.unit_tasks.push(tokio::spawn(run_unit(
                    self.inner.clone(),
                    index,
                    worker_id,
                    shutdown_rx.clone(),
                )));
            }
            state.heartbeat_task = Some(tokio::spawn(run_heartbeat(
                self.inner.clone(),
                shutdown_rx,
            )));
        }

        info!(
            subsystem = "jobs",
            pool = %config.pool_name,
            num_workers = config.num_workers,
            max_retries = config.max_retries,
            timeout_secs = config.extraction_timeout.as_secs(),
            stale_reset = reset,
            "Worker pool started"
        );
        Ok(self.shutdown_handle())
    }

    /// Stop the pool, waiting up to `timeout` for units to exit.
    ///
    /// Jobs still held by a unit are released back to pending. Returns
    /// whether every unit stopped in time; late units are aborted.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (shutdown_tx, unit_tasks, heartbeat_task) = {
            let mut state = self.inner.lock_state();
            if !state.running {
                return true;
            }
            state.running = false;
            for unit in state.units.iter_mut() {
                if unit.state != WorkerState::Stopped {
                    unit.state = WorkerState::Stopping;
                }
            }
            (
                state.shutdown_tx.take(),
                std::mem::take(&mut state.unit_tasks),
                state.heartbeat_task.take(),
            )
        };

        let pool_name = &self.inner.config.pool_name;
        info!(
            subsystem = "jobs",
            pool = %pool_name,
            timeout_secs = timeout.as_secs(),
            "Stopping worker pool"
        );
        if let Some(tx) = &shutdown_tx {
            let _ = tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_stopped = true;
        for (index, mut handle) in unit_tasks.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    subsystem = "jobs",
                    pool = %pool_name,
                    unit = index,
                    error = %e,
                    "Worker unit ended abnormally"
                ),
                Err(_) => {
                    warn!(
                        subsystem = "jobs",
                        pool = %pool_name,
                        unit = index,
                        "Worker unit did not stop in time, aborting"
                    );
                    handle.abort();
                    let _ = handle.await;
                    all_stopped = false;
                }
            }
        }

        if let Some(mut handle) = heartbeat_task {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let leftovers: Vec<(String, JobId)> = {
            let mut state = self.inner.lock_state();
            state
                .units
                .iter_mut()
                .filter_map(|unit| {
                    unit.state = WorkerState::Stopped;
                    unit.current_job_id
                        .take()
                        .map(|job_id| (unit.worker_id.clone(), job_id))
                })
                .collect()
        };
        for (worker_id, job_id) in leftovers {
            self.inner.release_job(&worker_id, job_id).await;
        }

        self.inner.write_heartbeats().await;
        drop(shutdown_tx);

        if all_stopped {
            info!(subsystem = "jobs", pool = %pool_name, "Worker pool stopped");
        } else {
            warn!(
                subsystem = "jobs",
                pool = %pool_name,
                "Worker pool stopped with units aborted after timeout"
            );
        }
        all_stopped
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            worker: self.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    /// Stop claiming new jobs; in-flight jobs finish normally.
    pub fn pause(&self) -> bool {
        self.inner.pause.pause()
    }

    pub fn resume(&self) -> bool {
        self.inner.pause.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pause.is_paused()
    }

    /// Compose queue statistics with in-memory unit state.
    pub async fn get_status(&self) -> Result<PoolStatus> {
        let (running, workers, stats) = {
            let state = self.inner.lock_state();
            let uptime_secs = state
                .started_at
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            (
                state.running,
                state.units.iter().map(UnitState::snapshot).collect::<Vec<_>>(),
                ThroughputStats::compute(
                    state.succeeded,
                    state.failed,
                    state.total_extraction_ms,
                    uptime_secs,
                ),
            )
        };
        let queue = self.inner.queue.stats().await?;

        Ok(PoolStatus {
            pool_name: self.inner.config.pool_name.clone(),
            running,
            paused: self.is_paused(),
            num_workers: self.inner.config.num_workers,
            active_workers: workers
                .iter()
                .filter(|w| w.current_job_id.is_some())
                .count(),
            queue_depth: queue.queue_depth(),
            processing: queue.processing,
            workers,
            stats,
            queue,
        })
    }

    /// Get a receiver for worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get a receiver for queue events.
    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.queue.subscribe()
    }

    pub async fn enqueue(
        &self,
        attachment_id: AttachmentId,
        priority: i32,
        deduplicate: bool,
    ) -> Result<Option<JobId>> {
        self.inner
            .queue
            .enqueue(attachment_id, priority, deduplicate)
            .await
    }

    pub async fn enqueue_batch(
        &self,
        attachment_ids: &[AttachmentId],
        priority: i32,
        deduplicate: bool,
    ) -> Result<Vec<JobId>> {
        self.inner
            .queue
            .enqueue_batch(attachment_ids, priority, deduplicate)
            .await
    }

    pub async fn retry_failed(&self, job_id: Option<JobId>) -> Result<u64> {
        self.inner.queue.retry_failed(job_id).await
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<JobHistoryEntry>> {
        self.inner.queue.recent_jobs(limit).await
    }

    pub async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        self.inner.queue.failed_jobs(limit).await
    }
}

/// Cloneable handle returned by [`ExtractionWorker::start`], for use by a
/// process-level signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    worker: ExtractionWorker,
}

impl ShutdownHandle {
    /// Same as [`ExtractionWorker::stop`].
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.worker.stop(timeout).await
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

/// Builder for creating an extraction worker pool.
pub struct WorkerBuilder {
    db: Database,
    config: WorkerConfig,
    registry: Option<Arc<ExtractorRegistry>>,
    extractors: Vec<Arc<dyn Extractor>>,
}

impl WorkerBuilder {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            config: WorkerConfig::default(),
            registry: None,
            extractors: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given registry instead of the built-ins.
    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Share a registry with other pools.
    pub fn with_shared_registry(mut self, registry: Arc<ExtractorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a custom extractor ahead of the registry's existing ones.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Build the (stopped) pool.
    pub fn build(self) -> ExtractionWorker {
        let registry = match (self.registry, self.extractors.is_empty()) {
            (Some(registry), true) => registry,
            (registry, _) => {
                let mut owned = registry
                    .map(|r| (*r).clone())
                    .unwrap_or_else(ExtractorRegistry::with_builtins);
                for extractor in self.extractors {
                    owned.register(extractor);
                }
                Arc::new(owned)
            }
        };
        ExtractionWorker::new(self.db, registry, self.config)
    }
}
