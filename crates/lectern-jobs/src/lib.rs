//! # lectern-jobs
//!
//! Extraction job queue and worker pool for lectern.
//!
//! This crate provides:
//! - A durable queue manager with de-duplicated enqueue, race-free claims,
//!   classified failures with escalating backoff, and stale-job recovery
//! - An extractor registry with plain-text, PDF and office-document built-ins
//! - A worker pool with heartbeats, pause/resume and graceful shutdown that
//!   hands in-flight jobs back to the queue
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use lectern_jobs::{WorkerBuilder, WorkerConfig};
//! use lectern_db::{Database, PoolConfig};
//!
//! let db = Database::open("lectern.db", PoolConfig::default()).await?;
//! db.migrate().await?;
//!
//! let worker = WorkerBuilder::new(db)
//!     .with_config(WorkerConfig::default().with_num_workers(4))
//!     .build();
//!
//! // Start the pool and keep the handle for signal-driven shutdown
//! let handle = worker.start().await?;
//! worker.enqueue(attachment_id, 0, true).await?;
//!
//! // Listen for events
//! let mut events = worker.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.stop(Duration::from_secs(60)).await;
//! ```

pub mod extractors;
pub mod manager;
pub mod pause;
pub mod queue;
pub mod registry;
pub mod status;
pub mod worker;

// Re-export core types
pub use lectern_core::*;

pub use extractors::{DocxExtractor, PdfTextExtractor, PlainTextExtractor};
pub use manager::WorkerManager;
pub use pause::PauseState;
pub use queue::{QueueEvent, QueueManager, RetryDecision, RetryPolicy};
pub use registry::ExtractorRegistry;
pub use status::{PoolStatus, ThroughputStats, WorkerSnapshot};
pub use worker::{
    idle_backoff, ExtractionWorker, ShutdownHandle, WorkerBuilder, WorkerConfig, WorkerEvent,
};
