//! # lectern-core
//!
//! Core types, traits, and abstractions for the lectern extraction queue.
//!
//! This crate provides the data structures shared by the durable store
//! (`lectern-db`) and the queue/worker engine (`lectern-jobs`): job and
//! attachment models, the extraction error taxonomy, repository traits and
//! the extractor capability interface.

pub mod defaults;
pub mod error;
pub mod extraction;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use extraction::{ErrorKind, Extraction, ExtractionError};
pub use models::*;
pub use traits::*;
