//! Error types for lectern.

use thiserror::Error;

use crate::models::{AttachmentId, JobId};

/// Result type alias using lectern's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for lectern operations.
///
/// Extraction failures are not represented here. They travel as
/// [`ExtractionError`](crate::ExtractionError) values into the queue's
/// failure path and never abort a worker.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attachment not found
    #[error("Attachment not found: {0}")]
    AttachmentNotFound(AttachmentId),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Job queue or worker pool error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether this error means the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::AttachmentNotFound(_) | Error::JobNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_not_found_display() {
        let err = Error::AttachmentNotFound(42);
        assert_eq!(err.to_string(), "Attachment not found: 42");
    }

    #[test]
    fn test_job_not_found_display() {
        let err = Error::JobNotFound(7);
        assert_eq!(err.to_string(), "Job not found: 7");
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(Error::AttachmentNotFound(1).is_not_found());
        assert!(Error::JobNotFound(1).is_not_found());
        assert!(!Error::Config("bad".into()).is_not_found());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(err.to_string().starts_with("I/O error"));
    }
}
