//! Extraction outcome types and the failure taxonomy.
//!
//! Failures are tagged values rather than distinct error types so the queue
//! can persist the classification and decide retry eligibility from data.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Classification of an extraction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Extraction exceeded its time bound.
    Timeout,
    /// The source file is unreadable or malformed.
    Corruption,
    /// A tool or runtime the extractor depends on is not available.
    MissingCapability,
    /// No extractor accepts this file.
    Unsupported,
    /// Explicitly marked as not worth retrying.
    Permanent,
    /// Anything else, including panics inside an extractor.
    Unknown,
}

impl ErrorKind {
    /// Stable string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Corruption => "corruption",
            ErrorKind::MissingCapability => "missing_capability",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a failure of this kind must never be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorKind::Corruption | ErrorKind::Permanent)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(ErrorKind::Timeout),
            "corruption" => Ok(ErrorKind::Corruption),
            "missing_capability" => Ok(ErrorKind::MissingCapability),
            "unsupported" => Ok(ErrorKind::Unsupported),
            "permanent" => Ok(ErrorKind::Permanent),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// A classified extraction failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExtractionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corruption, message)
    }

    pub fn missing_capability(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingCapability, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

/// Text extracted from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub text: String,
    /// Extractor's confidence in the text, 0.0 to 1.0.
    pub confidence: f64,
    /// Extractor-specific details (encoding, page count, tool used).
    pub metadata: JsonValue,
    /// Wall time spent extracting.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl Extraction {
    /// Create an extraction result with empty metadata and zero elapsed time.
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            metadata: JsonValue::Object(Default::default()),
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Elapsed time in whole milliseconds, as stored in metrics.
    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.elapsed.as_millis()).unwrap_or(i64::MAX)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
