//! Office document extractor backed by pandoc.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use lectern_core::defaults::{DOCUMENT_CONVERT_CONFIDENCE, EXTRACTION_CMD_TIMEOUT_SECS};
use lectern_core::{Extraction, ExtractionError, Extractor};

use super::{extension, program_available, run_command};

const PROGRAM: &str = "pandoc";

/// Extractor for docx, odt and rtf documents.
pub struct DocxExtractor {
    command_timeout: Duration,
}

impl DocxExtractor {
    pub fn new() -> Self {
        Self {
            command_timeout: Duration::from_secs(EXTRACTION_CMD_TIMEOUT_SECS),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

impl Default for DocxExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Pandoc input format from the file extension.
fn format_from_extension(path: &Path) -> Option<&'static str> {
    match extension(path)?.as_str() {
        "docx" => Some("docx"),
        "odt" => Some("odt"),
        "rtf" => Some("rtf"),
        _ => None,
    }
}

/// Pandoc input format from the MIME type.
fn format_from_mime(content_type: &str) -> Option<&'static str> {
    match content_type {
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        "application/vnd.oasis.opendocument.text" => Some("odt"),
        "application/rtf" | "text/rtf" => Some("rtf"),
        _ => None,
    }
}

#[async_trait]
impl Extractor for DocxExtractor {
    fn name(&self) -> &str {
        "docx"
    }

    fn can_handle(&self, path: &Path, content_type: Option<&str>) -> bool {
        format_from_extension(path).is_some() || content_type.and_then(format_from_mime).is_some()
    }

    async fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        // The registry only routes handled files here; default to docx for
        // direct callers.
        let format = format_from_extension(path).unwrap_or("docx");

        let stdout = run_command(
            PROGRAM,
            &[
                OsStr::new("--from"),
                OsStr::new(format),
                OsStr::new("--to"),
                OsStr::new("plain"),
                OsStr::new("--wrap=none"),
                path.as_os_str(),
            ],
            self.command_timeout,
        )
        .await?;
        let text = String::from_utf8_lossy(&stdout).into_owned();

        let metadata = json!({
            "format": format,
            "char_count": text.chars().count(),
            "line_count": text.lines().count(),
        });
        Ok(Extraction::new(text, DOCUMENT_CONVERT_CONFIDENCE).with_metadata(metadata))
    }

    async fn health_check(&self) -> bool {
        program_available(PROGRAM, "--version").await
    }
}
