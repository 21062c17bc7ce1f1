//! PDF text extractor backed by `pdftotext` (poppler-utils).

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::debug;

use lectern_core::defaults::EXTRACTION_CMD_TIMEOUT_SECS;
use lectern_core::{Extraction, ExtractionError, Extractor};

use super::{extension, program_available, run_command};

const PROGRAM: &str = "pdftotext";

/// Extractor for PDF files with a text layer.
///
/// A PDF without a text layer (typically a scan) is not a failure here: the
/// extraction succeeds with empty text, confidence 0.0 and
/// `metadata["needs_ocr"] = true`, so its job completes rather than failing as
/// corrupt. Consumers that need text should look at the confidence or the
/// `needs_ocr` flag and route such documents to OCR.
pub struct PdfTextExtractor {
    command_timeout: Duration,
}

impl PdfTextExtractor {
    pub fn new() -> Self {
        Self {
            command_timeout: Duration::from_secs(EXTRACTION_CMD_TIMEOUT_SECS),
        }
    }

    /// Override the per-command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

impl Default for PdfTextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Check the `%PDF` magic bytes.
async fn has_pdf_header(path: &Path) -> Result<bool, ExtractionError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        ExtractionError::corruption(format!("failed to open {}: {}", path.display(), e))
    })?;
    let mut header = [0u8; 4];
    match file.read_exact(&mut header).await {
        Ok(_) => Ok(&header == b"%PDF"),
        Err(_) => Ok(false),
    }
}

#[async_trait]
impl Extractor for PdfTextExtractor {
    fn name(&self) -> &str {
        "pdf_text"
    }

    fn can_handle(&self, path: &Path, content_type: Option<&str>) -> bool {
        extension(path).as_deref() == Some("pdf") || content_type == Some("application/pdf")
    }

    async fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        if !has_pdf_header(path).await? {
            return Err(ExtractionError::corruption(format!(
                "{} is not a valid PDF (missing %PDF header)",
                path.display()
            )));
        }

        let stdout = run_command(
            PROGRAM,
            &[OsStr::new("-layout"), path.as_os_str(), OsStr::new("-")],
            self.command_timeout,
        )
        .await?;
        let text = String::from_utf8_lossy(&stdout).into_owned();

        let char_count = text.chars().count();
        let line_count = text.lines().count();
        if text.trim().is_empty() {
            debug!(path = %path.display(), "PDF has no text layer");
            return Ok(Extraction::new(text, 0.0).with_metadata(json!({
                "needs_ocr": true,
                "char_count": char_count,
                "line_count": line_count,
            })));
        }

        Ok(Extraction::new(text, 1.0).with_metadata(json!({
            "needs_ocr": false,
            "char_count": char_count,
            "line_count": line_count,
        })))
    }

    async fn health_check(&self) -> bool {
        program_available(PROGRAM, "-v").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_pdf_text_name() {
        assert_eq!(PdfTextExtractor::new().name(), "pdf_text");
    }

    #[test]
    fn test_can_handle() {
        let e = PdfTextExtractor::new();
        assert!(e.can_handle(Path::new("a.pdf"), None));
        assert!(e.can_handle(Path::new("a.PDF"), None));
        assert!(e.can_handle(Path::new("blob"), Some("application/pdf")));
        assert!(!e.can_handle(Path::new("a.txt"), Some("text/plain")));
    }

    #[tokio::test]
    async fn test_invalid_pdf_is_corruption() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"not a pdf at all").unwrap();

        let err = PdfTextExtractor::new()
            .extract(file.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corruption);
        assert!(err.message.contains("%PDF"));
    }

    #[tokio::test]
    async fn test_short_file_is_corruption() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"%P").unwrap();

        let err = PdfTextExtractor::new()
            .extract(file.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corruption);
    }

    #[tokio::test]
    async fn test_pdf_text_extraction() {
        let extractor = PdfTextExtractor::new();
        if !extractor.health_check().await {
            eprintln!("Skipping test_pdf_text_extraction: pdftotext not installed");
            return;
        }

        let pdf_bytes = b"%PDF-1.0
1 0 obj
<< /Type /Catalog /Pages 2 0 R >>
endobj

2 0 obj
<< /Type /Pages /Kids [3 0 R] /Count 1 >>
endobj

3 0 obj
<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792]
   /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>
endobj

4 0 obj
<< /Length 44 >>
stream
BT /F1 12 Tf 100 700 Td (Hello World) Tj ET
endstream
endobj

5 0 obj
<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>
endobj

xref
0 6
0000000000 65535 f
0000000009 00000 n
0000000058 00000 n
0000000115 00000 n
0000000266 00000 n
0000000360 00000 n

trailer
<< /Size 6 /Root 1 0 R >>
startxref
434
%%EOF";
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(pdf_bytes).unwrap();

        let extraction = extractor.extract(file.path()).await.unwrap();
        assert!(extraction.text.contains("Hello World"));
        assert_eq!(extraction.metadata["needs_ocr"], false);
    }

    #[tokio::test]
    async fn test_pdf_without_text_layer_needs_ocr() {
        let extractor = PdfTextExtractor::new();
        if !extractor.health_check().await {
            eprintln!("Skipping test_pdf_without_text_layer_needs_ocr: pdftotext not installed");
            return;
        }

        let pdf_bytes = b"%PDF-1.0
1 0 obj
<< /Type /Catalog /Pages 2 0 R >>
endobj
2 0 obj
<< /Type /Pages /Kids [3 0 R] /Count 1 >>
endobj
3 0 obj
<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>
endobj
xref
0 4
0000000000 65535 f 
0000000009 00000 n 
0000000058 00000 n 
0000000115 00000 n 
trailer
<< /Size 4 /Root 1 0 R >>
startxref
186
%%EOF";
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(pdf_bytes).unwrap();

        let extraction = extractor.extract(file.path()).await.unwrap();
        assert!(extraction.text.trim().is_empty());
        assert_eq!(extraction.confidence, 0.0);
        assert_eq!(extraction.metadata["needs_ocr"], true);
    }
}
