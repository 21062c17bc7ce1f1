//! Plain text extractor for text-like formats.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use lectern_core::{Extraction, ExtractionError, Extractor};

use super::extension;

const EXTENSIONS: &[&str] = &["txt", "md", "rst", "csv", "json", "xml", "html", "htm"];

/// Extractor for plain text files.
///
/// Decodes UTF-8, falling back to Latin-1 when the bytes are not valid
/// UTF-8, and reports the encoding used along with char and line counts.
pub struct PlainTextExtractor;

fn accepts_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("text/") || mime == "application/json" || mime == "application/xml"
}

/// Decode bytes as UTF-8, or as Latin-1 when that fails.
fn decode(data: Vec<u8>) -> (String, &'static str) {
    match String::from_utf8(data) {
        Ok(text) => (text, "utf-8"),
        Err(e) => (
            e.into_bytes().into_iter().map(char::from).collect(),
            "latin-1",
        ),
    }
}

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn name(&self) -> &str {
        "plain_text"
    }

    fn can_handle(&self, path: &Path, content_type: Option<&str>) -> bool {
        let by_ext = extension(path).is_some_and(|ext| EXTENSIONS.contains(&ext.as_str()));
        by_ext || content_type.is_some_and(accepts_content_type)
    }

    async fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            ExtractionError::corruption(format!("failed to read {}: {}", path.display(), e))
        })?;

        let (text, encoding) = decode(data);
        let char_count = text.chars().count();
        let line_count = text.lines().count();

        Ok(Extraction::new(text, 1.0).with_metadata(json!({
            "encoding": encoding,
            "char_count": char_count,
            "line_count": line_count,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_can_handle_extensions() {
        let e = PlainTextExtractor;
        assert!(e.can_handle(Path::new("a.txt"), None));
        assert!(e.can_handle(Path::new("README.MD"), None));
        assert!(e.can_handle(Path::new("data.csv"), None));
        assert!(!e.can_handle(Path::new("a.pdf"), None));
        assert!(!e.can_handle(Path::new("noext"), None));
    }

    #[test]
    fn test_can_handle_content_types() {
        let e = PlainTextExtractor;
        assert!(e.can_handle(Path::new("blob"), Some("text/plain; charset=utf-8")));
        assert!(e.can_handle(Path::new("blob"), Some("application/json")));
        assert!(!e.can_handle(Path::new("blob"), Some("application/pdf")));
    }

    #[test]
    fn test_decode_latin1_fallback() {
        let (text, encoding) = decode(vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(text, "café");
        assert_eq!(encoding, "latin-1");
    }

    #[tokio::test]
    async fn test_extract_utf8() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all("Hello, world!\nLine two.".as_bytes()).unwrap();

        let extraction = PlainTextExtractor.extract(file.path()).await.unwrap();
        assert_eq!(extraction.text, "Hello, world!\nLine two.");
        assert_eq!(extraction.confidence, 1.0);
        assert_eq!(extraction.metadata["encoding"], "utf-8");
        assert_eq!(extraction.metadata["char_count"], 23);
        assert_eq!(extraction.metadata["line_count"], 2);
    }

    #[tokio::test]
    async fn test_extract_missing_file_is_corruption() {
        let err = PlainTextExtractor
            .extract(Path::new("/nonexistent/lectern/file.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, lectern_core::ErrorKind::Corruption);
    }
}
