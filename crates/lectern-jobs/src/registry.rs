//! Extractor registry for dispatching files to extraction strategies.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use lectern_core::{Extraction, ExtractionError, Extractor};

use crate::extractors::{DocxExtractor, PdfTextExtractor, PlainTextExtractor};

/// Ordered set of extractors.
///
/// Custom extractors are consulted before built-ins, most recently
/// registered first. The first extractor whose `can_handle` accepts a file
/// wins.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    custom: Vec<Arc<dyn Extractor>>,
    builtin: Vec<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the plain-text, PDF and office-document
    /// extractors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin(Arc::new(PlainTextExtractor));
        registry.register_builtin(Arc::new(PdfTextExtractor::new()));
        registry.register_builtin(Arc::new(DocxExtractor::new()));
        registry
    }

    /// Register a custom extractor. It takes precedence over everything
    /// registered before it.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.custom.insert(0, extractor);
    }

    /// Append a built-in extractor to the fallback list.
    pub fn register_builtin(&mut self, extractor: Arc<dyn Extractor>) {
        self.builtin.push(extractor);
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Extractor>> {
        self.custom.iter().chain(self.builtin.iter())
    }

    /// Find the extractor for a file.
    pub fn resolve(
        &self,
        path: &Path,
        content_type: Option<&str>,
    ) -> Result<Arc<dyn Extractor>, ExtractionError> {
        self.ordered()
            .find(|e| e.can_handle(path, content_type))
            .cloned()
            .ok_or_else(|| {
                ExtractionError::unsupported(format!(
                    "no extractor for {} ({})",
                    path.display(),
                    content_type.unwrap_or("unknown type")
                ))
            })
    }

    /// Resolve and run the extractor for a file.
    pub async fn extract(
        &self,
        path: &Path,
        content_type: Option<&str>,
    ) -> Result<Extraction, ExtractionError> {
        let extractor = self.resolve(path, content_type)?;
        let started = Instant::now();
        let extraction = extractor.extract(path).await?;
        if extraction.elapsed.is_zero() {
            Ok(extraction.with_elapsed(started.elapsed()))
        } else {
            Ok(extraction)
        }
    }

    /// Extractor names in resolution order.
    pub fn names(&self) -> Vec<String> {
        self.ordered().map(|e| e.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.custom.len() + self.builtin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run health checks on all registered extractors.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(self.len());
        for extractor in self.ordered() {
            results.push((extractor.name().to_string(), extractor.health_check().await));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lectern_core::ErrorKind;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixed {
        name: &'static str,
        ext: &'static str,
    }

    #[async_trait]
    impl Extractor for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, path: &Path, _content_type: Option<&str>) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some(self.ext)
        }

        async fn extract(&self, _path: &Path) -> Result<Extraction, ExtractionError> {
            Ok(Extraction::new(self.name, 0.5))
        }
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = ExtractorRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_builtins_order() {
        let registry = ExtractorRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["plain_text", "pdf_text", "docx"]);
    }

    #[test]
    fn test_resolve_by_extension() {
        let registry = ExtractorRegistry::with_builtins();
        let e = registry.resolve(Path::new("notes.md"), None).unwrap();
        assert_eq!(e.name(), "plain_text");
        let e = registry.resolve(Path::new("paper.pdf"), None).unwrap();
        assert_eq!(e.name(), "pdf_text");
        let e = registry.resolve(Path::new("report.docx"), None).unwrap();
        assert_eq!(e.name(), "docx");
    }

    #[test]
    fn test_resolve_by_content_type() {
        let registry = ExtractorRegistry::with_builtins();
        let e = registry
            .resolve(Path::new("blob"), Some("application/pdf"))
            .unwrap();
        assert_eq!(e.name(), "pdf_text");
    }

    #[test]
    fn test_resolve_unsupported() {
        let registry = ExtractorRegistry::with_builtins();
        let err = registry
            .resolve(Path::new("image.png"), Some("image/png"))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn test_custom_before_builtin_most_recent_first() {
        let mut registry = ExtractorRegistry::with_builtins();
        registry.register(Arc::new(Fixed {
            name: "first",
            ext: "txt",
        }));
        registry.register(Arc::new(Fixed {
            name: "second",
            ext: "txt",
        }));

        let e = registry.resolve(Path::new("a.txt"), None).unwrap();
        assert_eq!(e.name(), "second");
        assert_eq!(registry.names()[..2], ["second", "first"]);
        assert_eq!(registry.len(), 5);
    }

    #[tokio::test]
    async fn test_extract_stamps_elapsed() {
        let mut registry = ExtractorRegistry::new();
        registry.register(Arc::new(Fixed {
            name: "fixed",
            ext: "bin",
        }));

        let extraction = registry
            .extract(&PathBuf::from("x.bin"), None)
            .await
            .unwrap();
        assert_eq!(extraction.text, "fixed");
        // Stamped from the wall clock, so only non-negative is guaranteed.
        assert!(extraction.elapsed >= Duration::ZERO);
    }

    #[tokio::test]
    async fn test_health_check_all() {
        let mut registry = ExtractorRegistry::new();
        registry.register(Arc::new(Fixed {
            name: "fixed",
            ext: "bin",
        }));
        let results = registry.health_check_all().await;
        assert_eq!(results, vec![("fixed".to_string(), true)]);
    }
}
