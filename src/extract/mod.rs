//! Source extractors: URL in, raw bytes + UTF-8 text + location map out.
//!
//! One extractor per source kind. Fetching (reqwest) is split from parsing
//! (`*_from_bytes` / `*_from_str` functions) so the parse paths are testable
//! without a network. The registry is populated explicitly at startup; custom
//! extractors (including test fixtures) register through
//! [`ExtractorRegistry::register`].

pub mod pdf;
pub mod transcript;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::EngineError;
use crate::model::{LocationMap, SourceKind};

pub use pdf::PdfExtractor;
pub use transcript::TranscriptExtractor;
pub use web::WebExtractor;

/// Source-level metadata recovered during extraction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceMetadata {
    pub title: String,
    pub author: Option<String>,
    pub publication_date: Option<DateTime<Utc>>,
    /// Total media duration, for video sources.
    pub duration_ms: Option<u64>,
}

/// Everything an extractor recovers from one source.
///
/// Contract: `text` is UTF-8 and `location_map` covers `[0, text.len())`.
#[derive(Clone, Debug)]
pub struct Extraction {
    pub raw: Vec<u8>,
    pub text: String,
    pub location_map: LocationMap,
    pub metadata: SourceMetadata,
}

impl Extraction {
    /// Enforce the extractor contract before the pipeline consumes the result.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.text.trim().is_empty() {
            return Err(EngineError::validation("source produced no extractable text"));
        }
        if !self.location_map.covers(self.text.len()) {
            return Err(EngineError::integrity(
                "location map does not cover the extracted text",
            ));
        }
        Ok(())
    }
}

/// One extractor per [`SourceKind`].
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn kind(&self) -> SourceKind;
    fn matches(&self, url: &Url) -> bool;
    fn validate(&self, url: &Url) -> Result<(), EngineError> {
        if self.matches(url) {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "{} extractor does not handle {url}",
                self.kind().as_str()
            )))
        }
    }
    async fn extract(&self, url: &Url) -> Result<Extraction, EngineError>;
}

/// Explicit startup registry mapping URLs to extractors (first match wins).
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn SourceExtractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// PDF and transcript extractors match on extension, so they precede the
    /// catch-all web extractor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PdfExtractor::new()));
        registry.register(Arc::new(TranscriptExtractor::new()));
        registry.register(Arc::new(WebExtractor::new()));
        registry
    }

    pub fn register(&mut self, extractor: Arc<dyn SourceExtractor>) {
        self.extractors.push(extractor);
    }

    /// Highest-priority registrations are consulted first.
    pub fn register_first(&mut self, extractor: Arc<dyn SourceExtractor>) {
        self.extractors.insert(0, extractor);
    }

    pub fn resolve(&self, url: &Url) -> Result<Arc<dyn SourceExtractor>, EngineError> {
        self.extractors
            .iter()
            .find(|extractor| extractor.matches(url))
            .cloned()
            .ok_or_else(|| {
                EngineError::validation(format!("no extractor handles {url}"))
            })
    }
}

/// Shared fetch path for the built-in extractors.
///
/// 4xx statuses are validation failures (the source is wrong as addressed);
/// 5xx and transport errors are transient.
pub(crate) async fn fetch_url(url: &Url) -> Result<Vec<u8>, EngineError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("citeweave/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| EngineError::transient(format!("http client: {err}")))?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| EngineError::transient(format!("fetch {url}: {err}")))?;

    let status = response.status();
    if status.is_client_error() {
        return Err(EngineError::validation(format!("fetch {url}: http {status}")));
    }
    if !status.is_success() {
        return Err(EngineError::transient(format!("fetch {url}: http {status}")));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| EngineError::transient(format!("read body of {url}: {err}")))?;
    Ok(bytes.to_vec())
}

pub(crate) fn path_has_extension(url: &Url, extension: &str) -> bool {
    std::path::Path::new(url.path())
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_by_extension_then_falls_back_to_web() {
        let registry = ExtractorRegistry::with_defaults();
        let pdf = Url::parse("https://example.com/paper.PDF").unwrap();
        assert_eq!(registry.resolve(&pdf).unwrap().kind(), SourceKind::Pdf);

        let vtt = Url::parse("https://example.com/talk.vtt").unwrap();
        assert_eq!(registry.resolve(&vtt).unwrap().kind(), SourceKind::Video);

        let page = Url::parse("https://example.com/about").unwrap();
        assert_eq!(registry.resolve(&page).unwrap().kind(), SourceKind::Web);
    }

    #[test]
    fn unmatched_urls_are_validation_errors() {
        let registry = ExtractorRegistry::with_defaults();
        let ftp = Url::parse("ftp://example.com/file.bin").unwrap();
        let err = registry.resolve(&ftp).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn empty_extractions_fail_validation() {
        let extraction = Extraction {
            raw: Vec::new(),
            text: "   ".into(),
            location_map: LocationMap::new(),
            metadata: SourceMetadata::default(),
        };
        assert!(extraction.validate().is_err());
    }
}
