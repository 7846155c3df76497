//! PDF extraction via `lopdf`.

use async_trait::async_trait;
use lopdf::{Document as PdfDocument, Object};
use url::Url;

use crate::error::EngineError;
use crate::model::{LocationEntry, LocationMap, SourceKind};

use super::{Extraction, SourceExtractor, SourceMetadata, fetch_url, path_has_extension};

/// Extracts per-page text from PDFs; the location map carries one entry per
/// page so every chunk can be cited with its page number.
#[derive(Default)]
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Parse already-fetched PDF bytes. Public for offline use and tests.
    pub fn extract_bytes(&self, url: &Url, bytes: &[u8]) -> Result<Extraction, EngineError> {
        // An unreadable PDF is a structural (fatal) failure, not a transient
        // one: retrying cannot fix the bytes.
        let document = PdfDocument::load_mem(bytes).map_err(|err| {
            EngineError::validation(format!("unreadable pdf at {url}: {err}"))
        })?;

        let mut text = String::new();
        let mut map = LocationMap::new();

        let pages = document.get_pages();
        for (&page_number, _) in pages.iter() {
            let page_text = document
                .extract_text(&[page_number])
                .map(|raw| normalize_page_text(&raw))
                .unwrap_or_default();
            if page_text.is_empty() {
                continue;
            }
            map.push(LocationEntry {
                byte_offset: text.len(),
                page_number: Some(page_number),
                ..Default::default()
            });
            text.push_str(&page_text);
            text.push_str("\n\n");
        }

        let text = text.trim_end().to_string();
        let title = pdf_title(&document)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| file_stem(url));

        let extraction = Extraction {
            raw: bytes.to_vec(),
            text,
            location_map: map,
            metadata: SourceMetadata {
                title,
                ..Default::default()
            },
        };
        extraction.validate()?;
        Ok(extraction)
    }
}

/// Collapse intra-page whitespace while keeping paragraph breaks usable as
/// chunk boundaries.
fn normalize_page_text(raw: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    for paragraph in raw.split("\n\n") {
        let collapsed = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            paragraphs.push(collapsed);
        }
    }
    paragraphs.join("\n\n")
}

fn pdf_title(document: &PdfDocument) -> Option<String> {
    let info = document.trailer.get(b"Info").ok()?;
    let info = match info {
        Object::Reference(id) => document.get_object(*id).ok()?,
        other => other,
    };
    let dict = info.as_dict().ok()?;
    match dict.get(b"Title").ok()? {
        Object::String(bytes, _) => {
            let title = String::from_utf8_lossy(bytes).trim().to_string();
            Some(title)
        }
        _ => None,
    }
}

fn file_stem(url: &Url) -> String {
    std::path::Path::new(url.path())
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| url.to_string())
}

#[async_trait]
impl SourceExtractor for PdfExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Pdf
    }

    fn matches(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https") && path_has_extension(url, "pdf")
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, EngineError> {
        let bytes = fetch_url(url).await?;
        self.extract_bytes(url, &bytes)
    }
}
