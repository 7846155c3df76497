//! HTML extraction via `scraper`.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::EngineError;
use crate::model::{LocationEntry, LocationMap, SourceKind};

use super::{Extraction, SourceExtractor, SourceMetadata, fetch_url, path_has_extension};

/// Extracts readable text from web pages, recording heading trails in the
/// location map as it walks the document.
pub struct WebExtractor {
    blocks: Selector,
    title: Selector,
}

impl Default for WebExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl WebExtractor {
    pub fn new() -> Self {
        Self {
            blocks: Selector::parse("h1, h2, h3, h4, h5, h6, p, li, blockquote, pre")
                .expect("static selector"),
            title: Selector::parse("title").expect("static selector"),
        }
    }

    /// Parse already-fetched HTML. Public for offline use and tests.
    pub fn extract_html(&self, url: &Url, html: &str) -> Result<Extraction, EngineError> {
        let document = Html::parse_document(html);

        let title = document
            .select(&self.title)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| url.to_string());

        let mut text = String::new();
        let mut map = LocationMap::new();
        let mut heading_stack: Vec<String> = Vec::new();

        for element in document.select(&self.blocks) {
            // Skip nested matches (e.g. a <p> inside an <li>) so no text is
            // collected twice.
            if has_block_ancestor(&element) {
                continue;
            }
            let block = collapse_whitespace(&element.text().collect::<String>());
            if block.is_empty() {
                continue;
            }

            if let Some(level) = heading_level(element.value().name()) {
                heading_stack.truncate(level - 1);
                heading_stack.push(block.clone());
                map.push(LocationEntry {
                    byte_offset: text.len(),
                    heading_path: heading_stack.clone(),
                    ..Default::default()
                });
            } else if map.is_empty() {
                // Content before the first heading still needs an anchor.
                map.push(LocationEntry {
                    byte_offset: 0,
                    ..Default::default()
                });
            }

            text.push_str(&block);
            text.push_str("\n\n");
        }

        let text = text.trim_end().to_string();

        let extraction = Extraction {
            raw: html.as_bytes().to_vec(),
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

fn heading_level(tag: &str) -> Option<usize> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "blockquote", "pre",
];

fn has_block_ancestor(element: &ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| BLOCK_TAGS.contains(&ancestor.value().name()))
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl SourceExtractor for WebExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    fn matches(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && !path_has_extension(url, "pdf")
            && !path_has_extension(url, "vtt")
            && !path_has_extension(url, "srt")
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, EngineError> {
        let bytes = fetch_url(url).await?;
        let html = String::from_utf8_lossy(&bytes);
        let mut extraction = self.extract_html(url, &html)?;
        extraction.raw = bytes;
        Ok(extraction)
    }
}
