//! Video transcript extraction (WebVTT / SRT cue files).
//!
//! Each cue contributes one location entry carrying the cue's start time in
//! milliseconds (floored), so citations into video sources resolve to a seek
//! position.

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use crate::error::EngineError;
use crate::model::{LocationEntry, LocationMap, SourceKind};

use super::{Extraction, SourceExtractor, SourceMetadata, fetch_url, path_has_extension};

pub struct TranscriptExtractor {
    timing_line: Regex,
}

impl Default for TranscriptExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptExtractor {
    pub fn new() -> Self {
        Self {
            // `hh:` is optional in WebVTT; SRT uses a comma before millis.
            timing_line: Regex::new(
                r"(?:(\d{1,2}):)?(\d{1,2}):(\d{2})[.,](\d{3})\s*-->\s*(?:(\d{1,2}):)?(\d{1,2}):(\d{2})[.,](\d{3})",
            )
            .expect("static regex"),
        }
    }

    /// Parse already-fetched cue text. Public for offline use and tests.
    pub fn extract_str(&self, url: &Url, content: &str) -> Result<Extraction, EngineError> {
        let mut text = String::new();
        let mut map = LocationMap::new();
        let mut last_end_ms: Option<u64> = None;
        let mut last_start_ms: Option<u64> = None;

        for block in content.replace('\r', "").split("\n\n") {
            let block = block.trim();
            if block.is_empty() || block.starts_with("WEBVTT") || block.starts_with("NOTE") {
                continue;
            }

            let Some(captures) = self.timing_line.captures(block) else {
                continue;
            };
            let start_ms = cue_millis(&captures, 1);
            let end_ms = cue_millis(&captures, 5);

            let cue_text = block
                .lines()
                .skip_while(|line| !line.contains("-->"))
                .skip(1)
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if cue_text.is_empty() {
                continue;
            }

            // Cues must not rewind; out-of-order timestamps make the location
            // map non-monotonic and the transcript untrustworthy.
            if last_start_ms.is_some_and(|prev| start_ms < prev) {
                return Err(EngineError::integrity(format!(
                    "transcript {url} has out-of-order cue at {start_ms}ms"
                )));
            }
            last_start_ms = Some(start_ms);
            last_end_ms = Some(end_ms.max(last_end_ms.unwrap_or(0)));

            map.push(LocationEntry {
                byte_offset: text.len(),
                timestamp_ms: Some(start_ms),
                ..Default::default()
            });
            text.push_str(&cue_text);
            text.push_str("\n\n");
        }

        let text = text.trim_end().to_string();
        let extraction = Extraction {
            raw: content.as_bytes().to_vec(),
            text,
            location_map: map,
            metadata: SourceMetadata {
                title: transcript_title(url),
                duration_ms: last_end_ms,
                ..Default::default()
            },
        };
        extraction.validate()?;
        Ok(extraction)
    }
}

fn cue_millis(captures: &regex::Captures<'_>, base: usize) -> u64 {
    let hours: u64 = captures
        .get(base)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    let minutes: u64 = captures[base + 1].parse().unwrap_or(0);
    let seconds: u64 = captures[base + 2].parse().unwrap_or(0);
    let millis: u64 = captures[base + 3].parse().unwrap_or(0);
    ((hours * 60 + minutes) * 60 + seconds) * 1000 + millis
}

fn transcript_title(url: &Url) -> String {
    std::path::Path::new(url.path())
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| url.to_string())
}

#[async_trait]
impl SourceExtractor for TranscriptExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Video
    }

    fn matches(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && (path_has_extension(url, "vtt") || path_has_extension(url, "srt"))
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, EngineError> {
        let bytes = fetch_url(url).await?;
        let content = String::from_utf8_lossy(&bytes);
        let mut extraction = self.extract_str(url, &content)?;
        extraction.raw = bytes;
        Ok(extraction)
    }
}
