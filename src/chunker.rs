//! Byte-addressed chunking with semantic boundary scanning.
//!
//! The cursor walks the text emitting half-open `[start, boundary)` windows.
//! Each boundary prefers, in order: the latest paragraph break, the latest
//! sentence end, the latest word break, scanning backwards from the size
//! limit, but never further back than half the chunk size. The next window
//! starts `overlap` bytes before the boundary, clamped so the sequence of
//! start offsets is strictly increasing (the forward-progress guarantee).
//!
//! All offsets are UTF-8 byte offsets; cursor adjustments always land on
//! `char` boundaries so multibyte codepoints are never split.

use unicode_segmentation::UnicodeSegmentation;

use crate::error::EngineError;
use crate::ident;
use crate::model::{Chunk, LocationMap};

/// Chunking knobs, taken from the engine config.
#[derive(Clone, Copy, Debug)]
pub struct ChunkerOptions {
    pub chunk_size_bytes: usize,
    pub overlap_bytes: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 1000,
            overlap_bytes: 200,
        }
    }
}

/// Split `text` into overlapping, byte-offset-tagged chunks.
///
/// Invariants on the output:
/// - chunks cover `[0, text.len())` contiguously modulo overlap;
/// - no chunk is empty;
/// - `start_offset` is strictly increasing;
/// - every offset lies on a `char` boundary.
pub fn chunk_text(
    doc_id: &str,
    text: &str,
    location_map: &LocationMap,
    options: ChunkerOptions,
) -> Result<Vec<Chunk>, EngineError> {
    if options.chunk_size_bytes < 2 {
        return Err(EngineError::validation("chunk size must be at least 2 bytes"));
    }
    let overlap = options.overlap_bytes.min(options.chunk_size_bytes / 2);
    let len = text.len();
    let mut chunks = Vec::new();
    let mut cursor = 0usize;

    while cursor < len {
        let upper = ceil_char_boundary(text, (cursor + options.chunk_size_bytes).min(len));
        let boundary = if upper == len {
            len
        } else {
            scan_boundary(text, cursor, upper, options.chunk_size_bytes / 2)
        };
        debug_assert!(boundary > cursor && text.is_char_boundary(boundary));

        chunks.push(build_chunk(doc_id, text, cursor, boundary, location_map));

        if boundary >= len {
            break;
        }
        let mut next = ceil_char_boundary(text, boundary.saturating_sub(overlap));
        if next <= cursor {
            // Forward progress beats exact overlap on degenerate inputs.
            next = next_char_boundary(text, cursor);
        }
        if next >= len {
            break;
        }
        cursor = next;
    }

    Ok(chunks)
}

/// Scan backwards from `upper` for the best boundary, looking no further back
/// than `window` bytes. Paragraph breaks beat sentence ends beat word breaks;
/// with no candidate in the window, the hard limit stands.
fn scan_boundary(text: &str, lower: usize, upper: usize, window: usize) -> usize {
    let floor = upper.saturating_sub(window).max(lower + 1);
    let slice = &text[..upper];

    if let Some(pos) = slice.rfind("\n\n") {
        // Boundary sits after the paragraph break.
        let candidate = pos + 2;
        if candidate >= floor && candidate > lower {
            return candidate;
        }
    }

    if let Some(candidate) = rfind_sentence_end(slice, lower) {
        if candidate >= floor {
            return candidate;
        }
    }

    if let Some(pos) = slice.rfind(char::is_whitespace) {
        let candidate = next_char_boundary(text, pos);
        if candidate >= floor && candidate > lower {
            return candidate;
        }
    }

    upper
}

/// Latest `.?!` followed by whitespace; the boundary lands after the
/// whitespace-preceding punctuation (i.e. before the whitespace).
fn rfind_sentence_end(slice: &str, lower: usize) -> Option<usize> {
    let bytes = slice.as_bytes();
    let mut best = None;
    for (idx, &byte) in bytes.iter().enumerate().skip(lower + 1) {
        if matches!(byte, b'.' | b'?' | b'!')
            && bytes
                .get(idx + 1)
                .is_some_and(|next| next.is_ascii_whitespace())
        {
            let candidate = idx + 1;
            if candidate > lower {
                best = Some(candidate);
            }
        }
    }
    best
}

fn build_chunk(
    doc_id: &str,
    text: &str,
    start: usize,
    end: usize,
    location_map: &LocationMap,
) -> Chunk {
    let body = &text[start..end];
    let anchor = location_map.anchor_at(start);
    Chunk {
        chunk_id: ident::chunk_id(doc_id, start),
        doc_id: doc_id.to_string(),
        start_offset: start,
        end_offset: end,
        text: body.to_string(),
        token_count: body.unicode_words().count(),
        heading_path: anchor
            .map(|a| a.heading_path.clone())
            .unwrap_or_default(),
        page_number: anchor.and_then(|a| a.page_number),
        timestamp_ms: anchor.and_then(|a| a.timestamp_ms),
        embedding: None,
    }
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn next_char_boundary(text: &str, idx: usize) -> usize {
    let mut next = (idx + 1).min(text.len());
    while next < text.len() && !text.is_char_boundary(next) {
        next += 1;
    }
    next
}
