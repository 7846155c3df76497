//! Persisted record types for the provenance data model.
//!
//! Everything here is a plain serde value addressed by a deterministic id (see
//! [`crate::ident`]). Records never hold direct references across aggregate
//! boundaries; they hold ids and resolve through the store façade.

pub mod job;
pub mod progress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use job::{Job, JobStatus};
pub use progress::{ProgressEvent, Stage};

/// Quality bucket used to segregate stored content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
    D,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
            Tier::D => "D",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "A" => Tier::A,
            "B" => Tier::B,
            "C" => Tier::C,
            "D" => Tier::D,
            _ => return None,
        })
    }

    /// Bucket a 0–10 quality score into a tier.
    pub fn from_quality(score: f32) -> Self {
        match score {
            s if s >= 8.0 => Tier::A,
            s if s >= 6.0 => Tier::B,
            s if s >= 4.0 => Tier::C,
            _ => Tier::D,
        }
    }
}

/// What kind of source a document was ingested from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Web,
    Pdf,
    Video,
    Other,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Web => "web",
            SourceKind::Pdf => "pdf",
            SourceKind::Video => "video",
            SourceKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "web" => SourceKind::Web,
            "pdf" => SourceKind::Pdf,
            "video" => SourceKind::Video,
            "other" => SourceKind::Other,
            _ => return None,
        })
    }
}

/// One ingested source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// SHA-256 of the normalized URL.
    pub doc_id: String,
    /// Normalized URL (see [`crate::ident::normalize_url`]).
    pub url: String,
    pub title: String,
    pub source_kind: SourceKind,
    pub ingested_at: DateTime<Utc>,
    pub tier: Tier,
    /// 0–10 quality score; drives the tier bucket.
    pub quality_score: f32,
    /// Length in bytes of the extracted UTF-8 text.
    pub byte_length: usize,
}

/// External anchor for a byte offset: page, timestamp, and/or heading trail.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub byte_offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heading_path: Vec<String>,
}

/// Monotonically increasing map from byte offsets in the extracted text to
/// external anchors. Built by the extractor, immutable afterwards.
///
/// Lookup returns the entry with the greatest `byte_offset` that does not
/// exceed the queried offset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationMap {
    entries: Vec<LocationEntry>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Offsets must be pushed in strictly increasing order;
    /// an entry at an already-seen offset replaces the previous one.
    pub fn push(&mut self, entry: LocationEntry) {
        match self.entries.last() {
            Some(last) if last.byte_offset == entry.byte_offset => {
                *self.entries.last_mut().expect("non-empty") = entry;
            }
            Some(last) => {
                debug_assert!(last.byte_offset < entry.byte_offset);
                self.entries.push(entry);
            }
            None => self.entries.push(entry),
        }
    }

    /// Greatest entry with `byte_offset <= offset`.
    pub fn anchor_at(&self, offset: usize) -> Option<&LocationEntry> {
        match self
            .entries
            .binary_search_by(|e| e.byte_offset.cmp(&offset))
        {
            Ok(idx) => Some(&self.entries[idx]),
            Err(0) => None,
            Err(idx) => Some(&self.entries[idx - 1]),
        }
    }

    /// Whether the map covers `[0, len)` (an entry at offset 0 exists).
    pub fn covers(&self, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        self.entries.first().is_some_and(|e| e.byte_offset == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LocationEntry] {
        &self.entries
    }
}

/// A byte-addressable substring of a document's extracted text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `doc_id:start_offset` (decimal, zero-padded to 10).
    pub chunk_id: String,
    pub doc_id: String,
    /// Byte offsets into the extracted text, half-open.
    pub start_offset: usize,
    pub end_offset: usize,
    pub text: String,
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heading_path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn byte_len(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// Entity type vocabulary for mentions and canonical entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Person,
    Org,
    Gpe,
    Law,
    Date,
    Product,
    Concept,
    Tech,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Org => "ORG",
            EntityType::Gpe => "GPE",
            EntityType::Law => "LAW",
            EntityType::Date => "DATE",
            EntityType::Product => "PRODUCT",
            EntityType::Concept => "CONCEPT",
            EntityType::Tech => "TECH",
            EntityType::Other => "OTHER",
        }
    }
}

/// A typed span inside a chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// SHA-256 of `(chunk_id, normalized_text, start_in_chunk)`.
    pub mention_id: String,
    pub chunk_id: String,
    pub surface_text: String,
    pub entity_type: EntityType,
    /// Byte offsets within the chunk text, half-open.
    pub start_in_chunk: usize,
    pub end_in_chunk: usize,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coref_cluster_id: Option<String>,
}

/// Canonical identity across documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// SHA-256 of `(normalized_surface, entity_type)`; merges keep the first
    /// id and accumulate aliases.
    pub entity_id: String,
    pub canonical_name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub mention_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_embedding: Option<Vec<f32>>,
}

/// Predicate vocabulary for entity-to-entity edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Predicate {
    EmployedBy,
    Founded,
    Cites,
    LocatedIn,
    PartOf,
    AuthoredBy,
    Other,
}

impl Predicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::EmployedBy => "EMPLOYED_BY",
            Predicate::Founded => "FOUNDED",
            Predicate::Cites => "CITES",
            Predicate::LocatedIn => "LOCATED_IN",
            Predicate::PartOf => "PART_OF",
            Predicate::AuthoredBy => "AUTHORED_BY",
            Predicate::Other => "OTHER",
        }
    }
}

/// Typed, directed, evidence-backed edge between two entities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// SHA-256 of `(subject, predicate, object, evidence_chunk_id)`.
    pub rel_id: String,
    pub subject_entity_id: String,
    pub predicate: Predicate,
    pub object_entity_id: String,
    pub confidence: f32,
    pub evidence_chunk_id: String,
    /// Absolute byte range in the document's extracted text.
    pub evidence_byte_range: (usize, usize),
    pub evidence_quote: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_map_returns_greatest_entry_at_or_below_offset() {
        let mut map = LocationMap::new();
        map.push(LocationEntry {
            byte_offset: 0,
            page_number: Some(1),
            ..Default::default()
        });
        map.push(LocationEntry {
            byte_offset: 100,
            page_number: Some(2),
            ..Default::default()
        });

        assert_eq!(map.anchor_at(0).unwrap().page_number, Some(1));
        assert_eq!(map.anchor_at(99).unwrap().page_number, Some(1));
        assert_eq!(map.anchor_at(100).unwrap().page_number, Some(2));
        assert_eq!(map.anchor_at(5000).unwrap().page_number, Some(2));
    }

    #[test]
    fn location_map_coverage_requires_a_zero_entry() {
        let mut map = LocationMap::new();
        assert!(map.covers(0));
        assert!(!map.covers(10));
        map.push(LocationEntry::default());
        assert!(map.covers(10));
    }

    #[test]
    fn location_map_round_trips_through_json() {
        let mut map = LocationMap::new();
        map.push(LocationEntry {
            byte_offset: 0,
            heading_path: vec!["Intro".into()],
            ..Default::default()
        });
        let json = serde_json::to_string(&map).unwrap();
        let back: LocationMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);
    }

    #[test]
    fn tiers_bucket_quality_scores() {
        assert_eq!(Tier::from_quality(9.1), Tier::A);
        assert_eq!(Tier::from_quality(6.0), Tier::B);
        assert_eq!(Tier::from_quality(4.5), Tier::C);
        assert_eq!(Tier::from_quality(1.0), Tier::D);
    }
}
