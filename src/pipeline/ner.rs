//! Named-entity recognition over chunks.
//!
//! A rule tagger runs first: gazetteers plus surface-shape patterns, each
//! carrying its own confidence. When `ner_llm_fallback` is enabled, chunks
//! that yield nothing are re-tagged through the generative provider with a
//! JSON mention-list prompt.
//!
//! Mentions deduplicate on `mention_id` (identical normalized text at an
//! identical offset collapses). Chunks containing U+FFFD are skipped and
//! counted rather than failing the stage.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::EngineError;
use crate::ident;
use crate::model::{Chunk, EntityType, Mention, Stage};
use crate::providers::GenerateOptions;

use super::{CorefSpan, IngestWork, PipelineStage, StageContext};

const FIRST_NAMES: &[&str] = &[
    "ada", "alan", "alice", "anna", "carl", "charles", "claude", "david", "emma", "erik", "grace",
    "james", "jane", "john", "lena", "linus", "lisa", "marco", "margaret", "maria", "marie",
    "mark", "mary", "nadia", "omar", "paul", "peter", "priya", "rosa", "samir", "sofia", "tim",
    "vera", "victor", "wei", "yuki",
];

const GPE_GAZETTEER: &[&str] = &[
    "amsterdam", "australia", "berlin", "boston", "brazil", "california", "canada", "chicago",
    "china", "denmark", "france", "germany", "india", "japan", "kenya", "london", "madrid",
    "mexico", "munich", "new york", "norway", "oslo", "paris", "portugal", "rome",
    "san francisco", "seattle", "singapore", "spain", "stockholm", "sweden", "switzerland",
    "tokyo", "toronto", "united kingdom", "united states", "vienna", "zurich",
];

const TECH_GAZETTEER: &[&str] = &[
    "docker", "graphql", "grpc", "javascript", "kubernetes", "linux", "postgresql", "python",
    "pytorch", "rust", "sqlite", "tensorflow", "typescript", "webassembly",
];

const ORG_SUFFIXES: &[&str] = &[
    "Inc", "Corp", "Corporation", "Ltd", "LLC", "GmbH", "Foundation", "University", "Institute",
    "Labs", "Laboratories", "Company", "Group", "Agency", "Energy", "Systems",
];

const ACRONYM_STOPLIST: &[&str] = &[
    "AND", "API", "FAQ", "FOR", "NOT", "PDF", "THE", "URL", "USA", "WHO",
];

struct Rule {
    pattern: Regex,
    entity_type: EntityType,
    confidence: f32,
}

pub struct NerTagger {
    rules: Vec<Rule>,
    titlecase_phrase: Regex,
}

impl Default for NerTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl NerTagger {
    pub fn new() -> Self {
        let suffixes = ORG_SUFFIXES.join("|");
        let rules = vec![
            // "Dr. Grace Hopper": honorific followed by a TitleCase pair.
            Rule {
                pattern: Regex::new(
                    r"\b(?:Mr|Ms|Mrs|Dr|Prof)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+",
                )
                .expect("static regex"),
                entity_type: EntityType::Person,
                confidence: 0.95,
            },
            // "Helios Energy Ltd": TitleCase run ending in a corporate suffix.
            Rule {
                pattern: Regex::new(&format!(
                    r"\b(?:[A-Z][A-Za-z&-]*\s+)+(?:{suffixes})\b\.?"
                ))
                .expect("static regex"),
                entity_type: EntityType::Org,
                confidence: 0.95,
            },
            // "Clean Water Act": TitleCase run ending in a statute word.
            Rule {
                pattern: Regex::new(
                    r"\b(?:[A-Z][A-Za-z-]*\s+)+(?:Act|Treaty|Regulation|Directive|Accord)\b",
                )
                .expect("static regex"),
                entity_type: EntityType::Law,
                confidence: 0.9,
            },
            // Internal capital ("OpenAI", "DeepMind").
            Rule {
                pattern: Regex::new(r"\b[A-Z][a-z]+[A-Z][A-Za-z]*\b").expect("static regex"),
                entity_type: EntityType::Org,
                confidence: 0.85,
            },
            // TitleCase word(s) followed by an acronym ("Open AI").
            Rule {
                pattern: Regex::new(r"\b(?:[A-Z][a-z]+\s+)+[A-Z]{2,6}\b").expect("static regex"),
                entity_type: EntityType::Org,
                confidence: 0.75,
            },
            // ISO dates.
            Rule {
                pattern: Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("static regex"),
                entity_type: EntityType::Date,
                confidence: 0.95,
            },
            // Written dates ("March 4, 2019" / "March 2019").
            Rule {
                pattern: Regex::new(
                    r"\b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+(?:\d{1,2},\s*\d{4}|\d{4}|\d{1,2})\b",
                )
                .expect("static regex"),
                entity_type: EntityType::Date,
                confidence: 0.9,
            },
            // Bare years.
            Rule {
                pattern: Regex::new(r"\b(?:19|20)\d{2}\b").expect("static regex"),
                entity_type: EntityType::Date,
                confidence: 0.6,
            },
            // Standalone acronyms ("NASA").
            Rule {
                pattern: Regex::new(r"\b[A-Z]{2,6}\b").expect("static regex"),
                entity_type: EntityType::Org,
                confidence: 0.7,
            },
            // Versioned product names ("Atlas9").
            Rule {
                pattern: Regex::new(r"\b[A-Z][A-Za-z]*\d+[A-Za-z0-9]*\b").expect("static regex"),
                entity_type: EntityType::Product,
                confidence: 0.65,
            },
        ];
        Self {
            rules,
            titlecase_phrase: Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b")
                .expect("static regex"),
        }
    }

    /// Tag one chunk with the rule set; offsets are byte offsets into the
    /// chunk text.
    pub fn tag_chunk(&self, chunk: &Chunk, coref: &[CorefSpan]) -> Vec<Mention> {
        struct Candidate {
            start: usize,
            end: usize,
            entity_type: EntityType,
            confidence: f32,
        }

        let text = &chunk.text;
        let mut candidates: Vec<Candidate> = Vec::new();

        for rule in &self.rules {
            for found in rule.pattern.find_iter(text) {
                if rule.entity_type == EntityType::Org
                    && found.as_str().chars().all(|c| c.is_ascii_uppercase())
                    && ACRONYM_STOPLIST.contains(&found.as_str())
                {
                    continue;
                }
                candidates.push(Candidate {
                    start: found.start(),
                    end: found.end(),
                    entity_type: rule.entity_type,
                    confidence: rule.confidence,
                });
            }
        }

        // Gazetteer passes over TitleCase phrases.
        for found in self.titlecase_phrase.find_iter(text) {
            let lower = found.as_str().to_lowercase();
            if GPE_GAZETTEER.contains(&lower.as_str()) {
                candidates.push(Candidate {
                    start: found.start(),
                    end: found.end(),
                    entity_type: EntityType::Gpe,
                    confidence: 0.9,
                });
            } else if TECH_GAZETTEER.contains(&lower.as_str()) {
                candidates.push(Candidate {
                    start: found.start(),
                    end: found.end(),
                    entity_type: EntityType::Tech,
                    confidence: 0.8,
                });
            } else if let Some((first, _rest)) = lower.split_once(' ') {
                if FIRST_NAMES.contains(&first) && found.as_str().split_whitespace().count() >= 2 {
                    candidates.push(Candidate {
                        start: found.start(),
                        end: found.end(),
                        entity_type: EntityType::Person,
                        confidence: 0.85,
                    });
                }
            }
        }

        // Prefer higher confidence, then longer spans; later candidates may
        // not overlap an accepted span.
        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| (b.end - b.start).cmp(&(a.end - a.start)))
                .then_with(|| a.start.cmp(&b.start))
        });

        let mut accepted: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            let overlaps = accepted
                .iter()
                .any(|kept| candidate.start < kept.end && kept.start < candidate.end);
            if !overlaps {
                accepted.push(candidate);
            }
        }
        accepted.sort_by_key(|c| c.start);

        let mut mentions: Vec<Mention> = Vec::new();
        for candidate in accepted {
            let surface = text[candidate.start..candidate.end].trim_end_matches('.');
            let end = candidate.start + surface.len();
            if surface.is_empty() {
                continue;
            }
            let normalized = ident::normalize_surface(surface);
            let mention_id = ident::mention_id(&chunk.chunk_id, &normalized, candidate.start);
            if mentions.iter().any(|m| m.mention_id == mention_id) {
                continue;
            }
            let coref_cluster_id = coref
                .iter()
                .find(|span| span.start < end && candidate.start < span.end)
                .map(|span| span.cluster_id.clone());
            mentions.push(Mention {
                mention_id,
                chunk_id: chunk.chunk_id.clone(),
                surface_text: surface.to_string(),
                entity_type: candidate.entity_type,
                start_in_chunk: candidate.start,
                end_in_chunk: end,
                confidence: candidate.confidence,
                coref_cluster_id,
            });
        }
        mentions
    }

    async fn llm_fallback(
        &self,
        chunk: &Chunk,
        cx: &StageContext,
    ) -> Result<Vec<Mention>, EngineError> {
        let prompt = format!(
            "Extract named entities from the text as a JSON array of objects with \
             fields \"surface\", \"type\" (PERSON, ORG, GPE, LAW, DATE, PRODUCT, \
             CONCEPT, TECH, OTHER) and \"confidence\" (0-1).\n\nText:\n{}",
            chunk.text
        );
        let raw = cx
            .generator
            .generate(&prompt, &GenerateOptions { budget: true, ..Default::default() })
            .await?;

        #[derive(Deserialize)]
        struct LlmMention {
            surface: String,
            #[serde(rename = "type")]
            entity_type: String,
            #[serde(default)]
            confidence: Option<f32>,
        }

        let Ok(parsed) = serde_json::from_str::<Vec<LlmMention>>(raw.trim()) else {
            warn!(
                target: "citeweave::ner",
                chunk_id = %chunk.chunk_id,
                "LM fallback returned non-JSON output; keeping rule results"
            );
            return Ok(Vec::new());
        };

        let mut mentions = Vec::new();
        for item in parsed {
            let Some(entity_type) = parse_entity_type(&item.entity_type) else {
                continue;
            };
            let Some(start) = chunk.text.find(&item.surface) else {
                continue;
            };
            let normalized = ident::normalize_surface(&item.surface);
            mentions.push(Mention {
                mention_id: ident::mention_id(&chunk.chunk_id, &normalized, start),
                chunk_id: chunk.chunk_id.clone(),
                surface_text: item.surface.clone(),
                entity_type,
                start_in_chunk: start,
                end_in_chunk: start + item.surface.len(),
                confidence: item.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                coref_cluster_id: None,
            });
        }
        Ok(mentions)
    }
}

fn parse_entity_type(s: &str) -> Option<EntityType> {
    Some(match s.trim().to_ascii_uppercase().as_str() {
        "PERSON" => EntityType::Person,
        "ORG" => EntityType::Org,
        "GPE" => EntityType::Gpe,
        "LAW" => EntityType::Law,
        "DATE" => EntityType::Date,
        "PRODUCT" => EntityType::Product,
        "CONCEPT" => EntityType::Concept,
        "TECH" => EntityType::Tech,
        "OTHER" => EntityType::Other,
        _ => return None,
    })
}

#[async_trait]
impl PipelineStage for NerTagger {
    fn stage(&self) -> Stage {
        Stage::Ner
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let mut mentions = Vec::new();
        let mut chunks_skipped = 0u64;

        for chunk in &work.chunks {
            cx.check_cancelled()?;
            if chunk.text.contains('\u{FFFD}') {
                chunks_skipped += 1;
                warn!(
                    target: "citeweave::ner",
                    chunk_id = %chunk.chunk_id,
                    "chunk contains replacement characters; skipping"
                );
                continue;
            }
            let coref = work
                .coref_spans
                .iter()
                .find(|(id, _)| id == &chunk.chunk_id)
                .map(|(_, spans)| spans.as_slice())
                .unwrap_or(&[]);
            let mut tagged = self.tag_chunk(chunk, coref);
            if tagged.is_empty() && cx.config.ner_llm_fallback {
                tagged = self.llm_fallback(chunk, cx).await?;
            }
            mentions.extend(tagged);
        }

        let counters = serde_json::json!({
            "mentions_found": mentions.len(),
            "chunks_skipped": chunks_skipped,
        });
        work.mentions = mentions;
        Ok(Some(counters))
    }
}
