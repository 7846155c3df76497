//! Relation extraction between linked entities.
//!
//! For every chunk holding at least two linked mentions, the text between
//! each ordered mention pair is matched against predicate cue templates.
//! Matches become proposals with a template-specific base confidence, then an
//! LM verifier (budget mode) answers whether the evidence supports the claim;
//! a NO halves the confidence. Proposals above the configured threshold are
//! emitted with their evidence pinned to the chunk and a quoted byte range.
//!
//! Identical `rel_id`s collapse; the same `(subject, predicate, object)` from
//! different evidence chunks stays as separate edges.

use async_trait::async_trait;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::EngineError;
use crate::ident;
use crate::model::{Chunk, EntityType, Mention, Predicate, Relation, Stage};
use crate::providers::GenerateOptions;

use super::{IngestWork, LinkPlan, PipelineStage, StageContext};

/// How far apart (in bytes) two mentions may be for a template to apply.
const MAX_GAP_BYTES: usize = 100;

struct Template {
    cue: Regex,
    predicate: Predicate,
    base_confidence: f32,
    /// Swapped templates read "A … cue … B" as `B predicate A`
    /// (e.g. "Helios, founded by Solara" → Solara FOUNDED Helios).
    swap: bool,
}

pub struct RelationExtractor {
    templates: Vec<Template>,
}

impl Default for RelationExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationExtractor {
    pub fn new() -> Self {
        let template = |pattern: &str, predicate, base_confidence, swap| Template {
            cue: Regex::new(pattern).expect("static regex"),
            predicate,
            base_confidence,
            swap,
        };
        Self {
            templates: vec![
                template(
                    r"(?i)\b(?:was\s+)?founded\s+by\b",
                    Predicate::Founded,
                    0.8,
                    true,
                ),
                template(r"(?i)\bfounded\b", Predicate::Founded, 0.8, false),
                template(
                    r"(?i)\b(?:works\s+(?:at|for)|employed\s+by|joined|chief\s+executive\s+of|ceo\s+of)\b",
                    Predicate::EmployedBy,
                    0.75,
                    false,
                ),
                template(
                    r"(?i)\b(?:located\s+in|based\s+in|headquartered\s+in)\b",
                    Predicate::LocatedIn,
                    0.8,
                    false,
                ),
                template(
                    r"(?i)\b(?:part\s+of|subsidiary\s+of|division\s+of|unit\s+of)\b",
                    Predicate::PartOf,
                    0.75,
                    false,
                ),
                template(
                    r"(?i)\b(?:authored|written)\s+by\b",
                    Predicate::AuthoredBy,
                    0.8,
                    false,
                ),
                template(r"(?i)\b(?:cites|citing)\b", Predicate::Cites, 0.6, false),
            ],
        }
    }

    /// Propose relations for one chunk. `entity_of` maps mention ids to their
    /// linked canonical entity ids.
    pub fn propose(
        &self,
        chunk: &Chunk,
        mentions: &[&Mention],
        entity_of: &FxHashMap<&str, &str>,
    ) -> Vec<Proposal> {
        let mut proposals = Vec::new();
        for (i, a) in mentions.iter().enumerate() {
            for b in mentions.iter().skip(i + 1) {
                if a.end_in_chunk >= b.start_in_chunk {
                    continue;
                }
                let gap = &chunk.text[a.end_in_chunk..b.start_in_chunk];
                if gap.len() > MAX_GAP_BYTES {
                    continue;
                }
                let (Some(&entity_a), Some(&entity_b)) = (
                    entity_of.get(a.mention_id.as_str()),
                    entity_of.get(b.mention_id.as_str()),
                ) else {
                    continue;
                };
                if entity_a == entity_b {
                    continue;
                }

                for tpl in &self.templates {
                    if !tpl.cue.is_match(gap) {
                        continue;
                    }
                    let (subject, object, subject_surface, object_surface, subject_type, object_type) =
                        if tpl.swap {
                            (entity_b, entity_a, &b.surface_text, &a.surface_text, b.entity_type, a.entity_type)
                        } else {
                            (entity_a, entity_b, &a.surface_text, &b.surface_text, a.entity_type, b.entity_type)
                        };
                    if !signature_allows(tpl.predicate, subject_type, object_type) {
                        continue;
                    }
                    let quote = chunk.text[a.start_in_chunk..b.end_in_chunk].to_string();
                    proposals.push(Proposal {
                        subject_entity_id: subject.to_string(),
                        predicate: tpl.predicate,
                        object_entity_id: object.to_string(),
                        subject_surface: subject_surface.clone(),
                        object_surface: object_surface.clone(),
                        base_confidence: tpl.base_confidence,
                        evidence_chunk_id: chunk.chunk_id.clone(),
                        evidence_byte_range: (
                            chunk.start_offset + a.start_in_chunk,
                            chunk.start_offset + b.end_in_chunk,
                        ),
                        evidence_quote: quote,
                    });
                    // First matching template wins for this pair.
                    break;
                }
            }
        }
        proposals
    }

    async fn verify(&self, proposal: &Proposal, cx: &StageContext) -> Result<bool, EngineError> {
        let prompt = format!(
            "Claim: {} {} {}\nEvidence: {}\nDoes the evidence support the claim? Answer YES or NO.",
            proposal.subject_surface,
            predicate_phrase(proposal.predicate),
            proposal.object_surface,
            proposal.evidence_quote,
        );
        let options = GenerateOptions {
            budget: true,
            max_tokens: 8,
            ..Default::default()
        };
        let answer = cx.generator.generate(&prompt, &options).await?;
        Ok(answer.trim().to_ascii_uppercase().starts_with("YES"))
    }
}

/// A candidate relation before verification.
#[derive(Clone, Debug)]
pub struct Proposal {
    pub subject_entity_id: String,
    pub predicate: Predicate,
    pub object_entity_id: String,
    pub subject_surface: String,
    pub object_surface: String,
    pub base_confidence: f32,
    pub evidence_chunk_id: String,
    pub evidence_byte_range: (usize, usize),
    pub evidence_quote: String,
}

/// Type signature per predicate; dates are never relation endpoints.
fn signature_allows(predicate: Predicate, subject: EntityType, object: EntityType) -> bool {
    use EntityType::*;
    if subject == Date || object == Date {
        return false;
    }
    match predicate {
        Predicate::EmployedBy => matches!(subject, Person) && matches!(object, Org),
        Predicate::Founded => {
            matches!(subject, Person | Org) && matches!(object, Org | Product)
        }
        Predicate::LocatedIn => matches!(object, Gpe),
        Predicate::PartOf => matches!(object, Org | Gpe | Product | Tech | Concept),
        Predicate::AuthoredBy => matches!(object, Person | Org),
        Predicate::Cites | Predicate::Other => true,
    }
}

fn predicate_phrase(predicate: Predicate) -> &'static str {
    match predicate {
        Predicate::EmployedBy => "is employed by",
        Predicate::Founded => "founded",
        Predicate::Cites => "cites",
        Predicate::LocatedIn => "is located in",
        Predicate::PartOf => "is part of",
        Predicate::AuthoredBy => "was authored by",
        Predicate::Other => "relates to",
    }
}

fn entity_index(plan: &LinkPlan) -> FxHashMap<&str, &str> {
    plan.refers_to
        .iter()
        .map(|link| (link.mention_id.as_str(), link.entity_id.as_str()))
        .collect()
}

#[async_trait]
impl PipelineStage for RelationExtractor {
    fn stage(&self) -> Stage {
        Stage::Relate
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let Some(plan) = work.link_plan.as_ref() else {
            work.relations = Vec::new();
            return Ok(Some(serde_json::json!({ "relations_found": 0 })));
        };
        let entity_of = entity_index(plan);

        let mut relations: FxHashMap<String, Relation> = FxHashMap::default();
        let mut proposed = 0usize;
        for chunk in &work.chunks {
            cx.check_cancelled()?;
            let mentions: Vec<&Mention> = work
                .mentions
                .iter()
                .filter(|m| {
                    m.chunk_id == chunk.chunk_id && entity_of.contains_key(m.mention_id.as_str())
                })
                .collect();
            if mentions.len() < 2 {
                continue;
            }

            for proposal in self.propose(chunk, &mentions, &entity_of) {
                proposed += 1;
                let supported = self.verify(&proposal, cx).await?;
                let confidence = if supported {
                    proposal.base_confidence
                } else {
                    proposal.base_confidence * 0.5
                };
                if confidence < cx.config.relation_confidence_threshold {
                    continue;
                }
                let rel_id = ident::relation_id(
                    &proposal.subject_entity_id,
                    proposal.predicate,
                    &proposal.object_entity_id,
                    &proposal.evidence_chunk_id,
                );
                relations.entry(rel_id.clone()).or_insert(Relation {
                    rel_id,
                    subject_entity_id: proposal.subject_entity_id,
                    predicate: proposal.predicate,
                    object_entity_id: proposal.object_entity_id,
                    confidence,
                    evidence_chunk_id: proposal.evidence_chunk_id,
                    evidence_byte_range: proposal.evidence_byte_range,
                    evidence_quote: proposal.evidence_quote,
                });
            }
        }

        let mut out: Vec<Relation> = relations.into_values().collect();
        out.sort_by(|a, b| a.rel_id.cmp(&b.rel_id));
        let counters = serde_json::json!({
            "relations_proposed": proposed,
            "relations_found": out.len(),
        });
        work.relations = out;
        Ok(Some(counters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, LocationMap};

    fn chunk_of(text: &str) -> Chunk {
        crate::chunker::chunk_text(
            "doc",
            text,
            &LocationMap::new(),
            crate::chunker::ChunkerOptions::default(),
        )
        .unwrap()
        .remove(0)
    }

    fn mention_at(chunk: &Chunk, surface: &str, entity_type: EntityType) -> Mention {
        let start = chunk.text.find(surface).unwrap();
        let normalized = ident::normalize_surface(surface);
        Mention {
            mention_id: ident::mention_id(&chunk.chunk_id, &normalized, start),
            chunk_id: chunk.chunk_id.clone(),
            surface_text: surface.into(),
            entity_type,
            start_in_chunk: start,
            end_in_chunk: start + surface.len(),
            confidence: 0.9,
            coref_cluster_id: None,
        }
    }

    #[test]
    fn founded_by_swaps_subject_and_object() {
        let chunk = chunk_of("Helios Energy was founded by Solara Labs in 2019.");
        let helios = mention_at(&chunk, "Helios Energy", EntityType::Org);
        let solara = mention_at(&chunk, "Solara Labs", EntityType::Org);
        let mut entity_of = FxHashMap::default();
        entity_of.insert(helios.mention_id.as_str(), "e-helios");
        entity_of.insert(solara.mention_id.as_str(), "e-solara");

        let proposals =
            RelationExtractor::new().propose(&chunk, &[&helios, &solara], &entity_of);
        assert_eq!(proposals.len(), 1);
        let p = &proposals[0];
        assert_eq!(p.predicate, Predicate::Founded);
        assert_eq!(p.subject_entity_id, "e-solara");
        assert_eq!(p.object_entity_id, "e-helios");
        assert_eq!(p.evidence_quote, "Helios Energy was founded by Solara Labs");
        assert_eq!(
            &chunk.text[p.evidence_byte_range.0 - chunk.start_offset
                ..p.evidence_byte_range.1 - chunk.start_offset],
            p.evidence_quote
        );
    }

    #[test]
    fn located_in_keeps_reading_order() {
        let chunk = chunk_of("Apex Systems is headquartered in Berlin.");
        let apex = mention_at(&chunk, "Apex Systems", EntityType::Org);
        let berlin = mention_at(&chunk, "Berlin", EntityType::Gpe);
        let mut entity_of = FxHashMap::default();
        entity_of.insert(apex.mention_id.as_str(), "e-apex");
        entity_of.insert(berlin.mention_id.as_str(), "e-berlin");

        let proposals = RelationExtractor::new().propose(&chunk, &[&apex, &berlin], &entity_of);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].predicate, Predicate::LocatedIn);
        assert_eq!(proposals[0].subject_entity_id, "e-apex");
        assert_eq!(proposals[0].object_entity_id, "e-berlin");
    }

    #[test]
    fn distant_or_unlinked_pairs_are_ignored() {
        let filler = "x".repeat(150);
        let text = format!("Apex Systems. {filler} based in Berlin.");
        let chunk = chunk_of(&text);
        let apex = mention_at(&chunk, "Apex Systems", EntityType::Org);
        let berlin = mention_at(&chunk, "Berlin", EntityType::Gpe);
        let mut entity_of = FxHashMap::default();
        entity_of.insert(apex.mention_id.as_str(), "e-apex");
        entity_of.insert(berlin.mention_id.as_str(), "e-berlin");

        let proposals = RelationExtractor::new().propose(&chunk, &[&apex, &berlin], &entity_of);
        assert!(proposals.is_empty());

        // Unlinked mention: no proposal either.
        let mut partial = FxHashMap::default();
        partial.insert(apex.mention_id.as_str(), "e-apex");
        let chunk2 = chunk_of("Apex Systems is based in Berlin.");
        let apex2 = mention_at(&chunk2, "Apex Systems", EntityType::Org);
        let berlin2 = mention_at(&chunk2, "Berlin", EntityType::Gpe);
        let proposals = RelationExtractor::new().propose(&chunk2, &[&apex2, &berlin2], &partial);
        assert!(proposals.is_empty());
    }

    #[test]
    fn dates_never_anchor_relations() {
        let chunk = chunk_of("Apex Systems was founded by Marco Rossi in March 2020.");
        let apex = mention_at(&chunk, "Apex Systems", EntityType::Org);
        let marco = mention_at(&chunk, "Marco Rossi", EntityType::Person);
        let date = mention_at(&chunk, "March 2020", EntityType::Date);
        let mut entity_of = FxHashMap::default();
        entity_of.insert(apex.mention_id.as_str(), "e-apex");
        entity_of.insert(marco.mention_id.as_str(), "e-marco");
        entity_of.insert(date.mention_id.as_str(), "e-date");

        let proposals =
            RelationExtractor::new().propose(&chunk, &[&apex, &marco, &date], &entity_of);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].subject_entity_id, "e-marco");
        assert_eq!(proposals[0].object_entity_id, "e-apex");
    }

    #[test]
    fn relation_ids_separate_evidence_chunks() {
        let a = ident::relation_id("s", Predicate::Founded, "o", "chunk-a");
        let b = ident::relation_id("s", Predicate::Founded, "o", "chunk-b");
        assert_ne!(a, b);
        assert_eq!(a, ident::relation_id("s", Predicate::Founded, "o", "chunk-a"));
    }
}
