//! Advisory coreference resolution.
//!
//! A heuristic resolver: capitalized noun phrases are antecedent candidates,
//! and each anaphor (pronoun) is linked to the nearest preceding candidate in
//! the same chunk. Clusters with at least one anaphor are emitted; NER later
//! tags mentions whose spans overlap a cluster span. The whole stage is
//! advisory: the orchestrator downgrades its failure to a warning.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::error::EngineError;
use crate::model::Stage;

use super::{IngestWork, PipelineStage, StageContext};

const ANAPHORS: &[&str] = &[
    "he", "him", "his", "she", "her", "hers", "it", "its", "they", "them", "their", "theirs",
];

/// One coreferring span inside a chunk (byte offsets into the chunk text).
#[derive(Clone, Debug, PartialEq)]
pub struct CorefSpan {
    pub start: usize,
    pub end: usize,
    pub cluster_id: String,
    pub is_anaphor: bool,
}

pub struct CorefResolver {
    noun_phrase: Regex,
    word: Regex,
}

impl Default for CorefResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CorefResolver {
    pub fn new() -> Self {
        Self {
            noun_phrase: Regex::new(r"\b[A-Z][A-Za-z0-9&.-]*(?:\s+[A-Z][A-Za-z0-9&.-]*)*")
                .expect("static regex"),
            word: Regex::new(r"\b[A-Za-z]+\b").expect("static regex"),
        }
    }

    /// Resolve one chunk. `chunk_id` seeds the cluster ids so they stay
    /// deterministic across runs.
    pub fn resolve_chunk(&self, chunk_id: &str, text: &str) -> Vec<CorefSpan> {
        struct Candidate {
            start: usize,
            end: usize,
            cluster: Option<usize>,
        }

        let mut candidates: Vec<Candidate> = self
            .noun_phrase
            .find_iter(text)
            .filter(|m| !is_sentence_initial_stopword(m.as_str()))
            .map(|m| Candidate {
                start: m.start(),
                end: m.end(),
                cluster: None,
            })
            .collect();

        let mut spans: Vec<CorefSpan> = Vec::new();
        let mut next_cluster = 0usize;

        for word in self.word.find_iter(text) {
            if !ANAPHORS.contains(&word.as_str().to_lowercase().as_str()) {
                continue;
            }
            let Some(antecedent) = candidates
                .iter_mut()
                .filter(|c| c.end <= word.start())
                .next_back()
            else {
                continue;
            };
            let cluster = *antecedent.cluster.get_or_insert_with(|| {
                let id = next_cluster;
                next_cluster += 1;
                id
            });
            spans.push(CorefSpan {
                start: word.start(),
                end: word.end(),
                cluster_id: cluster_label(chunk_id, cluster),
                is_anaphor: true,
            });
        }

        // Antecedents join the output only once an anaphor refers to them.
        for candidate in candidates {
            if let Some(cluster) = candidate.cluster {
                spans.push(CorefSpan {
                    start: candidate.start,
                    end: candidate.end,
                    cluster_id: cluster_label(chunk_id, cluster),
                    is_anaphor: false,
                });
            }
        }
        spans.sort_by_key(|span| span.start);
        spans
    }
}

fn cluster_label(chunk_id: &str, cluster: usize) -> String {
    format!("{chunk_id}#c{cluster}")
}

/// A capitalized word that opens a sentence ("The", "It", …) is not an
/// antecedent candidate on its own.
fn is_sentence_initial_stopword(phrase: &str) -> bool {
    matches!(
        phrase,
        "The" | "A" | "An" | "This" | "That" | "These" | "Those" | "It" | "He" | "She" | "They"
    )
}

#[async_trait]
impl PipelineStage for CorefResolver {
    fn stage(&self) -> Stage {
        Stage::Coref
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        if !cx.config.coref_enabled {
            return Ok(Some(serde_json::json!({ "clusters": 0, "disabled": true })));
        }
        let mut clusters = 0usize;
        let mut spans_out = Vec::with_capacity(work.chunks.len());
        for chunk in &work.chunks {
            cx.check_cancelled()?;
            let spans = self.resolve_chunk(&chunk.chunk_id, &chunk.text);
            clusters += spans
                .iter()
                .map(|s| s.cluster_id.as_str())
                .collect::<std::collections::BTreeSet<_>>()
                .len();
            spans_out.push((chunk.chunk_id.clone(), spans));
        }
        work.coref_spans = spans_out;
        Ok(Some(serde_json::json!({ "clusters": clusters })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pronouns_link_to_the_nearest_preceding_noun_phrase() {
        let resolver = CorefResolver::new();
        let spans =
            resolver.resolve_chunk("c1", "Marie Curie won twice. She pioneered radiochemistry.");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, 0);
        assert!(!spans[0].is_anaphor);
        assert!(spans[1].is_anaphor);
        assert_eq!(spans[0].cluster_id, spans[1].cluster_id);
        assert!(spans[0].cluster_id.starts_with("c1#c"));
    }

    #[test]
    fn unlinked_noun_phrases_are_not_emitted() {
        let resolver = CorefResolver::new();
        let spans = resolver.resolve_chunk("c1", "Acme Corp announced results in Berlin.");
        assert!(spans.is_empty());
    }

    #[test]
    fn pronouns_without_antecedents_are_skipped() {
        let resolver = CorefResolver::new();
        let spans = resolver.resolve_chunk("c1", "it rained all day in the valley");
        assert!(spans.is_empty());
    }

    #[test]
    fn cluster_ids_are_deterministic() {
        let resolver = CorefResolver::new();
        let text = "Ada Lovelace wrote notes. She annotated the engine. Charles Babbage read them; he replied.";
        let a = resolver.resolve_chunk("c9", text);
        let b = resolver.resolve_chunk("c9", text);
        assert_eq!(a, b);
        let clusters: std::collections::BTreeSet<_> =
            a.iter().map(|s| s.cluster_id.clone()).collect();
        assert_eq!(clusters.len(), 2);
    }
}
