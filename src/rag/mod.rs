//! Retrieval-augmented answering with verifiable citations.
//!
//! The resolver embeds the query, runs k-NN over the vector store, loads each
//! hit's chunk and owning document through the façade, prompts the generative
//! provider with numbered sources, and re-threads the returned `[n]` markers
//! into citations that resolve to exact byte ranges. Answers whose markers
//! cannot be grounded are rejected rather than returned unverifiable.

pub mod citations;

use serde_json::Value;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{Chunk, Document};
use crate::providers::{GenerateOptions, TieredEmbedder, TieredGenerator};
use crate::stores::StoreFacade;

use citations::{longest_common_substring, parse_markers};

/// Minimum grounded-quote length in bytes; shorter anchors are noise.
const MIN_QUOTE_BYTES: usize = 12;

/// One resolved citation.
#[derive(Clone, Debug, PartialEq)]
pub struct Citation {
    /// 1-based source index as cited in the answer text.
    pub index: usize,
    pub doc_id: String,
    pub doc_url: String,
    pub doc_title: String,
    pub chunk_id: String,
    /// Absolute byte range in the document's extracted text.
    pub byte_range: (usize, usize),
    pub page: Option<u32>,
    pub timestamp_ms: Option<u64>,
    /// Exact substring of the cited chunk.
    pub quote: String,
}

/// Answer plus the citations grounding it.
#[derive(Clone, Debug, PartialEq)]
pub struct GroundedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Per-query options.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub k: Option<usize>,
    /// Payload equality filter (e.g. `{"doc_id": "…"}`).
    pub filter: Option<Value>,
}

struct Source {
    index: usize,
    chunk: Chunk,
    document: Document,
}

pub struct RagResolver {
    facade: StoreFacade,
    embedder: TieredEmbedder,
    generator: TieredGenerator,
    config: EngineConfig,
}

impl RagResolver {
    pub fn new(
        facade: StoreFacade,
        embedder: TieredEmbedder,
        generator: TieredGenerator,
        config: EngineConfig,
    ) -> Self {
        Self {
            facade,
            embedder,
            generator,
            config,
        }
    }

    /// Answer `query` with inline-cited evidence.
    pub async fn answer(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<GroundedAnswer, EngineError> {
        if query.trim().is_empty() {
            return Err(EngineError::validation("query must not be empty"));
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::integrity("embedding provider returned no vector"))?;

        let k = options.k.unwrap_or(self.config.retrieval_k).max(1);
        let hits = self
            .facade
            .vector
            .search(&query_vector, k, options.filter.as_ref())
            .await?;

        let sources = self.load_sources(&hits).await?;
        if sources.is_empty() {
            return Ok(GroundedAnswer {
                answer: "No supporting evidence was found in the indexed sources.".to_string(),
                citations: Vec::new(),
            });
        }

        let prompt = build_prompt(query, &sources);
        let answer = self
            .generator
            .generate(&prompt, &GenerateOptions::default())
            .await?;

        let citations = self.ground(&answer, &sources)?;
        if citations.is_empty() {
            return Err(EngineError::integrity(
                "model answer contained no groundable citations",
            ));
        }
        Ok(GroundedAnswer { answer, citations })
    }

    async fn load_sources(
        &self,
        hits: &[crate::stores::VectorHit],
    ) -> Result<Vec<Source>, EngineError> {
        let mut sources = Vec::with_capacity(hits.len());
        for hit in hits {
            let chunk_id = hit
                .payload
                .get("chunk_id")
                .and_then(Value::as_str)
                .unwrap_or(&hit.id);
            let Some(chunk) = self.facade.chunk(chunk_id).await? else {
                debug!(
                    target: "citeweave::rag",
                    chunk_id,
                    "vector hit without a stored chunk; skipping"
                );
                continue;
            };
            let Some(document) = self.facade.document(&chunk.doc_id).await? else {
                continue;
            };
            sources.push(Source {
                index: sources.len() + 1,
                chunk,
                document,
            });
        }
        Ok(sources)
    }

    /// Re-thread `[n]` markers back into provenance records.
    fn ground(&self, answer: &str, sources: &[Source]) -> Result<Vec<Citation>, EngineError> {
        let mut citations = Vec::new();
        for marker in parse_markers(answer) {
            let Some(source) = sources.iter().find(|s| s.index == marker.index) else {
                return Err(EngineError::integrity(format!(
                    "citation [{}] does not correspond to any retrieved source",
                    marker.index
                )));
            };
            let Some((start, len)) =
                longest_common_substring(&marker.claim, &source.chunk.text)
            else {
                return Err(EngineError::integrity(format!(
                    "citation [{}] cannot be grounded in its source chunk",
                    marker.index
                )));
            };
            if len < MIN_QUOTE_BYTES {
                return Err(EngineError::integrity(format!(
                    "citation [{}] grounds on only {len} bytes of the source",
                    marker.index
                )));
            }
            let quote = source.chunk.text[start..start + len].to_string();
            citations.push(Citation {
                index: marker.index,
                doc_id: source.document.doc_id.clone(),
                doc_url: source.document.url.clone(),
                doc_title: source.document.title.clone(),
                chunk_id: source.chunk.chunk_id.clone(),
                byte_range: (
                    source.chunk.start_offset + start,
                    source.chunk.start_offset + start + len,
                ),
                page: source.chunk.page_number,
                timestamp_ms: source.chunk.timestamp_ms,
                quote,
            });
        }
        Ok(citations)
    }
}

fn build_prompt(query: &str, sources: &[Source]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the numbered sources below. \
         Cite every claim with its source marker, like [1].\n\n",
    );
    for source in sources {
        prompt.push_str(&format!(
            "SOURCE [{}] {} - {}\n{}\nEND SOURCE\n\n",
            source.index, source.document.title, source.document.url, source.chunk.text
        ));
    }
    prompt.push_str(&format!("Question: {query}\n"));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkerOptions, chunk_text};
    use crate::ident;
    use crate::model::{LocationMap, SourceKind, Tier};
    use crate::providers::{EmbeddingTier, GenerativeTier, ProviderFactory};
    use crate::stores::labels;
    use chrono::Utc;
    use serde_json::json;

    const DIM: usize = 64;

    async fn seed_document(facade: &StoreFacade, url: &str, text: &str) -> Vec<Chunk> {
        let doc_id = ident::doc_id(url).unwrap();
        let normalized = ident::normalize_url(url).unwrap();
        let document = Document {
            doc_id: doc_id.clone(),
            url: normalized,
            title: "Seeded".into(),
            source_kind: SourceKind::Web,
            ingested_at: Utc::now(),
            tier: Tier::B,
            quality_score: 6.0,
            byte_length: text.len(),
        };
        facade.relational.upsert_document(&document).await.unwrap();

        let chunks = chunk_text(
            &doc_id,
            text,
            &LocationMap::new(),
            ChunkerOptions {
                chunk_size_bytes: 200,
                overlap_bytes: 20,
            },
        )
        .unwrap();

        let factory = ProviderFactory::local_only(DIM);
        let embedder = factory.embedder(EmbeddingTier::LocalSmall);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await.unwrap();

        let mut tx = facade.graph.begin().await.unwrap();
        tx.upsert_node(labels::DOCUMENT, &doc_id, json!({}));
        for chunk in &chunks {
            tx.upsert_node(
                labels::CHUNK,
                &chunk.chunk_id,
                serde_json::to_value(chunk).unwrap(),
            );
        }
        tx.commit().await.unwrap();

        for (chunk, vector) in chunks.iter().zip(vectors) {
            facade
                .vector
                .upsert(
                    &chunk.chunk_id,
                    vector,
                    json!({ "chunk_id": chunk.chunk_id, "doc_id": doc_id }),
                )
                .await
                .unwrap();
        }
        chunks
    }

    fn resolver(facade: StoreFacade) -> RagResolver {
        let factory = ProviderFactory::local_only(DIM);
        RagResolver::new(
            facade,
            factory.embedder(EmbeddingTier::LocalSmall),
            factory.generator(GenerativeTier::Nano),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn answers_carry_citations_that_resolve_to_byte_ranges() {
        let facade = StoreFacade::in_memory(DIM);
        let chunks = seed_document(
            &facade,
            "https://example.com/energy",
            "Solar output doubled across the fleet in 2024. Grid storage also grew quickly that year.",
        )
        .await;

        let rag = resolver(facade.clone());
        let answer = rag
            .answer("what happened to solar output", &QueryOptions::default())
            .await
            .unwrap();

        assert!(!answer.citations.is_empty());
        for citation in &answer.citations {
            let chunk = chunks
                .iter()
                .find(|c| c.chunk_id == citation.chunk_id)
                .unwrap();
            // Provenance roundtrip: the quote is an exact substring at the
            // cited byte range.
            assert!(chunk.text.contains(&citation.quote));
            let local = (
                citation.byte_range.0 - chunk.start_offset,
                citation.byte_range.1 - chunk.start_offset,
            );
            assert_eq!(&chunk.text[local.0..local.1], citation.quote);
        }
    }

    #[tokio::test]
    async fn empty_index_yields_a_no_evidence_answer() {
        let facade = StoreFacade::in_memory(DIM);
        let rag = resolver(facade);
        let answer = rag
            .answer("anything at all", &QueryOptions::default())
            .await
            .unwrap();
        assert!(answer.answer.contains("No supporting evidence"));
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn empty_queries_are_rejected() {
        let facade = StoreFacade::in_memory(DIM);
        let rag = resolver(facade);
        let err = rag.answer("   ", &QueryOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn filters_restrict_retrieval_to_matching_payloads() {
        let facade = StoreFacade::in_memory(DIM);
        seed_document(
            &facade,
            "https://example.com/a",
            "Alpha reactors produce steady baseline power for the region.",
        )
        .await;
        seed_document(
            &facade,
            "https://example.com/b",
            "Beta turbines harvest wind along the northern coast.",
        )
        .await;

        let rag = resolver(facade);
        let doc_b = ident::doc_id("https://example.com/b").unwrap();
        let answer = rag
            .answer(
                "wind power",
                &QueryOptions {
                    k: Some(4),
                    filter: Some(json!({ "doc_id": doc_b })),
                },
            )
            .await
            .unwrap();
        for citation in &answer.citations {
            assert_eq!(citation.doc_id, doc_b);
        }
    }

    #[test]
    fn ungrounded_markers_reject_the_answer() {
        let facade = StoreFacade::in_memory(DIM);
        let rag = resolver(facade);
        let chunk = Chunk {
            chunk_id: "d:0000000000".into(),
            doc_id: "d".into(),
            start_offset: 0,
            end_offset: 10,
            text: "short text".into(),
            token_count: 2,
            heading_path: Vec::new(),
            page_number: None,
            timestamp_ms: None,
            embedding: None,
        };
        let document = Document {
            doc_id: "d".into(),
            url: "https://example.com".into(),
            title: "t".into(),
            source_kind: SourceKind::Web,
            ingested_at: Utc::now(),
            tier: Tier::C,
            quality_score: 5.0,
            byte_length: 10,
        };
        let sources = vec![Source {
            index: 1,
            chunk,
            document,
        }];

        // Marker [2] has no source; marker [1]'s claim shares nothing with
        // the chunk text.
        let err = rag
            .ground("Completely unrelated claim with marker [2]", &sources)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DataIntegrity);

        let err = rag
            .ground("zzzz qqqq wwww [1]", &sources)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DataIntegrity);
    }
}
