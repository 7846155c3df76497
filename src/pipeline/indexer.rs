//! Atomic commit of a job's working set (best-effort two-phase commit).
//!
//! Order of operations:
//!
//! 1. blob store: raw source, extracted text, location map (skipped when
//!    already present);
//! 2. relational store: document row upsert, preserving the original
//!    `ingested_at` on re-ingestion;
//! 3. graph store: one transaction per batch for every node and edge,
//!    entity merges included; commits are bounded by the configured ceiling
//!    and a timeout surfaces as transient;
//! 4. vector store: chunk embedding upserts;
//! 5. cache: best-effort invalidation of derived keys.
//!
//! Steps 1, 2 and 4 are idempotent puts, so partial work before a retry is
//! harmless. Graph transactions are all-or-nothing, and edges are only ever
//! staged next to their endpoint nodes, so no orphan edge can land.
//!
//! [`commit_core`] (document + chunks + location map) also runs right after
//! the chunk stage: a job cancelled mid-transform leaves its document and
//! chunks queryable while mentions, entities, and relations never land.

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use crate::model::{Chunk, Document, Entity, Stage, Tier};
use crate::stores::{
    BlobMetadata, GraphQuery, GraphTransaction, StoreFacade, StoreError, labels,
};

use super::{IngestWork, PipelineStage, StageContext};

/// What the indexer committed, for counters and tests.
#[derive(Clone, Debug, Default)]
pub struct IndexReport {
    pub nodes_staged: usize,
    pub edges_staged: usize,
    pub vectors_upserted: usize,
    pub document: Option<Document>,
}

/// Commit the document-level core: blobs, the relational row, and the
/// document + chunk subgraph. Idempotent; called after chunking and again
/// from the index stage.
pub async fn commit_core(
    work: &IngestWork,
    cx: &StageContext,
) -> Result<(Document, usize, usize), EngineError> {
    let extraction = work.extraction()?;
    for chunk in &work.chunks {
        if chunk.end_offset > extraction.text.len() {
            return Err(EngineError::integrity(format!(
                "chunk {} ends at {} but the document is {} bytes",
                chunk.chunk_id,
                chunk.end_offset,
                extraction.text.len()
            )));
        }
    }

    let document = build_document(work, cx).await?;
    let tier = document.tier;
    let facade = &cx.facade;

    put_blob_if_absent(
        facade,
        &StoreFacade::blob_key(tier, &document.doc_id, "raw"),
        extraction.raw.clone(),
        "application/octet-stream",
    )
    .await?;
    put_blob_if_absent(
        facade,
        &StoreFacade::blob_key(tier, &document.doc_id, "text"),
        extraction.text.clone().into_bytes(),
        "text/plain; charset=utf-8",
    )
    .await?;
    facade
        .put_location_map(tier, &document.doc_id, &extraction.location_map)
        .await?;

    facade.relational.upsert_document(&document).await?;

    let mut tx = facade.graph.begin().await?;
    let mut nodes = 0usize;
    let mut edges = 0usize;
    tx.upsert_node(
        labels::DOCUMENT,
        &document.doc_id,
        serde_json::to_value(&document).map_err(StoreError::from)?,
    );
    nodes += 1;
    for chunk in &work.chunks {
        tx.upsert_node(labels::CHUNK, &chunk.chunk_id, chunk_props(chunk)?);
        tx.upsert_edge(
            &labels::edge_key(&chunk.chunk_id, labels::PART_OF, &document.doc_id),
            &chunk.chunk_id,
            labels::PART_OF,
            &document.doc_id,
            Value::Null,
        );
        nodes += 1;
        edges += 1;
    }
    commit_with_ceiling(tx, cx).await?;

    Ok((document, nodes, edges))
}

pub struct IndexStage;

#[async_trait]
impl PipelineStage for IndexStage {
    fn stage(&self) -> Stage {
        Stage::Index
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let facade = cx.facade.clone();
        let (document, mut nodes, mut edges) = commit_core(work, cx).await?;
        let tier = document.tier;

        // Second transaction: everything derived below the chunk level.
        let entities = reconciled_entities(work, cx).await?;
        let mut tx = facade.graph.begin().await?;

        for mention in &work.mentions {
            tx.upsert_node(
                labels::MENTION,
                &mention.mention_id,
                serde_json::to_value(mention).map_err(StoreError::from)?,
            );
            tx.upsert_edge(
                &labels::edge_key(&mention.mention_id, labels::FOUND_IN, &mention.chunk_id),
                &mention.mention_id,
                labels::FOUND_IN,
                &mention.chunk_id,
                Value::Null,
            );
            nodes += 1;
            edges += 1;
        }

        for entity in &entities {
            tx.upsert_node(
                labels::ENTITY,
                &entity.entity_id,
                serde_json::to_value(entity).map_err(StoreError::from)?,
            );
            nodes += 1;
        }

        if let Some(plan) = &work.link_plan {
            for link in &plan.refers_to {
                tx.upsert_edge(
                    &labels::edge_key(&link.mention_id, labels::REFERS_TO, &link.entity_id),
                    &link.mention_id,
                    labels::REFERS_TO,
                    &link.entity_id,
                    serde_json::json!({ "confidence": link.confidence }),
                );
                edges += 1;
            }
        }

        // COREF_WITH is symmetric; store each adjacent pair once with the
        // endpoints ordered, and leave the transitive closure implicit.
        for (a, b) in coref_pairs(work) {
            let (src, dst) = if a <= b { (&a, &b) } else { (&b, &a) };
            tx.upsert_edge(
                &labels::edge_key(src, labels::COREF_WITH, dst),
                src,
                labels::COREF_WITH,
                dst,
                Value::Null,
            );
            edges += 1;
        }

        for relation in &work.relations {
            tx.upsert_edge(
                &relation.rel_id,
                &relation.subject_entity_id,
                relation.predicate.as_str(),
                &relation.object_entity_id,
                serde_json::to_value(relation).map_err(StoreError::from)?,
            );
            edges += 1;
        }

        commit_with_ceiling(tx, cx).await?;

        // Vector upserts (idempotent by chunk id).
        let mut vectors = 0usize;
        for chunk in &work.chunks {
            let Some(embedding) = &chunk.embedding else {
                continue;
            };
            cx.check_cancelled()?;
            facade
                .vector
                .upsert(&chunk.chunk_id, embedding.clone(), vector_payload(chunk, tier))
                .await?;
            vectors += 1;
        }

        // Best-effort cache invalidation.
        let _ = facade
            .cache
            .invalidate(&format!("doc:{}", document.doc_id))
            .await;

        debug!(
            target: "citeweave::indexer",
            doc_id = %document.doc_id,
            nodes,
            edges,
            vectors,
            "index commit complete"
        );

        let counters = serde_json::json!({
            "nodes_staged": nodes,
            "edges_staged": edges,
            "vectors_upserted": vectors,
        });
        work.index_report = Some(IndexReport {
            nodes_staged: nodes,
            edges_staged: edges,
            vectors_upserted: vectors,
            document: Some(document),
        });
        Ok(Some(counters))
    }
}

async fn commit_with_ceiling(
    tx: Box<dyn GraphTransaction>,
    cx: &StageContext,
) -> Result<(), EngineError> {
    match tokio::time::timeout(cx.config.graph_commit_timeout, tx.commit()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(EngineError::transient(format!(
            "graph commit exceeded {}s ceiling",
            cx.config.graph_commit_timeout.as_secs()
        ))),
    }
}

async fn put_blob_if_absent(
    facade: &StoreFacade,
    key: &str,
    bytes: Vec<u8>,
    content_type: &str,
) -> Result<(), EngineError> {
    if !facade.blob.exists(key).await? {
        facade
            .blob
            .put(key, bytes, BlobMetadata::of(content_type))
            .await?;
    }
    Ok(())
}

async fn build_document(work: &IngestWork, cx: &StageContext) -> Result<Document, EngineError> {
    let extraction = work.extraction()?;
    let quality_score = quality_score(work);
    // Re-ingestion keeps the original ingestion timestamp.
    let ingested_at = cx
        .facade
        .relational
        .document(&work.doc_id)
        .await?
        .map(|existing| existing.ingested_at)
        .unwrap_or_else(Utc::now);

    Ok(Document {
        doc_id: work.doc_id.clone(),
        url: work.normalized_url.clone(),
        title: extraction.metadata.title.clone(),
        source_kind: work.source_kind.unwrap_or(crate::model::SourceKind::Other),
        ingested_at,
        tier: Tier::from_quality(quality_score),
        quality_score,
        byte_length: extraction.text.len(),
    })
}

/// Deterministic quality heuristic feeding the tier bucket.
fn quality_score(work: &IngestWork) -> f32 {
    let Some(extraction) = work.extraction.as_ref() else {
        return 0.0;
    };
    let mut score = 5.0f32;
    if !extraction.metadata.title.is_empty() {
        score += 1.0;
    }
    if extraction.text.len() >= 2000 {
        score += 1.0;
    }
    if extraction
        .location_map
        .entries()
        .iter()
        .any(|e| !e.heading_path.is_empty() || e.page_number.is_some() || e.timestamp_ms.is_some())
    {
        score += 1.0;
    }
    score.clamp(0.0, 10.0)
}

/// Chunk node properties; the embedding stays out of the graph (the vector
/// store owns it).
fn chunk_props(chunk: &Chunk) -> Result<Value, StoreError> {
    let mut stripped = chunk.clone();
    stripped.embedding = None;
    Ok(serde_json::to_value(&stripped)?)
}

fn vector_payload(chunk: &Chunk, tier: Tier) -> Value {
    serde_json::json!({
        "chunk_id": chunk.chunk_id,
        "doc_id": chunk.doc_id,
        "tier": tier.as_str(),
        "heading_path": chunk.heading_path,
        "page": chunk.page_number,
        "timestamp_ms": chunk.timestamp_ms,
    })
}

/// Adjacent mention pairs within each coref cluster.
fn coref_pairs(work: &IngestWork) -> Vec<(String, String)> {
    let mut clusters: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for mention in &work.mentions {
        if let Some(cluster) = &mention.coref_cluster_id {
            clusters
                .entry(cluster.as_str())
                .or_default()
                .push(mention.mention_id.as_str());
        }
    }
    let mut pairs = Vec::new();
    for members in clusters.values() {
        for window in members.windows(2) {
            pairs.push((window[0].to_string(), window[1].to_string()));
        }
    }
    pairs
}

/// Correct the linker's optimistic mention counts against the store: an
/// already-present `REFERS_TO` edge (a replay) must not inflate the count.
async fn reconciled_entities(
    work: &IngestWork,
    cx: &StageContext,
) -> Result<Vec<Entity>, EngineError> {
    let Some(plan) = &work.link_plan else {
        return Ok(Vec::new());
    };
    let mut entities = Vec::with_capacity(plan.entities.len());
    for planned in &plan.entities {
        let stored: Option<Entity> = match cx.facade.graph.node(&planned.entity_id).await? {
            Some(crate::stores::GraphRow::Node { props, .. }) => {
                Some(serde_json::from_value(props).map_err(|err| {
                    EngineError::integrity(format!("stored entity is malformed: {err}"))
                })?)
            }
            _ => None,
        };

        let mut new_links = 0u64;
        for link in plan.refers_to.iter().filter(|l| l.entity_id == planned.entity_id) {
            let key = labels::edge_key(&link.mention_id, labels::REFERS_TO, &link.entity_id);
            let existing = cx
                .facade
                .graph
                .query(GraphQuery::EdgesFrom {
                    src: link.mention_id.clone(),
                    label: Some(labels::REFERS_TO.to_string()),
                })
                .await?;
            let already = existing.iter().any(|row| {
                matches!(row, crate::stores::GraphRow::Edge { key: k, .. } if k == &key)
            });
            if !already {
                new_links += 1;
            }
        }

        let mut entity = planned.clone();
        match stored {
            Some(stored) => {
                entity.mention_count = stored.mention_count + new_links;
                for alias in stored.aliases {
                    if !entity.aliases.contains(&alias) {
                        entity.aliases.push(alias);
                    }
                }
                if entity.context_embedding.is_none() {
                    entity.context_embedding = stored.context_embedding;
                }
            }
            None => {
                entity.mention_count = new_links;
            }
        }
        entities.push(entity);
    }
    Ok(entities)
}
