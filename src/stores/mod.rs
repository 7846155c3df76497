//! Capability interfaces over the five backing stores.
//!
//! The façade is the only layer that knows backend-specific details. Every
//! write goes through an idempotent upsert keyed by a deterministic id, so
//! replaying a stage is always safe.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  StoreFacade │
//!                 └──────┬───────┘
//!        ┌───────┬───────┼───────┬─────────┐
//!        ▼       ▼       ▼       ▼         ▼
//!      Blob   Vector   Graph  Relational  Cache
//! ```
//!
//! The in-memory fabric ([`memory`]) implements every capability and is the
//! default test substrate. The SQLite backend ([`sqlite`], feature `sqlite`)
//! provides a durable [`RelationalStore`].

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::{Chunk, Document, Job, JobStatus, LocationMap, ProgressEvent, Tier};

pub use memory::{MemoryBlobStore, MemoryCache, MemoryGraphStore, MemoryRelationalStore, MemoryVectorStore};

/// Errors surfaced by any backing store.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("not found: {what}")]
    #[diagnostic(code(citeweave::store::not_found))]
    NotFound { what: String },

    #[error("conflict: {what}")]
    #[diagnostic(
        code(citeweave::store::conflict),
        help("Another writer touched this record; the operation may succeed on retry.")
    )]
    Conflict { what: String },

    #[error("transient store failure: {reason}")]
    #[diagnostic(code(citeweave::store::transient))]
    Transient { reason: String },

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    #[diagnostic(
        code(citeweave::store::dimension),
        help("The vector collection dimension is fixed at creation and must match the embedding provider.")
    )]
    DimensionMismatch { expected: usize, got: usize },

    #[error("edge {src} -[{label}]-> {dst} references a missing endpoint")]
    #[diagnostic(
        code(citeweave::store::orphan_edge),
        help("Edges are committed only after both endpoint nodes exist in the same transaction.")
    )]
    OrphanEdge {
        src: String,
        label: String,
        dst: String,
    },

    #[error("serialization error: {0}")]
    #[diagnostic(code(citeweave::store::serde))]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {message}")]
    #[diagnostic(code(citeweave::store::backend))]
    Backend { message: String },
}

impl StoreError {
    /// Classification used by the engine-wide retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Transient { .. }
            | StoreError::Conflict { .. }
            | StoreError::Backend { .. } => ErrorKind::Transient,
            StoreError::NotFound { .. }
            | StoreError::DimensionMismatch { .. }
            | StoreError::OrphanEdge { .. }
            | StoreError::Serialization(_) => ErrorKind::DataIntegrity,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Metadata attached to a stored blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobMetadata {
    pub content_type: String,
}

impl BlobMetadata {
    pub fn of(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
        }
    }
}

/// Object storage for raw sources and extracted text.
///
/// Keys are tier-prefixed (`tier-A/{doc_id}/raw`); see [`StoreFacade::blob_key`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Idempotent put; returns the content etag.
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: BlobMetadata) -> StoreResult<String>;
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
}

/// One nearest-neighbour search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Vector index with a dimension fixed at collection creation.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn dim(&self) -> usize;
    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Value) -> StoreResult<()>;
    /// k-NN by cosine similarity. `filter` is a JSON object whose fields must
    /// all equal the corresponding payload fields.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Value>,
    ) -> StoreResult<Vec<VectorHit>>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
    async fn len(&self) -> StoreResult<usize>;
}

/// Typed query surface over the graph store.
#[derive(Clone, Debug)]
pub enum GraphQuery {
    NodesByLabel(String),
    NodeById(String),
    EdgesFrom { src: String, label: Option<String> },
    EdgesTo { dst: String, label: Option<String> },
    CountNodes { label: Option<String> },
    CountEdges { label: Option<String> },
}

/// One row of a graph query result.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphRow {
    Node {
        id: String,
        label: String,
        props: Value,
    },
    Edge {
        key: String,
        src: String,
        label: String,
        dst: String,
        props: Value,
    },
    Count(u64),
}

/// Staged, transactional batch of graph mutations.
///
/// Mutations are buffered until [`commit`](GraphTransaction::commit); commit
/// validates that every edge endpoint exists (among prior nodes or nodes
/// staged in the same batch) before anything becomes visible.
#[async_trait]
pub trait GraphTransaction: Send {
    fn upsert_node(&mut self, label: &str, id: &str, props: Value);
    /// `key` makes the edge identity explicit: structural edges use
    /// `src|label|dst`; relation edges use their `rel_id` so multiple
    /// evidences stay distinct edges.
    fn upsert_edge(&mut self, key: &str, src: &str, label: &str, dst: &str, props: Value);
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>);
}

/// Graph of documents, chunks, mentions, entities, and their edges.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn GraphTransaction>>;
    async fn node(&self, id: &str) -> StoreResult<Option<GraphRow>>;
    async fn query(&self, query: GraphQuery) -> StoreResult<Vec<GraphRow>>;
    /// Remove a node and all incident edges. Used by maintenance sweeps only.
    async fn delete_node(&self, id: &str) -> StoreResult<()>;
}

/// Durable job, progress, and document metadata records.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn upsert_job(&self, job: &Job) -> StoreResult<()>;
    async fn job(&self, job_id: Uuid) -> StoreResult<Option<Job>>;
    async fn jobs_with_status(&self, status: JobStatus) -> StoreResult<Vec<Job>>;
    /// Jobs currently claimed by a worker (for the heartbeat reaper).
    async fn running_jobs(&self) -> StoreResult<Vec<Job>>;
    async fn delete_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Append-only, idempotent on `(job_id, seq)`.
    async fn append_progress(&self, event: &ProgressEvent) -> StoreResult<()>;
    async fn progress_since(&self, job_id: Uuid, from_seq: u64) -> StoreResult<Vec<ProgressEvent>>;
    async fn prune_progress_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn upsert_document(&self, document: &Document) -> StoreResult<()>;
    async fn document(&self, doc_id: &str) -> StoreResult<Option<Document>>;
}

/// Subscription handle for cache pub/sub topics.
pub struct CacheSubscription {
    receiver: broadcast::Receiver<Value>,
}

impl CacheSubscription {
    pub fn new(receiver: broadcast::Receiver<Value>) -> Self {
        Self { receiver }
    }

    /// Next published message; `None` once the topic is closed. Lagged
    /// deliveries are skipped (at-least-once, not exactly-once).
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Typed key/value cache with TTL plus per-topic pub/sub.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>>;
    async fn put_json(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()>;
    async fn invalidate(&self, key: &str) -> StoreResult<()>;
    async fn publish(&self, topic: &str, message: Value) -> StoreResult<()>;
    fn subscribe(&self, topic: &str) -> CacheSubscription;
}

/// Uniform handle over the five backends.
///
/// Cloning is cheap; all fields are shared.
#[derive(Clone)]
pub struct StoreFacade {
    pub blob: Arc<dyn BlobStore>,
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub relational: Arc<dyn RelationalStore>,
    pub cache: Arc<dyn Cache>,
}

impl StoreFacade {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            blob,
            vector,
            graph,
            relational,
            cache,
        }
    }

    /// All-in-memory fabric with a vector collection of the given dimension.
    pub fn in_memory(dim: usize) -> Self {
        Self::new(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryVectorStore::new(dim)),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryRelationalStore::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    /// Tier-prefixed blob key: `tier-{A..D}/{doc_id}/{artifact}`.
    pub fn blob_key(tier: Tier, doc_id: &str, artifact: &str) -> String {
        format!("tier-{}/{}/{}", tier.as_str(), doc_id, artifact)
    }

    pub async fn put_location_map(
        &self,
        tier: Tier,
        doc_id: &str,
        map: &LocationMap,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(map)?;
        self.blob
            .put(
                &Self::blob_key(tier, doc_id, "locmap.json"),
                bytes,
                BlobMetadata::of("application/json"),
            )
            .await?;
        Ok(())
    }

    pub async fn location_map(&self, tier: Tier, doc_id: &str) -> StoreResult<LocationMap> {
        let bytes = self
            .blob
            .get(&Self::blob_key(tier, doc_id, "locmap.json"))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load a chunk record from its graph node.
    pub async fn chunk(&self, chunk_id: &str) -> StoreResult<Option<Chunk>> {
        match self.graph.node(chunk_id).await? {
            Some(GraphRow::Node { label, props, .. }) if label == labels::CHUNK => {
                Ok(Some(serde_json::from_value(props)?))
            }
            _ => Ok(None),
        }
    }

    pub async fn document(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        self.relational.document(doc_id).await
    }
}

/// Graph node and edge label vocabulary.
pub mod labels {
    pub const DOCUMENT: &str = "Document";
    pub const CHUNK: &str = "Chunk";
    pub const MENTION: &str = "Mention";
    pub const ENTITY: &str = "Entity";

    pub const PART_OF: &str = "PART_OF";
    pub const FOUND_IN: &str = "FOUND_IN";
    pub const REFERS_TO: &str = "REFERS_TO";
    pub const COREF_WITH: &str = "COREF_WITH";

    /// Key for a structural (singular) edge.
    pub fn edge_key(src: &str, label: &str, dst: &str) -> String {
        format!("{src}|{label}|{dst}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_keys_are_tier_prefixed() {
        assert_eq!(
            StoreFacade::blob_key(Tier::B, "abc", "raw"),
            "tier-B/abc/raw"
        );
    }

    #[test]
    fn store_error_kinds_feed_the_retry_policy() {
        assert_eq!(
            StoreError::Transient {
                reason: "socket".into()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(StoreError::not_found("chunk").kind(), ErrorKind::DataIntegrity);
        assert_eq!(
            StoreError::DimensionMismatch {
                expected: 256,
                got: 64
            }
            .kind(),
            ErrorKind::DataIntegrity
        );
    }
}
