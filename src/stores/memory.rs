//! In-memory implementations of every store capability.
//!
//! These back the test fabric and small deployments. Locks guard short
//! critical sections only; nothing is held across an await point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Document, Job, JobStatus, ProgressEvent};

use super::{
    BlobMetadata, BlobStore, Cache, CacheSubscription, GraphQuery, GraphRow, GraphStore,
    GraphTransaction, RelationalStore, StoreError, StoreResult, VectorHit, VectorStore,
};

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<FxHashMap<String, (Vec<u8>, BlobMetadata, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn content_etag(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: BlobMetadata) -> StoreResult<String> {
        let etag = content_etag(&bytes);
        self.objects
            .write()
            .insert(key.to_string(), (bytes, metadata, etag.clone()));
        Ok(etag)
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .map(|(bytes, _, _)| bytes.clone())
            .ok_or_else(|| StoreError::not_found(format!("blob {key}")))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("blob {key}")))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.objects.read().contains_key(key))
    }
}

// ---------------------------------------------------------------------------
// Vector
// ---------------------------------------------------------------------------

pub struct MemoryVectorStore {
    dim: usize,
    vectors: RwLock<FxHashMap<String, (Vec<f32>, Value)>>,
}

impl MemoryVectorStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: RwLock::new(FxHashMap::default()),
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn payload_matches(payload: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected)),
        None => true,
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Value) -> StoreResult<()> {
        if vector.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        self.vectors
            .write()
            .insert(id.to_string(), (vector, payload));
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Value>,
    ) -> StoreResult<Vec<VectorHit>> {
        if vector.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        let mut hits: Vec<VectorHit> = self
            .vectors
            .read()
            .iter()
            .filter(|(_, (_, payload))| filter.is_none_or(|f| payload_matches(payload, f)))
            .map(|(id, (stored, payload))| VectorHit {
                id: id.clone(),
                score: cosine(vector, stored),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.vectors.write().remove(id);
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.vectors.read().len())
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct NodeRecord {
    label: String,
    props: Value,
}

#[derive(Clone, Debug)]
struct EdgeRecord {
    src: String,
    label: String,
    dst: String,
    props: Value,
}

#[derive(Default)]
struct GraphInner {
    nodes: FxHashMap<String, NodeRecord>,
    edges: FxHashMap<String, EdgeRecord>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Arc<RwLock<GraphInner>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryGraphTransaction {
    inner: Arc<RwLock<GraphInner>>,
    staged_nodes: Vec<(String, String, Value)>,
    staged_edges: Vec<(String, EdgeRecord)>,
}

#[async_trait]
impl GraphTransaction for MemoryGraphTransaction {
    fn upsert_node(&mut self, label: &str, id: &str, props: Value) {
        self.staged_nodes
            .push((label.to_string(), id.to_string(), props));
    }

    fn upsert_edge(&mut self, key: &str, src: &str, label: &str, dst: &str, props: Value) {
        self.staged_edges.push((
            key.to_string(),
            EdgeRecord {
                src: src.to_string(),
                label: label.to_string(),
                dst: dst.to_string(),
                props,
            },
        ));
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut inner = self.inner.write();
        // Validate before mutating: an edge may only land if both endpoints
        // already exist or arrive in this same batch.
        for (_, edge) in &self.staged_edges {
            let src_ok = inner.nodes.contains_key(&edge.src)
                || self.staged_nodes.iter().any(|(_, id, _)| id == &edge.src);
            let dst_ok = inner.nodes.contains_key(&edge.dst)
                || self.staged_nodes.iter().any(|(_, id, _)| id == &edge.dst);
            if !src_ok || !dst_ok {
                return Err(StoreError::OrphanEdge {
                    src: edge.src.clone(),
                    label: edge.label.clone(),
                    dst: edge.dst.clone(),
                });
            }
        }
        for (label, id, props) in self.staged_nodes {
            inner.nodes.insert(id, NodeRecord { label, props });
        }
        for (key, edge) in self.staged_edges {
            inner.edges.insert(key, edge);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        // Staged-only transaction: dropping the buffers is the rollback.
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn begin(&self) -> StoreResult<Box<dyn GraphTransaction>> {
        Ok(Box::new(MemoryGraphTransaction {
            inner: Arc::clone(&self.inner),
            staged_nodes: Vec::new(),
            staged_edges: Vec::new(),
        }))
    }

    async fn node(&self, id: &str) -> StoreResult<Option<GraphRow>> {
        Ok(self.inner.read().nodes.get(id).map(|record| GraphRow::Node {
            id: id.to_string(),
            label: record.label.clone(),
            props: record.props.clone(),
        }))
    }

    async fn query(&self, query: GraphQuery) -> StoreResult<Vec<GraphRow>> {
        let inner = self.inner.read();
        let rows = match query {
            GraphQuery::NodesByLabel(label) => inner
                .nodes
                .iter()
                .filter(|(_, record)| record.label == label)
                .map(|(id, record)| GraphRow::Node {
                    id: id.clone(),
                    label: record.label.clone(),
                    props: record.props.clone(),
                })
                .collect(),
            GraphQuery::NodeById(id) => inner
                .nodes
                .get(&id)
                .map(|record| GraphRow::Node {
                    id: id.clone(),
                    label: record.label.clone(),
                    props: record.props.clone(),
                })
                .into_iter()
                .collect(),
            GraphQuery::EdgesFrom { src, label } => inner
                .edges
                .iter()
                .filter(|(_, edge)| {
                    edge.src == src && label.as_deref().is_none_or(|l| edge.label == l)
                })
                .map(|(key, edge)| edge_row(key, edge))
                .collect(),
            GraphQuery::EdgesTo { dst, label } => inner
                .edges
                .iter()
                .filter(|(_, edge)| {
                    edge.dst == dst && label.as_deref().is_none_or(|l| edge.label == l)
                })
                .map(|(key, edge)| edge_row(key, edge))
                .collect(),
            GraphQuery::CountNodes { label } => {
                let count = inner
                    .nodes
                    .values()
                    .filter(|record| label.as_deref().is_none_or(|l| record.label == l))
                    .count() as u64;
                vec![GraphRow::Count(count)]
            }
            GraphQuery::CountEdges { label } => {
                let count = inner
                    .edges
                    .values()
                    .filter(|edge| label.as_deref().is_none_or(|l| edge.label == l))
                    .count() as u64;
                vec![GraphRow::Count(count)]
            }
        };
        Ok(rows)
    }

    async fn delete_node(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.nodes.remove(id);
        inner.edges.retain(|_, edge| edge.src != id && edge.dst != id);
        Ok(())
    }
}

fn edge_row(key: &str, edge: &EdgeRecord) -> GraphRow {
    GraphRow::Edge {
        key: key.to_string(),
        src: edge.src.clone(),
        label: edge.label.clone(),
        dst: edge.dst.clone(),
        props: edge.props.clone(),
    }
}

// ---------------------------------------------------------------------------
// Relational
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRelationalStore {
    jobs: RwLock<FxHashMap<Uuid, Job>>,
    progress: RwLock<FxHashMap<Uuid, BTreeMap<u64, ProgressEvent>>>,
    documents: RwLock<FxHashMap<String, Document>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn upsert_job(&self, job: &Job) -> StoreResult<()> {
        self.jobs.write().insert(job.job_id, job.clone());
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn jobs_with_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn running_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|job| job.status.is_running())
            .cloned()
            .collect())
    }

    async fn delete_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn append_progress(&self, event: &ProgressEvent) -> StoreResult<()> {
        self.progress
            .write()
            .entry(event.job_id)
            .or_default()
            .entry(event.seq)
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn progress_since(&self, job_id: Uuid, from_seq: u64) -> StoreResult<Vec<ProgressEvent>> {
        Ok(self
            .progress
            .read()
            .get(&job_id)
            .map(|log| log.range(from_seq..).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn prune_progress_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut pruned = 0u64;
        let mut progress = self.progress.write();
        for log in progress.values_mut() {
            let before = log.len();
            log.retain(|_, event| event.emitted_at >= cutoff);
            pruned += (before - log.len()) as u64;
        }
        progress.retain(|_, log| !log.is_empty());
        Ok(pruned)
    }

    async fn upsert_document(&self, document: &Document) -> StoreResult<()> {
        self.documents
            .write()
            .insert(document.doc_id.clone(), document.clone());
        Ok(())
    }

    async fn document(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        Ok(self.documents.read().get(doc_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct MemoryCache {
    entries: RwLock<FxHashMap<String, (Value, Instant)>>,
    topics: Mutex<FxHashMap<String, broadcast::Sender<Value>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    const TOPIC_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            topics: Mutex::new(FxHashMap::default()),
        }
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(Self::TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some((value, deadline)) if *deadline > now => return Ok(Some(value.clone())),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries.write().remove(key);
        }
        Ok(None)
    }

    async fn put_json(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Value) -> StoreResult<()> {
        // A send error only means no subscriber is attached right now.
        let _ = self.topic_sender(topic).send(message);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> CacheSubscription {
        CacheSubscription::new(self.topic_sender(topic).subscribe())
    }
}
