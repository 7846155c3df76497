//! The ingestion pipeline: extract → chunk → coref → NER → link → relate →
//! embed → index.
//!
//! Stages are pure transformations over an [`IngestWork`] working set; only
//! the [`indexer`] stage touches the stores. That split keeps every stage
//! retryable: replaying a job re-derives the same working set and the
//! indexer's idempotent upserts make the replay harmless.
//!
//! The orchestrator wraps each stage with its configured timeout, checks the
//! cancellation token at stage entry, downgrades coreference failures to
//! warnings, and reports one progress event per completed stage.

pub mod coref;
pub mod embedder;
pub mod indexer;
pub mod linker;
pub mod ner;
pub mod relations;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::chunker::{self, ChunkerOptions};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::extract::{Extraction, ExtractorRegistry};
use crate::ident;
use crate::model::{Chunk, Mention, Relation, Stage};
use crate::progress::ProgressBus;
use crate::providers::{TieredEmbedder, TieredGenerator};
use crate::stores::StoreFacade;

pub use coref::{CorefResolver, CorefSpan};
pub use embedder::EmbedStage;
pub use indexer::{IndexReport, IndexStage};
pub use linker::{EntityLinker, LinkPlan};
pub use ner::NerTagger;
pub use relations::RelationExtractor;

/// Shared environment handed to every stage.
#[derive(Clone)]
pub struct StageContext {
    pub facade: StoreFacade,
    pub embedder: TieredEmbedder,
    pub generator: TieredGenerator,
    pub config: EngineConfig,
    cancel: watch::Receiver<bool>,
}

impl StageContext {
    pub fn new(
        facade: StoreFacade,
        embedder: TieredEmbedder,
        generator: TieredGenerator,
        config: EngineConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            facade,
            embedder,
            generator,
            config,
            cancel,
        }
    }

    /// Context with a token that never fires, for query-side callers.
    pub fn uncancellable(
        facade: StoreFacade,
        embedder: TieredEmbedder,
        generator: TieredGenerator,
        config: EngineConfig,
    ) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(facade, embedder, generator, config, rx)
    }

    /// Stages call this at entry and at batch boundaries.
    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if *self.cancel.borrow() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Accumulating working set for one ingestion job.
#[derive(Debug, Default)]
pub struct IngestWork {
    pub raw_url: String,
    pub normalized_url: String,
    pub doc_id: String,
    pub source_kind: Option<crate::model::SourceKind>,
    pub extraction: Option<Extraction>,
    pub chunks: Vec<Chunk>,
    /// Per-chunk coreference spans, keyed by chunk id.
    pub coref_spans: Vec<(String, Vec<CorefSpan>)>,
    pub mentions: Vec<Mention>,
    pub link_plan: Option<LinkPlan>,
    pub relations: Vec<Relation>,
    pub index_report: Option<IndexReport>,
}

impl IngestWork {
    /// Validate and fingerprint the URL. Parse failures are terminal
    /// validation errors.
    pub fn for_url(raw_url: &str) -> Result<Self, EngineError> {
        let normalized_url = ident::normalize_url(raw_url)?;
        let doc_id = ident::doc_id(raw_url)?;
        Ok(Self {
            raw_url: raw_url.to_string(),
            normalized_url,
            doc_id,
            ..Default::default()
        })
    }

    pub fn parsed_url(&self) -> Result<Url, EngineError> {
        Url::parse(&self.raw_url)
            .map_err(|err| EngineError::validation(format!("invalid url: {err}")))
    }

    pub fn extraction(&self) -> Result<&Extraction, EngineError> {
        self.extraction
            .as_ref()
            .ok_or_else(|| EngineError::integrity("extraction missing from working set"))
    }
}

/// One unit of the ingestion chain.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn stage(&self) -> Stage;
    /// Run the transformation, returning counters for the progress event.
    async fn run(&self, work: &mut IngestWork, cx: &StageContext)
    -> Result<Option<Value>, EngineError>;
}

/// Observer for job-status bookkeeping as stages begin.
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn on_stage_start(&self, job_id: Uuid, stage: Stage);
}

/// Outcome of a full pipeline run.
#[derive(Clone, Debug)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunk_count: usize,
    pub mention_count: usize,
    pub entity_count: usize,
    pub relation_count: usize,
}

/// Ordered stage chain plus the policies wrapped around each stage.
pub struct IngestPipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl IngestPipeline {
    /// The standard eight-stage chain.
    pub fn standard(registry: ExtractorRegistry) -> Self {
        Self::with_stages(vec![
            Arc::new(ExtractStage::new(registry)),
            Arc::new(ChunkStage),
            Arc::new(CorefResolver::new()),
            Arc::new(NerTagger::new()),
            Arc::new(EntityLinker::new()),
            Arc::new(RelationExtractor::new()),
            Arc::new(EmbedStage),
            Arc::new(IndexStage),
        ])
    }

    /// Custom stage chain; stages run in the given order.
    pub fn with_stages(stages: Vec<Arc<dyn PipelineStage>>) -> Self {
        Self { stages }
    }

    /// Run every stage for `url`, emitting one progress event per stage.
    pub async fn run(
        &self,
        job_id: Uuid,
        url: &str,
        cx: &StageContext,
        bus: &ProgressBus,
        observer: Option<&dyn StageObserver>,
    ) -> Result<IngestReport, EngineError> {
        let mut work = IngestWork::for_url(url)?;

        for stage_impl in &self.stages {
            let stage = stage_impl.stage();
            cx.check_cancelled()?;
            if let Some(observer) = observer {
                observer.on_stage_start(job_id, stage).await;
            }

            let timeout = cx.config.stage_timeouts.for_stage(stage);
            let outcome = tokio::time::timeout(timeout, stage_impl.run(&mut work, cx))
                .await
                .unwrap_or(Err(EngineError::StageTimeout {
                    stage,
                    seconds: timeout.as_secs(),
                }));

            match outcome {
                Ok(counters) => {
                    bus.emit(
                        job_id,
                        stage,
                        stage.completion_percent(),
                        format!("{stage} completed"),
                        counters,
                    )
                    .await?;
                }
                // Coreference is advisory: downstream stages proceed without
                // cluster ids and the job still succeeds.
                Err(err) if stage == Stage::Coref && err.kind() != ErrorKind::Cancelled => {
                    warn!(
                        target: "citeweave::pipeline",
                        %job_id,
                        error = %err,
                        "coreference failed; continuing without clusters"
                    );
                    bus.emit(
                        job_id,
                        stage,
                        stage.completion_percent(),
                        format!("coreference skipped: {err}"),
                        None,
                    )
                    .await?;
                }
                Err(err) => return Err(err),
            }
        }

        let report = IngestReport {
            doc_id: work.doc_id.clone(),
            chunk_count: work.chunks.len(),
            mention_count: work.mentions.len(),
            entity_count: work
                .link_plan
                .as_ref()
                .map(|plan| plan.entities.len())
                .unwrap_or(0),
            relation_count: work.relations.len(),
        };
        Ok(report)
    }
}

/// Resolves the extractor for the URL and runs it.
pub struct ExtractStage {
    registry: ExtractorRegistry,
}

impl ExtractStage {
    pub fn new(registry: ExtractorRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PipelineStage for ExtractStage {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        _cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let url = work.parsed_url()?;
        let extractor = self.registry.resolve(&url)?;
        extractor.validate(&url)?;
        let extraction = extractor.extract(&url).await?;
        extraction.validate()?;
        let counters = serde_json::json!({
            "bytes_extracted": extraction.text.len(),
            "source_kind": extractor.kind().as_str(),
        });
        work.source_kind = Some(extractor.kind());
        work.extraction = Some(extraction);
        Ok(Some(counters))
    }
}

/// Splits the extracted text into byte-addressed chunks.
pub struct ChunkStage;

#[async_trait]
impl PipelineStage for ChunkStage {
    fn stage(&self) -> Stage {
        Stage::Chunk
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let extraction = work.extraction()?;
        let chunks = chunker::chunk_text(
            &work.doc_id,
            &extraction.text,
            &extraction.location_map,
            ChunkerOptions {
                chunk_size_bytes: cx.config.chunk_size_bytes,
                overlap_bytes: cx.config.overlap_bytes,
            },
        )?;
        let counters = serde_json::json!({ "chunks_emitted": chunks.len() });
        work.chunks = chunks;
        // Early core commit: a job cancelled mid-transform still leaves its
        // document, chunks, and location map queryable.
        indexer::commit_core(work, cx).await?;
        Ok(Some(counters))
    }
}
