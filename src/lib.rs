//! # Citeweave: provenance-first knowledge ingestion and retrieval
//!
//! Citeweave ingests web pages, PDFs, and video transcripts; segments them
//! into byte-addressable chunks; detects entities and the relations among
//! them; embeds everything into a vector space; and stores the result across
//! a polyglot backend (blob, vector, graph, relational, cache). Queries come
//! back with inline citations that resolve to exact byte ranges of the
//! original sources.
//!
//! ## Core pieces
//!
//! - [`ident`]: deterministic identifiers binding every derived artifact to
//!   its source bytes
//! - [`stores`]: capability traits over the five backends, behind one façade
//! - [`providers`]: tiered embedding and generative providers with fallback
//!   chains
//! - [`extract`]: per-source-kind extractors producing text plus a location
//!   map (page / timestamp / heading anchors)
//! - [`chunker`]: overlapping, byte-offset-tagged chunking at semantic
//!   boundaries
//! - [`pipeline`]: the extract→chunk→coref→NER→link→relate→embed→index
//!   chain; stages are pure, only the indexer writes
//! - [`progress`]: per-job ordered event streaming with durable replay
//! - [`jobs`]: the durable work queue: priority, retry, cancellation,
//!   heartbeats
//! - [`rag`]: retrieval-augmented answering with verifiable citations
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use citeweave::config::EngineConfig;
//! use citeweave::extract::ExtractorRegistry;
//! use citeweave::jobs::JobManager;
//! use citeweave::pipeline::IngestPipeline;
//! use citeweave::providers::ProviderFactory;
//! use citeweave::stores::StoreFacade;
//!
//! # async fn example() -> Result<(), citeweave::error::EngineError> {
//! let config = EngineConfig::from_env();
//! let providers = ProviderFactory::from_env(256);
//! let facade = StoreFacade::in_memory(256);
//!
//! let manager = JobManager::new(
//!     facade.clone(),
//!     IngestPipeline::standard(ExtractorRegistry::with_defaults()),
//!     providers.embedder(config.embedding_tier),
//!     providers.generator(config.generative_tier),
//!     config,
//! );
//! manager.start().await?;
//!
//! let job_id = manager.submit("https://example.com/about", 5).await?;
//! let mut events = manager.bus().subscribe(job_id, 0).await?;
//! while let Some(event) = events.next().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunker;
pub mod config;
pub mod error;
pub mod extract;
pub mod ident;
pub mod jobs;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod rag;
pub mod stores;
pub mod telemetry;
