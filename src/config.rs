//! Engine configuration.
//!
//! Configuration is an explicit value constructed once at startup and handed
//! to each component; nothing reads global state after construction. This
//! keeps every stage independently testable.

use std::time::Duration;

use crate::model::Stage;
use crate::providers::{EmbeddingTier, GenerativeTier};

/// Per-stage wall-clock ceilings. A timeout surfaces as a transient failure.
#[derive(Clone, Debug)]
pub struct StageTimeouts {
    pub extract: Duration,
    pub chunk: Duration,
    pub coref: Duration,
    pub ner: Duration,
    pub link: Duration,
    pub relate: Duration,
    pub embed: Duration,
    pub index: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            extract: Duration::from_secs(60),
            chunk: Duration::from_secs(10),
            coref: Duration::from_secs(30),
            ner: Duration::from_secs(60),
            link: Duration::from_secs(30),
            relate: Duration::from_secs(60),
            embed: Duration::from_secs(60),
            index: Duration::from_secs(15),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Extract => self.extract,
            Stage::Chunk => self.chunk,
            Stage::Coref => self.coref,
            Stage::Ner => self.ner,
            Stage::Link => self.link,
            Stage::Relate => self.relate,
            Stage::Embed => self.embed,
            Stage::Index => self.index,
            _ => Duration::from_secs(60),
        }
    }
}

/// Tunable knobs for the ingestion core.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub chunk_size_bytes: usize,
    pub overlap_bytes: usize,
    pub embedding_tier: EmbeddingTier,
    pub generative_tier: GenerativeTier,
    pub max_automatic_retries: u32,
    pub max_manual_retries: u32,
    pub link_exact_threshold: f32,
    pub link_fuzzy_threshold: f32,
    pub relation_confidence_threshold: f32,
    pub worker_concurrency: usize,
    pub job_retention: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stage_timeouts: StageTimeouts,
    /// Minimum chunk batch per embedding provider call.
    pub embed_batch_size: usize,
    /// Mention batch size for the linker.
    pub link_batch_size: usize,
    /// k for retrieval k-NN.
    pub retrieval_k: usize,
    /// Whether the advisory coreference stage runs at all.
    pub coref_enabled: bool,
    /// Whether NER re-tags low-confidence windows through the LM.
    pub ner_llm_fallback: bool,
    /// Graph-transaction commit ceiling inside the indexer.
    pub graph_commit_timeout: Duration,
    /// Wall-clock length of one backoff unit (`2^attempt` units). One second
    /// in production; tests shrink it.
    pub backoff_unit: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 1000,
            overlap_bytes: 200,
            embedding_tier: EmbeddingTier::LocalSmall,
            generative_tier: GenerativeTier::Nano,
            max_automatic_retries: 3,
            max_manual_retries: 10,
            link_exact_threshold: 0.90,
            link_fuzzy_threshold: 0.70,
            relation_confidence_threshold: 0.70,
            worker_concurrency: 2,
            job_retention: Duration::from_secs(7 * 24 * 3600),
            heartbeat_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            stage_timeouts: StageTimeouts::default(),
            embed_batch_size: 32,
            link_batch_size: 100,
            retrieval_k: 8,
            coref_enabled: true,
            ner_llm_fallback: false,
            graph_commit_timeout: Duration::from_secs(5),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment (`CITEWEAVE_*` variables), loading
    /// a `.env` file when present. Unset or unparsable variables keep their
    /// defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(v) = env_usize("CITEWEAVE_CHUNK_SIZE_BYTES") {
            config.chunk_size_bytes = v.max(2);
        }
        if let Some(v) = env_usize("CITEWEAVE_OVERLAP_BYTES") {
            config.overlap_bytes = v;
        }
        if let Some(v) = std::env::var("CITEWEAVE_EMBEDDING_TIER")
            .ok()
            .and_then(|s| EmbeddingTier::parse(&s))
        {
            config.embedding_tier = v;
        }
        if let Some(v) = std::env::var("CITEWEAVE_GENERATIVE_TIER")
            .ok()
            .and_then(|s| GenerativeTier::parse(&s))
        {
            config.generative_tier = v;
        }
        if let Some(v) = env_u32("CITEWEAVE_MAX_AUTOMATIC_RETRIES") {
            config.max_automatic_retries = v;
        }
        if let Some(v) = env_u32("CITEWEAVE_MAX_MANUAL_RETRIES") {
            config.max_manual_retries = v;
        }
        if let Some(v) = env_usize("CITEWEAVE_WORKER_CONCURRENCY") {
            config.worker_concurrency = v.max(1);
        }
        if let Some(v) = env_u64("CITEWEAVE_JOB_RETENTION_SECONDS") {
            config.job_retention = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("CITEWEAVE_HEARTBEAT_TIMEOUT_SECONDS") {
            config.heartbeat_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("CITEWEAVE_RETRIEVAL_K") {
            config.retrieval_k = v.max(1);
        }
        config
    }

    #[must_use]
    pub fn with_chunking(mut self, chunk_size_bytes: usize, overlap_bytes: usize) -> Self {
        self.chunk_size_bytes = chunk_size_bytes.max(2);
        self.overlap_bytes = overlap_bytes;
        self
    }

    #[must_use]
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_coref_enabled(mut self, enabled: bool) -> Self {
        self.coref_enabled = enabled;
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size_bytes, 1000);
        assert_eq!(config.overlap_bytes, 200);
        assert_eq!(config.max_automatic_retries, 3);
        assert_eq!(config.max_manual_retries, 10);
        assert!((config.link_exact_threshold - 0.90).abs() < f32::EPSILON);
        assert!((config.link_fuzzy_threshold - 0.70).abs() < f32::EPSILON);
        assert_eq!(config.retrieval_k, 8);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = EngineConfig::default().with_chunking(0, 10);
        assert_eq!(config.chunk_size_bytes, 2);
        let config = EngineConfig::default().with_worker_concurrency(0);
        assert_eq!(config.worker_concurrency, 1);
    }
}
