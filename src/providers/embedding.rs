//! Embedding providers.

use std::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHasher;
use serde::Deserialize;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

use super::{EmbeddingTier, ProviderError};

/// Vectorizes text. `dim()` is fixed per provider and must match the vector
/// collection it feeds.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn dim(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
    async fn health(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Deterministic feature-hashing embedder (the `local-small` tier).
///
/// Each lowercased word (and word bigram) hashes into a signed bucket; the
/// result is L2-normalized. Not semantically deep, but stable across runs and
/// processes, which is what idempotent re-ingestion needs.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIM: usize = 256;

    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let mut hasher = FxHasher::default();
        hasher.write(token.as_bytes());
        let hash = hasher.finish();
        let bucket = (hash % self.dim as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let words: Vec<String> = text
            .unicode_words()
            .map(|w| w.to_lowercase())
            .collect();
        for word in &words {
            let (bucket, sign) = self.bucket(word);
            vector[bucket] += sign;
        }
        for pair in words.windows(2) {
            let (bucket, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[bucket] += sign * 0.5;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "local-small"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsDatum>,
}

#[derive(Deserialize)]
struct EmbeddingsDatum {
    embedding: Vec<f32>,
}

/// Hosted embeddings endpoint speaking the common `/embeddings` JSON shape.
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    dim: usize,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>, dim: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(str::to_string),
            dim,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": self.model, "input": texts }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::unavailable(&self.model, err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                provider: self.model.clone(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::unavailable(
                &self.model,
                format!("http {status}"),
            ));
        }

        let body: EmbeddingsResponse = response.json().await.map_err(|err| {
            ProviderError::Malformed {
                provider: self.model.clone(),
                reason: err.to_string(),
            }
        })?;
        if body.data.len() != texts.len() {
            return Err(ProviderError::Malformed {
                provider: self.model.clone(),
                reason: format!("expected {} vectors, got {}", texts.len(), body.data.len()),
            });
        }
        for datum in &body.data {
            if datum.embedding.len() != self.dim {
                return Err(ProviderError::Malformed {
                    provider: self.model.clone(),
                    reason: format!(
                        "vector dimension {} does not match configured {}",
                        datum.embedding.len(),
                        self.dim
                    ),
                });
            }
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn health(&self) -> Result<(), ProviderError> {
        self.embed(&["ping".to_string()]).await.map(|_| ())
    }
}

/// Fallback chain over one embedding tier.
///
/// Tries each provider in order; the first success wins. All providers in a
/// chain agree on `dim()` (validated at registration).
#[derive(Clone)]
pub struct TieredEmbedder {
    tier: EmbeddingTier,
    chain: Vec<Arc<dyn EmbeddingProvider>>,
}

impl TieredEmbedder {
    pub fn new(tier: EmbeddingTier, chain: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { tier, chain }
    }

    pub fn tier(&self) -> EmbeddingTier {
        self.tier
    }

    pub fn dim(&self) -> usize {
        self.chain.first().map(|p| p.dim()).unwrap_or(0)
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut last_error: Option<ProviderError> = None;
        for provider in &self.chain {
            match provider.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) => {
                    warn!(
                        target: "citeweave::providers",
                        provider = provider.name(),
                        error = %err,
                        "embedding provider failed; trying next in chain"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(ProviderError::unavailable(
            self.tier.as_str(),
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "empty fallback chain".to_string()),
        ))
    }
}

/// Test support: fails a configured number of calls, then delegates.
///
/// Lets transient-failure scenarios run hermetically, in the same spirit as
/// an in-memory event sink.
pub struct FlakyEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

impl FlakyEmbedder {
    pub fn failing(inner: Arc<dyn EmbeddingProvider>, failures: u32) -> Self {
        Self {
            inner,
            failures_remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn name(&self) -> &str {
        "flaky"
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::unavailable("flaky", "scripted failure"));
        }
        self.inner.embed(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed(&["The quick brown fox".to_string()]).await.unwrap();
        let b = embedder.embed(&["The quick brown fox".to_string()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated_ones() {
        let embedder = HashEmbedder::new(256);
        let vectors = embedder
            .embed(&[
                "the solar panel efficiency report".to_string(),
                "solar panel efficiency improved".to_string(),
                "medieval castle siege tactics".to_string(),
            ])
            .await
            .unwrap();
        let sim = |a: &[f32], b: &[f32]| -> f32 {
            a.iter().zip(b).map(|(x, y)| x * y).sum()
        };
        assert!(sim(&vectors[0], &vectors[1]) > sim(&vectors[0], &vectors[2]));
    }

    #[tokio::test]
    async fn tiered_embedder_falls_back_past_failures() {
        let inner: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(32));
        let flaky: Arc<dyn EmbeddingProvider> =
            Arc::new(FlakyEmbedder::failing(inner.clone(), u32::MAX));
        let chain = TieredEmbedder::new(EmbeddingTier::LocalSmall, vec![flaky, inner]);
        let vectors = chain.embed(&["ok".to_string()]).await.unwrap();
        assert_eq!(vectors[0].len(), 32);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_unavailable() {
        let inner: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(32));
        let flaky: Arc<dyn EmbeddingProvider> = Arc::new(FlakyEmbedder::failing(inner, u32::MAX));
        let chain = TieredEmbedder::new(EmbeddingTier::LocalSmall, vec![flaky]);
        let err = chain.embed(&["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }
}
