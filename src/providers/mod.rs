//! Embedding and generative model providers.
//!
//! Nothing outside this module knows vendor names. Components receive a
//! provider handle from the [`ProviderFactory`], which maps a configured tier
//! to a fallback chain of implementations; when one implementation fails the
//! next in the chain is tried, and an exhausted chain surfaces as
//! [`ProviderError::Unavailable`] (transient to the retry policy).

pub mod embedding;
pub mod generative;

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::error::ErrorKind;

pub use embedding::{EmbeddingProvider, FlakyEmbedder, HashEmbedder, HttpEmbedder, TieredEmbedder};
pub use generative::{
    CostEstimate, ExtractiveGenerator, GenerateOptions, GenerativeProvider, HttpGenerator,
    TieredGenerator, TokenStream,
};

/// Errors surfaced by providers.
#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider {provider} unavailable: {reason}")]
    #[diagnostic(
        code(citeweave::provider::unavailable),
        help("Every implementation in the fallback chain failed; check connectivity and credentials.")
    )]
    Unavailable { provider: String, reason: String },

    #[error("provider {provider} rate limited")]
    #[diagnostic(code(citeweave::provider::rate_limited))]
    RateLimited { provider: String },

    #[error("provider {provider} returned a malformed response: {reason}")]
    #[diagnostic(code(citeweave::provider::malformed))]
    Malformed { provider: String, reason: String },
}

impl ProviderError {
    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Provider failures are transient from the pipeline's point of view; the
    /// fallback chain has already absorbed what it could.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Embedding quality tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmbeddingTier {
    LocalSmall,
    HostedStandard,
    HostedLarge,
}

impl EmbeddingTier {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local-small" => EmbeddingTier::LocalSmall,
            "hosted-small" | "hosted-standard" => EmbeddingTier::HostedStandard,
            "hosted-large" => EmbeddingTier::HostedLarge,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingTier::LocalSmall => "local-small",
            EmbeddingTier::HostedStandard => "hosted-standard",
            EmbeddingTier::HostedLarge => "hosted-large",
        }
    }
}

/// Generative model tiers, selected per task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenerativeTier {
    Nano,
    Mini,
    Standard,
    Pro,
}

impl GenerativeTier {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "nano" => GenerativeTier::Nano,
            "mini" => GenerativeTier::Mini,
            "standard" => GenerativeTier::Standard,
            "pro" => GenerativeTier::Pro,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerativeTier::Nano => "nano",
            GenerativeTier::Mini => "mini",
            GenerativeTier::Standard => "standard",
            GenerativeTier::Pro => "pro",
        }
    }
}

/// Registry mapping tiers to provider fallback chains.
///
/// Discovery is explicit at startup: chains are registered here and handed to
/// components as constructed values, never read from globals.
pub struct ProviderFactory {
    embedding_chains: FxHashMap<EmbeddingTier, Vec<Arc<dyn EmbeddingProvider>>>,
    generative_chains: FxHashMap<GenerativeTier, Vec<Arc<dyn GenerativeProvider>>>,
}

impl ProviderFactory {
    /// Every tier backed by the deterministic local providers. The fabric for
    /// tests and offline deployments.
    pub fn local_only(dim: usize) -> Self {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(dim));
        let generator: Arc<dyn GenerativeProvider> = Arc::new(ExtractiveGenerator::new());
        let mut factory = Self {
            embedding_chains: FxHashMap::default(),
            generative_chains: FxHashMap::default(),
        };
        for tier in [
            EmbeddingTier::LocalSmall,
            EmbeddingTier::HostedStandard,
            EmbeddingTier::HostedLarge,
        ] {
            factory.embedding_chains.insert(tier, vec![embedder.clone()]);
        }
        for tier in [
            GenerativeTier::Nano,
            GenerativeTier::Mini,
            GenerativeTier::Standard,
            GenerativeTier::Pro,
        ] {
            factory.generative_chains.insert(tier, vec![generator.clone()]);
        }
        factory
    }

    /// Like [`local_only`](Self::local_only) but with hosted adapters in
    /// front of the local fallback for the hosted tiers, configured from
    /// `CITEWEAVE_EMBED_URL` / `CITEWEAVE_GEN_URL` / `CITEWEAVE_API_KEY`.
    pub fn from_env(dim: usize) -> Self {
        dotenvy::dotenv().ok();
        let mut factory = Self::local_only(dim);
        let api_key = std::env::var("CITEWEAVE_API_KEY").ok();

        if let Ok(base) = std::env::var("CITEWEAVE_EMBED_URL") {
            for (tier, model_var) in [
                (EmbeddingTier::HostedStandard, "CITEWEAVE_EMBED_MODEL"),
                (EmbeddingTier::HostedLarge, "CITEWEAVE_EMBED_MODEL_LARGE"),
            ] {
                let model = std::env::var(model_var).unwrap_or_else(|_| "default".to_string());
                let hosted: Arc<dyn EmbeddingProvider> =
                    Arc::new(HttpEmbedder::new(&base, &model, api_key.as_deref(), dim));
                factory
                    .embedding_chains
                    .entry(tier)
                    .or_default()
                    .insert(0, hosted);
            }
        }
        if let Ok(base) = std::env::var("CITEWEAVE_GEN_URL") {
            for (tier, model_var) in [
                (GenerativeTier::Mini, "CITEWEAVE_GEN_MODEL_MINI"),
                (GenerativeTier::Standard, "CITEWEAVE_GEN_MODEL"),
                (GenerativeTier::Pro, "CITEWEAVE_GEN_MODEL_PRO"),
            ] {
                let model = std::env::var(model_var).unwrap_or_else(|_| "default".to_string());
                let hosted: Arc<dyn GenerativeProvider> =
                    Arc::new(HttpGenerator::new(&base, &model, api_key.as_deref(), tier));
                factory
                    .generative_chains
                    .entry(tier)
                    .or_default()
                    .insert(0, hosted);
            }
        }
        factory
    }

    /// Replace the chain for one embedding tier.
    ///
    /// Every provider in a chain must agree on dimensionality.
    pub fn set_embedding_chain(
        &mut self,
        tier: EmbeddingTier,
        chain: Vec<Arc<dyn EmbeddingProvider>>,
    ) {
        if let Some(first) = chain.first() {
            debug_assert!(chain.iter().all(|p| p.dim() == first.dim()));
        }
        self.embedding_chains.insert(tier, chain);
    }

    pub fn set_generative_chain(
        &mut self,
        tier: GenerativeTier,
        chain: Vec<Arc<dyn GenerativeProvider>>,
    ) {
        self.generative_chains.insert(tier, chain);
    }

    /// Resolve an embedding tier to its fallback-chain handle.
    pub fn embedder(&self, tier: EmbeddingTier) -> TieredEmbedder {
        let chain = self
            .embedding_chains
            .get(&tier)
            .cloned()
            .unwrap_or_default();
        TieredEmbedder::new(tier, chain)
    }

    pub fn generator(&self, tier: GenerativeTier) -> TieredGenerator {
        let chain = self
            .generative_chains
            .get(&tier)
            .cloned()
            .unwrap_or_default();
        TieredGenerator::new(tier, chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_accepts_documented_spellings() {
        assert_eq!(EmbeddingTier::parse("local"), Some(EmbeddingTier::LocalSmall));
        assert_eq!(
            EmbeddingTier::parse("hosted-small"),
            Some(EmbeddingTier::HostedStandard)
        );
        assert_eq!(GenerativeTier::parse("PRO"), Some(GenerativeTier::Pro));
        assert_eq!(GenerativeTier::parse("huge"), None);
    }

    #[tokio::test]
    async fn local_factory_serves_every_tier() {
        let factory = ProviderFactory::local_only(64);
        for tier in [
            EmbeddingTier::LocalSmall,
            EmbeddingTier::HostedStandard,
            EmbeddingTier::HostedLarge,
        ] {
            let embedder = factory.embedder(tier);
            assert_eq!(embedder.dim(), 64);
            let vectors = embedder.embed(&["hello".to_string()]).await.unwrap();
            assert_eq!(vectors.len(), 1);
        }
    }
}
