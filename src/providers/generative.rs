//! Generative language-model providers.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::{GenerativeTier, ProviderError};

/// Token stream yielded by [`GenerativeProvider::stream_generate`].
pub type TokenStream = BoxStream<'static, Result<String, ProviderError>>;

/// Options for one generation call.
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    /// Budget mode trims reasoning effort (used by the relation verifier).
    pub budget: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.0,
            budget: false,
        }
    }
}

/// Rough cost projection for a prompt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CostEstimate {
    pub input_tokens: usize,
    pub estimated_usd: f64,
}

/// A generative language model behind a tier.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &str, options: &GenerateOptions)
    -> Result<String, ProviderError>;
    /// Stream the answer token by token. Implementations without a streaming
    /// transport may yield the final text as a single item.
    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TokenStream, ProviderError>;
    fn estimate_cost(&self, prompt: &str) -> CostEstimate;
}

/// Approximate token count used for cost estimation (4 bytes per token).
fn approx_tokens(prompt: &str) -> usize {
    prompt.len().div_ceil(4)
}

/// Deterministic extractive generator (the `nano` tier).
///
/// Two behaviours, switched on the prompt:
///
/// - *Verification prompts* ("Answer YES or NO") are answered by checking that
///   the claim's capitalized terms all appear in the evidence text.
/// - *Grounded answering prompts* (numbered `SOURCE [n] … END SOURCE` blocks)
///   are answered by quoting the leading sentence of the best sources, each
///   followed by its `[n]` marker.
///
/// Useful as the budget tier and as the hermetic test fabric; hosted tiers
/// fall back to it when unconfigured.
pub struct ExtractiveGenerator {
    source_block: Regex,
    sentence_end: Regex,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self {
            source_block: Regex::new(r"(?s)SOURCE \[(\d+)\][^\n]*\n(.*?)\nEND SOURCE")
                .expect("static regex"),
            sentence_end: Regex::new(r"[.!?](\s|$)").expect("static regex"),
        }
    }

    fn answer_verification(&self, prompt: &str) -> String {
        let claim = prompt
            .lines()
            .find_map(|line| line.strip_prefix("Claim:"))
            .unwrap_or_default();
        let evidence = prompt
            .lines()
            .find_map(|line| line.strip_prefix("Evidence:"))
            .unwrap_or_default()
            .to_lowercase();
        let supported = claim
            .split_whitespace()
            .filter(|word| {
                word.chars().next().is_some_and(char::is_uppercase) && word.len() > 2
            })
            .all(|word| {
                let needle = word
                    .trim_matches(|c: char| c.is_ascii_punctuation())
                    .to_lowercase();
                needle.is_empty() || evidence.contains(&needle)
            });
        if supported { "YES".into() } else { "NO".into() }
    }

    fn answer_grounded(&self, prompt: &str) -> String {
        let mut lines = Vec::new();
        for captures in self.source_block.captures_iter(prompt).take(2) {
            let index = &captures[1];
            let body = captures[2].trim();
            if body.is_empty() {
                continue;
            }
            let sentence = match self.sentence_end.find(body) {
                Some(found) => &body[..found.end()],
                None => body,
            };
            let sentence = sentence.trim();
            let clipped = truncate_at_char_boundary(sentence, 280);
            lines.push(format!("{clipped} [{index}]"));
        }
        if lines.is_empty() {
            "No supporting evidence was found in the indexed sources.".to_string()
        } else {
            lines.join("\n")
        }
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl GenerativeProvider for ExtractiveGenerator {
    fn name(&self) -> &str {
        "nano-extractive"
    }

    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<String, ProviderError> {
        if prompt.contains("Answer YES or NO") {
            Ok(self.answer_verification(prompt))
        } else {
            Ok(self.answer_grounded(prompt))
        }
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TokenStream, ProviderError> {
        let text = self.generate(prompt, options).await?;
        let tokens: Vec<Result<String, ProviderError>> = text
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }

    fn estimate_cost(&self, prompt: &str) -> CostEstimate {
        CostEstimate {
            input_tokens: approx_tokens(prompt),
            estimated_usd: 0.0,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Hosted chat-completions endpoint speaking the common JSON shape.
pub struct HttpGenerator {
    base_url: String,
    model: String,
    api_key: Option<String>,
    tier: GenerativeTier,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>, tier: GenerativeTier) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(str::to_string),
            tier,
            client: reqwest::Client::new(),
        }
    }

    /// USD per million input tokens, by tier.
    fn price_per_mtok(&self) -> f64 {
        match self.tier {
            GenerativeTier::Nano => 0.05,
            GenerativeTier::Mini => 0.25,
            GenerativeTier::Standard => 1.25,
            GenerativeTier::Pro => 5.0,
        }
    }
}

#[async_trait]
impl GenerativeProvider for HttpGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": options.max_tokens,
                "temperature": options.temperature,
            }));
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

        let body: ChatResponse = response.json().await.map_err(|err| {
            ProviderError::Malformed {
                provider: self.model.clone(),
                reason: err.to_string(),
            }
        })?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed {
                provider: self.model.clone(),
                reason: "empty choices".to_string(),
            })
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TokenStream, ProviderError> {
        // No incremental transport wired; deliver the final text in one item.
        let text = self.generate(prompt, options).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }

    fn estimate_cost(&self, prompt: &str) -> CostEstimate {
        let input_tokens = approx_tokens(prompt);
        CostEstimate {
            input_tokens,
            estimated_usd: input_tokens as f64 * self.price_per_mtok() / 1_000_000.0,
        }
    }
}

/// Fallback chain over one generative tier.
#[derive(Clone)]
pub struct TieredGenerator {
    tier: GenerativeTier,
    chain: Vec<Arc<dyn GenerativeProvider>>,
}

impl TieredGenerator {
    pub fn new(tier: GenerativeTier, chain: Vec<Arc<dyn GenerativeProvider>>) -> Self {
        Self { tier, chain }
    }

    pub fn tier(&self) -> GenerativeTier {
        self.tier
    }

    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ProviderError> {
        let mut last_error: Option<ProviderError> = None;
        for provider in &self.chain {
            match provider.generate(prompt, options).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(
                        target: "citeweave::providers",
                        provider = provider.name(),
                        error = %err,
                        "generative provider failed; trying next in chain"
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

    pub async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TokenStream, ProviderError> {
        for provider in &self.chain {
            match provider.stream_generate(prompt, options).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    warn!(
                        target: "citeweave::providers",
                        provider = provider.name(),
                        error = %err,
                        "generative provider stream failed; trying next in chain"
                    );
                }
            }
        }
        Err(ProviderError::unavailable(self.tier.as_str(), "all providers failed"))
    }

    pub fn estimate_cost(&self, prompt: &str) -> Option<CostEstimate> {
        self.chain.first().map(|p| p.estimate_cost(prompt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn verification_prompts_check_claim_terms_against_evidence() {
        let generator = ExtractiveGenerator::new();
        let options = GenerateOptions::default();

        let supported = "Claim: Solara Labs FOUNDED Helios Energy\n\
                         Evidence: Helios Energy was founded by Solara Labs in 2019.\n\
                         Does the evidence support the claim? Answer YES or NO.";
        assert_eq!(generator.generate(supported, &options).await.unwrap(), "YES");

        let unsupported = "Claim: Solara Labs FOUNDED Atlas Mining\n\
                           Evidence: Helios Energy was founded by Solara Labs in 2019.\n\
                           Does the evidence support the claim? Answer YES or NO.";
        assert_eq!(generator.generate(unsupported, &options).await.unwrap(), "NO");
    }

    #[tokio::test]
    async fn grounded_prompts_quote_sources_with_markers() {
        let generator = ExtractiveGenerator::new();
        let prompt = "Answer using the sources and cite like [1].\n\n\
                      SOURCE [1] Example - https://example.com\n\
                      Solar output doubled in 2024. Other text follows.\n\
                      END SOURCE\n\n\
                      Question: what happened to solar output?";
        let answer = generator
            .generate(prompt, &GenerateOptions::default())
            .await
            .unwrap();
        assert!(answer.contains("Solar output doubled in 2024."));
        assert!(answer.contains("[1]"));
    }

    #[tokio::test]
    async fn grounded_prompts_without_sources_yield_no_evidence_answer() {
        let generator = ExtractiveGenerator::new();
        let answer = generator
            .generate("Question: anything?", &GenerateOptions::default())
            .await
            .unwrap();
        assert!(answer.contains("No supporting evidence"));
    }

    #[tokio::test]
    async fn streaming_concatenates_to_the_full_answer() {
        let generator = ExtractiveGenerator::new();
        let prompt = "SOURCE [1] t\nAlpha beta gamma.\nEND SOURCE\nQuestion: ?";
        let full = generator
            .generate(prompt, &GenerateOptions::default())
            .await
            .unwrap();
        let mut streamed = String::new();
        let mut stream = generator
            .stream_generate(prompt, &GenerateOptions::default())
            .await
            .unwrap();
        while let Some(token) = stream.next().await {
            streamed.push_str(&token.unwrap());
        }
        assert_eq!(streamed, full);
    }
}
