//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAiProvider`]** — calls an OpenAI-compatible embeddings API with retry and backoff.
//! - **[`NgramProvider`]** — deterministic character-trigram vectors; no network, used for
//!   development and tests.
//!
//! Also provides the batch entry point [`embed_chunks`], which embeds many
//! chunk texts under a bounded-concurrency gate and performs **token-limit
//! recovery**: a chunk the model rejects as too long is split at the best
//! semantic boundary into two halves and each half is embedded recursively
//! (depth-capped). Sub-chunks replace their parent in order; nothing is
//! dropped and nothing is averaged.
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! A 400 whose body mentions the model's token limit is surfaced as
//! [`EmbedError::TokenLimit`] so the caller can split instead of failing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

/// Maximum recursive split depth during token-limit recovery.
const MAX_SPLIT_DEPTH: u32 = 3;

/// Provider-level embedding failure.
#[derive(Debug)]
pub enum EmbedError {
    /// The model rejected the input as exceeding its token limit.
    TokenLimit,
    /// Transient failure after retries were exhausted.
    Transient(String),
    /// Non-retryable failure.
    Fatal(String),
}

impl std::fmt::Display for EmbedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbedError::TokenLimit => write!(f, "input exceeds model token limit"),
            EmbedError::Transient(msg) => write!(f, "transient embedding error: {}", msg),
            EmbedError::Fatal(msg) => write!(f, "embedding error: {}", msg),
        }
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-005"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding dimensionality the store is provisioned for.
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError>;
}

/// Create the appropriate provider based on configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "ngram" => Ok(Arc::new(NgramProvider::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => Err(RagError::Internal(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Disabled Provider ============

/// A no-op provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Fatal(
            "Embedding provider is disabled".to_string(),
        ))
    }
}

// ============ N-gram Provider ============

/// Deterministic character-trigram embedder.
///
/// Hashes each lowercase trigram into a bucket and L2-normalizes the bucket
/// counts. Texts sharing vocabulary land near each other, which is enough
/// for exercising the retrieval pipeline without a model endpoint.
pub struct NgramProvider {
    dims: usize,
}

impl NgramProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

#[async_trait]
impl EmbeddingProvider for NgramProvider {
    fn model_name(&self) -> &str {
        "character-ngram"
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0f32; self.dims];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return Ok(vector);
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            // FNV-1a over the trigram bytes.
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        Ok(vector)
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for an OpenAI-compatible `POST /v1/embeddings`
/// endpoint. Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    max_retries: u32,
    endpoint: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::Internal("embedding.model required".to_string()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(RagError::Internal(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Internal(e.to_string()))?;

        Ok(Self {
            model,
            dims: config.dims,
            max_retries: config.max_retries,
            endpoint: config
                .endpoint_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EmbedError::Fatal("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EmbedError::Fatal(e.to_string()))?;
                        return parse_embedding_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Token-limit rejections come back as 400s mentioning
                    // the context window; the caller splits and recurses.
                    if status.as_u16() == 400 && is_token_limit_message(&body_text) {
                        return Err(EmbedError::TokenLimit);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("API error {}: {}", status, body_text));
                        continue;
                    }

                    return Err(EmbedError::Fatal(format!(
                        "API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(EmbedError::Transient(
            last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}

fn is_token_limit_message(body: &str) -> bool {
    let lowered = body.to_lowercase();
    lowered.contains("token") && (lowered.contains("limit") || lowered.contains("maximum"))
}

fn parse_embedding_response(json: &serde_json::Value) -> std::result::Result<Vec<f32>, EmbedError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::Fatal("invalid embeddings response".to_string()))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Batch embedding with token-limit recovery ============

/// A chunk text paired with its embedding. `source_span` is the byte span in
/// the extracted text, absent for sub-chunks created by a token-limit split.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub text: String,
    pub embedding: Vec<f32>,
    pub source_span: Option<(usize, usize)>,
}

/// Counters describing token-limit recovery during one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingStats {
    pub splits_performed: u32,
    pub max_depth_reached: u32,
}

/// Embed every chunk under a bounded-concurrency gate.
///
/// The returned list is authoritative: token-limit splits may make it longer
/// than the input, with sub-chunks replacing their parent in order. Every
/// vector has the provider's dimensionality. Any chunk that ultimately fails
/// aborts the whole batch with `EmbeddingFailed`.
pub async fn embed_chunks(
    provider: Arc<dyn EmbeddingProvider>,
    chunks: Vec<(String, Option<(usize, usize)>)>,
    concurrency: usize,
) -> Result<(Vec<EmbeddedChunk>, EmbeddingStats)> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let tasks = chunks.into_iter().map(|(text, span)| {
        let provider = Arc::clone(&provider);
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| RagError::Internal("embedding gate closed".to_string()))?;
            embed_with_split(provider.as_ref(), text, span, 0).await
        }
    });

    let results = futures::future::join_all(tasks).await;

    let mut embedded = Vec::new();
    let mut stats = EmbeddingStats::default();

    for result in results {
        let (pieces, splits, depth) = result?;
        stats.splits_performed += splits;
        stats.max_depth_reached = stats.max_depth_reached.max(depth);
        embedded.extend(pieces);
    }

    Ok((embedded, stats))
}

/// Embed a single text, used by the query path and the `/v1/embed` route.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(text)
        .await
        .map_err(|e| RagError::EmbeddingFailed(e.to_string()))
}

/// Embed one chunk, recursively splitting on token-limit rejections.
///
/// Returns the (sub-)chunks in order, the number of splits performed, and
/// the deepest recursion level reached.
fn embed_with_split<'a>(
    provider: &'a dyn EmbeddingProvider,
    text: String,
    span: Option<(usize, usize)>,
    depth: u32,
) -> futures::future::BoxFuture<'a, Result<(Vec<EmbeddedChunk>, u32, u32)>> {
    Box::pin(async move {
        match provider.embed(&text).await {
            Ok(embedding) => {
                if embedding.len() != provider.dims() {
                    return Err(RagError::EmbeddingFailed(format!(
                        "provider returned {} dimensions, expected {}",
                        embedding.len(),
                        provider.dims(),
                    )));
                }
                Ok((
                    vec![EmbeddedChunk {
                        text,
                        embedding,
                        source_span: span,
                    }],
                    0,
                    depth,
                ))
            }
            Err(EmbedError::TokenLimit) => {
                if depth >= MAX_SPLIT_DEPTH {
                    return Err(RagError::EmbeddingFailed(format!(
                        "chunk still exceeds the model token limit after {} splits",
                        MAX_SPLIT_DEPTH,
                    )));
                }

                let (left, right) = split_for_embedding(&text);
                if left.is_empty() || right.is_empty() {
                    return Err(RagError::EmbeddingFailed(
                        "chunk exceeds the model token limit and cannot be split further"
                            .to_string(),
                    ));
                }

                tracing::debug!(
                    depth = depth + 1,
                    left = left.len(),
                    right = right.len(),
                    "splitting over-long chunk for embedding"
                );

                // Sub-chunks lose the parent's source span.
                let (mut left_out, left_splits, left_depth) =
                    embed_with_split(provider, left, None, depth + 1).await?;
                let (right_out, right_splits, right_depth) =
                    embed_with_split(provider, right, None, depth + 1).await?;

                left_out.extend(right_out);
                Ok((
                    left_out,
                    1 + left_splits + right_splits,
                    left_depth.max(right_depth),
                ))
            }
            Err(e) => Err(RagError::EmbeddingFailed(e.to_string())),
        }
    })
}

/// Split a chunk near its midpoint at the best semantic boundary:
/// paragraph → sentence → word → hard character cut.
fn split_for_embedding(text: &str) -> (String, String) {
    let mid = {
        let mut m = text.len() / 2;
        while m > 0 && !text.is_char_boundary(m) {
            m -= 1;
        }
        m
    };
    if mid == 0 {
        return (String::new(), text.to_string());
    }

    let split_at = find_split_near_mid(text, mid).unwrap_or(mid);
    let (left, right) = text.split_at(split_at);
    (left.to_string(), right.to_string())
}

/// Look for a boundary close to `mid`, preferring the hierarchy order and
/// the candidate nearest the midpoint within each level.
fn find_split_near_mid(text: &str, mid: usize) -> Option<usize> {
    for delim in ["\n\n", ". ", "? ", "! ", " ", "\n"] {
        let before = text[..mid].rfind(delim).map(|p| p + delim.len());
        let after = text[mid..].find(delim).map(|p| mid + p + delim.len());

        let candidate = match (before, after) {
            (Some(b), Some(a)) => {
                if mid - b <= a - mid {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };

        if let Some(pos) = candidate {
            if pos > 0 && pos < text.len() {
                return Some(pos);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test provider that rejects texts longer than `max_chars`.
    struct LimitedProvider {
        dims: usize,
        max_chars: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for LimitedProvider {
        fn model_name(&self) -> &str {
            "limited-test-model"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
            if text.len() > self.max_chars {
                return Err(EmbedError::TokenLimit);
            }
            Ok(vec![0.5; self.dims])
        }
    }

    /// Test provider that always fails with a non-token-limit error.
    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn model_name(&self) -> &str {
            "failing-test-model"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Transient("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn ngram_provider_is_deterministic() {
        let provider = NgramProvider::new(768);
        let a = provider.embed("Hydraulic pressure and flow").await.unwrap();
        let b = provider.embed("Hydraulic pressure and flow").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 768);
    }

    #[tokio::test]
    async fn ngram_provider_normalizes_vectors() {
        let provider = NgramProvider::new(64);
        let v = provider.embed("some document text").await.unwrap();
        let magnitude: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn ngram_similar_texts_are_closer_than_unrelated() {
        let provider = NgramProvider::new(768);
        let a = provider.embed("kubernetes deployment guide").await.unwrap();
        let b = provider.embed("kubernetes deployment handbook").await.unwrap();
        let c = provider.embed("chocolate cake recipe ideas").await.unwrap();

        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(a, b)| a * b).sum::<f32>();
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[tokio::test]
    async fn embed_chunks_preserves_count_without_splits() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(LimitedProvider {
            dims: 8,
            max_chars: 1000,
        });
        let chunks = vec![
            ("first chunk".to_string(), Some((0, 11))),
            ("second chunk".to_string(), Some((11, 23))),
        ];
        let (embedded, stats) = embed_chunks(provider, chunks, 10).await.unwrap();
        assert_eq!(embedded.len(), 2);
        assert_eq!(stats.splits_performed, 0);
        assert_eq!(stats.max_depth_reached, 0);
        assert!(embedded.iter().all(|c| c.embedding.len() == 8));
        assert_eq!(embedded[0].source_span, Some((0, 11)));
    }

    #[tokio::test]
    async fn token_limit_recovery_splits_instead_of_dropping() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(LimitedProvider {
            dims: 8,
            max_chars: 100,
        });
        // One sentence-structured chunk well over the provider's limit.
        let long_text = "The quick brown fox jumps over the lazy dog. ".repeat(8);
        let chunks = vec![(long_text.clone(), Some((0, long_text.len())))];

        let (embedded, stats) = embed_chunks(provider, chunks, 10).await.unwrap();

        assert!(embedded.len() >= 2, "split must yield at least 2 sub-chunks");
        assert!(stats.splits_performed >= 1);
        assert!(stats.max_depth_reached >= 1);
        // Nothing dropped, nothing averaged: concatenation reproduces the text.
        let rebuilt: String = embedded.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, long_text);
        // Every sub-chunk has its own vector of full dimensionality.
        assert!(embedded.iter().all(|c| c.embedding.len() == 8));
        // Sub-chunks lose the parent's span.
        assert!(embedded.iter().all(|c| c.source_span.is_none()));
    }

    #[tokio::test]
    async fn pathological_input_fails_after_depth_cap() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(LimitedProvider {
            dims: 8,
            // 2^3 splits cannot get a 40k blob under 10 chars.
            max_chars: 10,
        });
        let chunks = vec![("word ".repeat(8000), None)];
        let err = embed_chunks(provider, chunks, 10).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn non_token_limit_failure_aborts_batch() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(FailingProvider);
        let chunks = vec![("text".to_string(), None)];
        let err = embed_chunks(provider, chunks, 10).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        struct WrongDims;
        #[async_trait]
        impl EmbeddingProvider for WrongDims {
            fn model_name(&self) -> &str {
                "wrong-dims"
            }
            fn dims(&self) -> usize {
                768
            }
            async fn embed(&self, _: &str) -> std::result::Result<Vec<f32>, EmbedError> {
                Ok(vec![0.0; 4])
            }
        }

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(WrongDims);
        let err = embed_chunks(provider, vec![("x".to_string(), None)], 4)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailed(_)));
    }

    #[test]
    fn split_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let (left, right) = split_for_embedding(&text);
        assert!(left.ends_with("\n\n"));
        assert_eq!(format!("{}{}", left, right), text);
    }

    #[test]
    fn split_falls_back_to_sentence_then_word() {
        let sentence = format!("{}. {}", "a".repeat(50), "b".repeat(50));
        let (left, _right) = split_for_embedding(&sentence);
        assert!(left.ends_with(". "));

        let words = format!("{} {}", "a".repeat(50), "b".repeat(50));
        let (left, _right) = split_for_embedding(&words);
        assert!(left.ends_with(' '));
    }

    #[test]
    fn split_hard_cuts_unbroken_text() {
        let text = "x".repeat(100);
        let (left, right) = split_for_embedding(&text);
        assert_eq!(left.len(), 50);
        assert_eq!(right.len(), 50);
    }

    #[test]
    fn token_limit_detection_matches_api_phrasing() {
        assert!(is_token_limit_message(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(is_token_limit_message("input exceeds the token limit"));
        assert!(!is_token_limit_message("invalid api key"));
    }
}
