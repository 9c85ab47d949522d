//! Embedding provider trait, hashed embedding cache, and similarity search.
//!
//! The embedding provider is an external collaborator. When it fails, every
//! similarity path silently falls back to Sørensen–Dice bigram similarity so
//! ranking keeps working through an outage.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use marduk_core::error::{Error, Result};
use marduk_core::tensor;

/// Default number of cached embeddings.
pub const DEFAULT_EMBEDDING_CACHE_SIZE: usize = 2048;

/// External collaborator producing embedding vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Normalize text before hashing or embedding: collapse whitespace and
/// lowercase ASCII letters.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Embedding-cache key: SHA-256 of the normalized text.
#[must_use]
pub fn embedding_cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Cosine similarity clamped to `[0, 1]`; a negative dot product reads as
/// unrelated rather than opposed.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let denominator = tensor::magnitude(a) * tensor::magnitude(b);
    if denominator == 0.0 {
        return 0.0;
    }
    f64::from((tensor::dot(a, b) / denominator).clamp(0.0, 1.0))
}

/// String-similarity fallback used when the embedding provider is down.
#[must_use]
pub fn string_similarity(a: &str, b: &str) -> f64 {
    strsim::sorensen_dice(&normalize_text(a), &normalize_text(b))
}

/// A candidate text with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredText {
    pub text: String,
    pub score: f64,
}

/// Similarity engine: embedding cache in front of the provider, cosine
/// scoring, and the string fallback.
pub struct SimilarityEngine {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl SimilarityEngine {
    #[must_use]
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_cache_size(provider, DEFAULT_EMBEDDING_CACHE_SIZE)
    }

    /// # Panics
    ///
    /// Panics if `cache_size` is zero.
    #[must_use]
    pub fn with_cache_size(provider: Arc<dyn EmbeddingProvider>, cache_size: usize) -> Self {
        Self {
            provider,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size).expect("embedding cache size must be positive"),
            )),
        }
    }

    /// Embedding for a text, cached by the SHA-256 of its normalized form.
    pub async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let key = embedding_cache_key(text);
        if let Some(vector) = self.cache.lock().get(&key) {
            return Ok(vector.clone());
        }

        let vector = self.provider.embed(text).await?;
        if !tensor::is_finite(&vector) || vector.is_empty() {
            return Err(Error::Api("embedding provider returned a non-finite vector".to_string()));
        }
        self.cache.lock().put(key, vector.clone());
        Ok(vector)
    }

    /// Similarity of two texts. Falls back to Dice bigrams when the
    /// provider fails.
    pub async fn similarity(&self, a: &str, b: &str) -> f64 {
        match (self.get_embedding(a).await, self.get_embedding(b).await) {
            (Ok(va), Ok(vb)) => cosine_similarity(&va, &vb),
            _ => {
                debug!("embedding unavailable, using string similarity");
                string_similarity(a, b)
            }
        }
    }

    /// Similarity of one query against many candidates, preserving the input
    /// order.
    pub async fn batch_similarities(&self, query: &str, texts: &[String]) -> Vec<ScoredText> {
        let query_embedding = self.get_embedding(query).await.ok();

        let mut scored = Vec::with_capacity(texts.len());
        for text in texts {
            let score = match (&query_embedding, self.get_embedding(text).await) {
                (Some(qv), Ok(tv)) => cosine_similarity(qv, &tv),
                _ => string_similarity(query, text),
            };
            scored.push(ScoredText {
                text: text.clone(),
                score,
            });
        }
        scored
    }
}

/// Deterministic token-hashing embedder.
///
/// Buckets tokens into a fixed-dimension bag-of-words vector, giving stable,
/// offline similarity semantics. Used as the default provider in tests and
/// when no external provider is configured.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = normalize_text(text);
        let mut vector = vec![0.0f32; self.dim];
        for token in normalized.split_whitespace() {
            // FNV-1a keeps the bucket assignment stable across runs.
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            vector[(hash % self.dim as u64) as usize] += 1.0;
        }
        tensor::normalize(&mut vector);
        Ok(vector)
    }
}

/// Provider that always fails; exercises the fallback paths in tests.
#[derive(Debug, Default, Clone)]
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Api("embedding provider offline".to_string()))
    }
}

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

#[derive(serde::Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(serde::Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(serde::Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

/// OpenAI embeddings provider.
///
/// Failures surface as API errors; the [`SimilarityEngine`] turns them into
/// the string-similarity fallback, so an outage degrades ranking quality
/// without failing queries.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: "text-embedding-3-small".to_string(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = normalize_text(text);
        let body = OpenAiEmbeddingRequest {
            model: &self.model,
            input: &normalized,
        };

        let response = self
            .client
            .post(OPENAI_EMBEDDINGS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Api(format!("embedding request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("embedding status {status}: {detail}")));
        }

        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Api(format!("malformed embedding response: {e}")))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Api("embedding response carried no vectors".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello   World \n"), "hello world");
        assert_eq!(normalize_text("MiXeD"), "mixed");
    }

    #[test]
    fn test_cache_key_is_stable_under_whitespace() {
        assert_eq!(embedding_cache_key("a  b"), embedding_cache_key("A b "));
        assert_ne!(embedding_cache_key("a b"), embedding_cache_key("a c"));
    }

    #[test]
    fn test_cosine_clamps_negative_to_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0], &[0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("chaos and dynamics").await.unwrap();
        let b = embedder.embed("chaos and dynamics").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_similar_texts_score_higher() {
        let engine = SimilarityEngine::new(Arc::new(HashingEmbedder::default()));
        let related = engine
            .similarity("chaos theory dynamics", "chaos theory and dynamic systems")
            .await;
        let unrelated = engine
            .similarity("chaos theory dynamics", "banana bread recipe")
            .await;
        assert!(related > unrelated);
    }

    #[tokio::test]
    async fn test_embedding_cache_hits() {
        let engine = SimilarityEngine::new(Arc::new(HashingEmbedder::default()));
        let first = engine.get_embedding("cached text").await.unwrap();
        // Same normalized text must come back from the cache unchanged.
        let second = engine.get_embedding("  Cached   TEXT ").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_fallback_on_provider_failure() {
        let engine = SimilarityEngine::new(Arc::new(FailingEmbedder));
        let score = engine.similarity("night sky", "night sky").await;
        assert!((score - 1.0).abs() < 1e-6);

        let scored = engine
            .batch_similarities("night sky", &["night sky".to_string(), "daylight".to_string()])
            .await;
        assert_eq!(scored.len(), 2);
        assert!(scored[0].score > scored[1].score);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let engine = SimilarityEngine::new(Arc::new(HashingEmbedder::default()));
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let scored = engine.batch_similarities("two", &texts).await;
        let names: Vec<&str> = scored.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }
}
