//! Embedding service abstraction
//!
//! Provides a unified interface for embedding providers:
//! - OpenAI (text-embedding-3-small, text-embedding-3-large, ada-002)
//! - A deterministic hashing embedder for offline runs and tests

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics::record_embedding;
use crate::upstream;
use async_trait::async_trait;
use backoff::future::retry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch), in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// OpenAI embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    batch_size: usize,
    retry_budget: Duration,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(api_key: String, config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            batch_size: config.batch_size.max(1),
            retry_budget: Duration::from_secs(config.retry_budget_secs),
        })
    }

    /// Make request with retry
    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let result = retry(upstream::retry_policy(self.retry_budget), || async {
            self.make_request(texts).await
        })
        .await;

        record_embedding(
            start.elapsed().as_secs_f64(),
            &self.model,
            texts.len(),
            result.is_ok(),
        );
        result
    }

    async fn make_request(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, backoff::Error<AppError>> {
        let url = format!("{}/embeddings", self.base_url);

        // Only the v3 family accepts a custom output size
        let request = OpenAIRequest {
            input: texts,
            model: &self.model,
            dimensions: self
                .model
                .starts_with("text-embedding-3")
                .then_some(self.dimension),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let transient = upstream::is_transient_transport(&e);
                upstream::classify(
                    AppError::EmbeddingError {
                        message: format!("Request failed: {}", e),
                    },
                    transient,
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream::classify(
                AppError::EmbeddingError {
                    message: format!("API error {}: {}", status, body),
                },
                upstream::is_transient_status(status),
            ));
        }

        let mut result: OpenAIResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(AppError::EmbeddingError {
                message: format!("Failed to parse response: {}", e),
            })
        })?;

        if result.data.len() != texts.len() {
            return Err(backoff::Error::permanent(AppError::EmbeddingError {
                message: format!(
                    "expected {} embeddings, received {}",
                    texts.len(),
                    result.data.len()
                ),
            }));
        }

        result.data.sort_by_key(|e| e.index);
        Ok(result.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.request_with_retry(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::EmbeddingError {
                message: "Empty response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            let embeddings = self.request_with_retry(chunk).await?;
            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic bag-of-words embedder.
///
/// Every lower-cased alphanumeric token is hashed (SHA-256) into a signed
/// bucket and the vector is L2-normalized, so texts sharing words have a
/// positive cosine similarity and identical texts always embed identically.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn hash_embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = digest[..8]
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[(bucket % self.dimension as u64) as usize] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.hash_embed(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_embed(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => match config.api_key.clone().filter(|k| !k.is_empty()) {
            Some(key) => Ok(Arc::new(OpenAIEmbedder::new(key, config)?)),
            None => {
                tracing::warn!("No embedding API key configured, using mock embeddings");
                Ok(Arc::new(MockEmbedder::new(config.dimension)))
            }
        },
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => Err(AppError::Configuration {
            message: format!("unknown embedding provider '{}'", other),
        }),
    }
}

/// Cosine similarity; zero vectors are similar to nothing
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(256);
        let first = embedder.embed("Alpha Beta").await.unwrap();
        let second = embedder.embed("alpha, beta").await.unwrap();
        assert_eq!(first.len(), 256);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_mock_embedder_shared_words_score_higher() {
        let embedder = MockEmbedder::new(1024);
        let query = embedder.embed("Alpha").await.unwrap();
        let related = embedder.embed("Alpha Beta").await.unwrap();
        let unrelated = embedder.embed("Gamma Delta").await.unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_mock_batch() {
        let embedder = MockEmbedder::new(64);
        let texts = vec!["text1".to_string(), "text2".to_string()];
        let embeddings = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0], embedder.embed("text1").await.unwrap());
    }

    #[test]
    fn test_cosine_of_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_create_embedder_without_key_falls_back() {
        let config = EmbeddingConfig::default();
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.model_name(), "mock-embedding");
        assert_eq!(embedder.dimension(), config.dimension);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "carrier-pigeon".into(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            create_embedder(&config),
            Err(AppError::Configuration { .. })
        ));
    }
}
