//! Text embedding providers.
//!
//! Cosine similarity in the vector store assumes unit norm, so every
//! `embed`/`embed_batch` result is L2-normalized before it leaves this module,
//! regardless of provider — no provider API is trusted to already return unit
//! vectors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Abstraction for text → vector embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

/// Scale every component of `v` so that `||v|| == 1`. A zero vector is left as-is
/// (there is no sensible direction to normalize it to).
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// OpenAI embedding provider using text-embedding-3-small (1536 dims) by default.
pub struct OpenAIEmbedding {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIEmbedding {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            model: "text-embedding-3-small".to_string(),
            dims: 1536,
        }
    }

    pub fn with_model(mut self, model: &str, dims: usize) -> Self {
        self.model = model.to_string();
        self.dims = dims;
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .context("empty embedding response")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let max_retries = 3u32;
        let mut attempt = 0;

        loop {
            let body = EmbeddingRequest {
                model: self.model.clone(),
                input: texts.to_vec(),
            };

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    let data: EmbeddingResponse =
                        r.json().await.context("failed to parse embedding response")?;
                    return Ok(data
                        .data
                        .into_iter()
                        .map(|d| l2_normalize(d.embedding))
                        .collect());
                }
                Ok(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();
                    if attempt < max_retries && (status.is_server_error() || status.as_u16() == 429) {
                        let delay = Duration::from_secs(2u64.pow(attempt));
                        warn!(attempt, %status, "embedding API error, retrying in {:?}", delay);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        anyhow::bail!("embedding API error {}: {}", status, text);
                    }
                }
                Err(e) => {
                    if attempt < max_retries {
                        let delay = Duration::from_secs(2u64.pow(attempt));
                        warn!(attempt, error = %e, "embedding request failed, retrying in {:?}", delay);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        return Err(e).context("embedding API request failed after retries");
                    }
                }
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Construct the configured embedding provider. `"mock"` is only accepted outside
/// release builds; it exists so the learning loop can be exercised in tests without
/// network access.
pub fn build_provider(provider: &str, api_key: &str, model: &str, dims: usize) -> Result<Box<dyn EmbeddingProvider>> {
    match provider {
        "openai" => Ok(Box::new(OpenAIEmbedding::new(api_key).with_model(model, dims))),
        #[cfg(test)]
        "mock" => Ok(Box::new(MockEmbedding::new(dims))),
        other => anyhow::bail!("unsupported embedding provider: {other}"),
    }
}

/// Mock embedding provider for testing — returns deterministic, unit-norm vectors.
#[cfg(test)]
pub struct MockEmbedding {
    dims: usize,
}

#[cfg(test)]
impl MockEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[cfg(test)]
#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(text.as_bytes());
        let raw: Vec<f32> = (0..self.dims)
            .map(|i| {
                let byte = hash[i % 32] as f32;
                (byte / 255.0) * 2.0 - 1.0
            })
            .collect();
        Ok(l2_normalize(raw))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let v = l2_normalize(vec![3.0, 4.0]);
        let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector_untouched() {
        let v = l2_normalize(vec![0.0, 0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn mock_embedding_is_deterministic_and_unit_norm() {
        let provider = MockEmbedding::new(32);
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn mock_embedding_differs_across_inputs() {
        let provider = MockEmbedding::new(32);
        let a = provider.embed("alpha").await.unwrap();
        let b = provider.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }
}
