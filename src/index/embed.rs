//! Embedding backends
//!
//! The embedding model is a single logical, stateless service: every
//! backend takes `&self` and may be called concurrently.

use super::keyword::tokenize;
use crate::config::{EmbedderBackend, EmbedderConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Maps text to a fixed-size, L2-normalized vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Backend name for logs and manifests
    fn name(&self) -> &str;

    /// Output dimension
    fn dimension(&self) -> usize;

    /// Embed a text span
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Scale a vector to unit length; the zero vector is returned unchanged
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Deterministic feature-hashing embedder.
///
/// Each token and adjacent token pair is hashed into a signed bucket. Needs
/// no model download and produces identical vectors on every machine.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder with the given output dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn accumulate(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let tokens = tokenize(text);
        for token in &tokens {
            self.accumulate(&mut v, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut v, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        l2_normalize(v)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by a local Ollama server (`/api/embeddings`)
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    /// Create a client for `base_url` producing `dimension`-sized vectors
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&OllamaEmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<OllamaEmbeddingResponse>()
            .await?;

        if response.embedding.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "model '{}' returned {} dimensions, expected {}",
                self.model,
                response.embedding.len(),
                self.dimension
            )));
        }
        Ok(l2_normalize(response.embedding))
    }
}

/// Build the configured embedding backend
pub fn from_config(config: &EmbedderConfig, dimension: usize) -> Arc<dyn Embedder> {
    match config.backend {
        EmbedderBackend::Hashing => Arc::new(HashingEmbedder::new(dimension)),
        EmbedderBackend::Ollama => Arc::new(OllamaEmbedder::new(
            config.url.clone(),
            config.model.clone(),
            dimension,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("the kingdom of heaven").await.unwrap();
        let b = embedder.embed("the kingdom of heaven").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_text_scores_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed("love your neighbour").await.unwrap();
        let close = embedder.embed("you shall love your neighbour as yourself").await.unwrap();
        let far = embedder.embed("the quarterly revenue report is attached").await.unwrap();

        assert!(dot(&query, &close) > dot(&query, &far));
    }

    #[tokio::test]
    async fn test_empty_text_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let v = embedder.embed("  ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_from_config() {
        let embedder = from_config(&EmbedderConfig::default(), 32);
        assert_eq!(embedder.name(), "hashing");
        assert_eq!(embedder.dimension(), 32);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }
}
