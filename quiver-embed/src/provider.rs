//! Embedding provider trait and the offline hashing provider

use crate::error::{EmbedError, Result};
use crate::registry::ModelRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of embedding generation
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, in input order
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
    /// Model that produced the vectors
    pub model: String,
}

impl EmbeddingResult {
    /// Create a new embedding result.
    ///
    /// The dimension is inferred from the first vector, or 0 when empty.
    pub fn new(model: impl Into<String>, embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
            model: model.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn into_vectors(self) -> Vec<Vec<f32>> {
        self.embeddings
    }
}

/// Something that turns content into vectors for a named model.
///
/// Implementations must return exactly one vector per input, in input order.
/// Calls can be slow and can fail; callers wrap them in a timeout and treat
/// transient errors as retryable.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of inputs
    async fn embed(&self, texts: &[String], model: &str) -> Result<EmbeddingResult>;

    /// Generate the embedding for a single input
    async fn embed_one(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let result = self.embed(&[text.to_string()], model).await?;
        result
            .into_vectors()
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::provider("provider returned no vectors"))
    }

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// Scale a vector to unit length in place.
///
/// Returns `false` (and leaves the vector untouched) for a zero vector.
pub fn normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for v in vector.iter_mut() {
            *v /= norm;
        }
        true
    } else {
        false
    }
}

/// Deterministic offline provider.
///
/// Hashes character trigrams and whole words into a vector of the model's
/// registered dimension and unit-normalizes it. Similar strings share
/// features, so nearest-neighbour results are meaningful enough for local
/// runs and tests, without any network access.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    registry: Arc<ModelRegistry>,
}

impl HashingProvider {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Embed one input into `dimension` slots.
    pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0f32; dimension];
        if dimension == 0 {
            return embedding;
        }

        let lower = text.to_lowercase();
        let mut word_freq: HashMap<&str, u32> = HashMap::new();
        for word in lower.split_whitespace() {
            *word_freq.entry(word).or_insert(0) += 1;
        }

        for (word, freq) in &word_freq {
            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let hash = window
                    .iter()
                    .fold(0u64, |acc, c| acc.wrapping_mul(37).wrapping_add(*c as u64));
                embedding[(hash as usize) % dimension] += (*freq as f32).sqrt();
            }

            let word_hash = word
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            embedding[(word_hash as usize) % dimension] += *freq as f32;
        }

        if !normalize(&mut embedding) {
            // empty input still maps to a valid unit vector
            embedding[0] = 1.0;
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed(&self, texts: &[String], model: &str) -> Result<EmbeddingResult> {
        let spec = self.registry.resolve(model)?;
        let embeddings = texts
            .iter()
            .map(|text| Self::hash_embedding(text, spec.dimension))
            .collect();
        tracing::debug!("Hashed {} inputs for model {}", texts.len(), model);
        Ok(EmbeddingResult::new(model, embeddings))
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DistanceMetric, ModelSpec};

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new(vec![ModelSpec::new("m1", 64, DistanceMetric::Cosine)]).unwrap(),
        )
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::new("m1", vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 2);
        assert!(!result.is_empty());

        let empty = EmbeddingResult::new("m1", vec![]);
        assert!(empty.is_empty());
        assert_eq!(empty.dimension, 0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        assert!(normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        assert!(!normalize(&mut zero));
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_hashing_provider_dimensions_and_determinism() {
        let provider = HashingProvider::new(registry());
        let texts = vec!["hello world".to_string(), "".to_string()];
        let first = provider.embed(&texts, "m1").await.unwrap();
        let second = provider.embed(&texts, "m1").await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first.dimension, 64);
        assert_eq!(first, second);
        for v in &first.embeddings {
            assert!((dot(v, v) - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_hashing_provider_similarity() {
        let provider = HashingProvider::new(registry());
        let a = provider.embed_one("vector database search", "m1").await.unwrap();
        let b = provider.embed_one("vector database searching", "m1").await.unwrap();
        let c = provider.embed_one("banana bread recipe", "m1").await.unwrap();
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[tokio::test]
    async fn test_hashing_provider_unknown_model() {
        let provider = HashingProvider::new(registry());
        let err = provider
            .embed(&["x".to_string()], "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::UnknownModel { .. }));
        assert_eq!(provider.provider_name(), "hashing");
    }
}
