//! Static table of embedding models.
//!
//! The registry maps a model identifier to its dimensionality, distance metric
//! and input token limit. It is built once at startup, validated, and never
//! mutated afterwards, so it can be shared behind an `Arc` and read from any
//! number of tasks without locking.
//!
//! Every vector that enters the engine is checked against the registry entry
//! for its model; there is no fallback dimension for unknown identifiers.

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Distance metric declared by a model (and inherited by collections using it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine similarity over unit-normalized vectors
    Cosine,
    /// Euclidean distance
    L2,
    /// Raw dot product
    InnerProduct,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
            Self::InnerProduct => "inner_product",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "l2" | "euclidean" => Ok(Self::L2),
            "inner_product" | "ip" | "dot" => Ok(Self::InnerProduct),
            other => Err(EmbedError::invalid_config(format!(
                "Unknown distance metric: {other}"
            ))),
        }
    }
}

/// Kind of content an embedding was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Code,
    Caption,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Caption => "caption",
            Self::Image => "image",
        }
    }

    /// Text-like modalities are whitespace-normalized before hashing and are
    /// subject to token limits; image content is passed through untouched.
    pub fn is_textual(&self) -> bool {
        !matches!(self, Self::Image)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "code" => Ok(Self::Code),
            "caption" => Ok(Self::Caption),
            "image" => Ok(Self::Image),
            other => Err(EmbedError::invalid_config(format!(
                "Unknown modality: {other}"
            ))),
        }
    }
}

/// Registry entry for one embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier as passed to the provider (e.g. "nomic-embed-text")
    pub id: String,
    /// Length of every vector the model produces
    pub dimension: usize,
    /// Metric the model's vectors are meant to be compared with
    pub metric: DistanceMetric,
    /// Maximum input length in tokens
    pub max_tokens: usize,
    /// Modalities the model accepts
    #[serde(default = "default_modalities")]
    pub modalities: Vec<Modality>,
    /// Name of the provider serving the model
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Lower is preferred when picking a default model
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub description: String,
}

fn default_modalities() -> Vec<Modality> {
    vec![Modality::Text]
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_priority() -> u32 {
    100
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            id: id.into(),
            dimension,
            metric,
            max_tokens: 512,
            modalities: default_modalities(),
            provider: default_provider(),
            priority: default_priority(),
            description: String::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_modalities(mut self, modalities: Vec<Modality>) -> Self {
        self.modalities = modalities;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn supports(&self, modality: Modality) -> bool {
        self.modalities.contains(&modality)
    }
}

/// Immutable, validated lookup table of embedding models.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelSpec>,
}

impl ModelRegistry {
    /// Build a registry from a list of model specs.
    ///
    /// # Errors
    /// `InvalidConfig` if any spec has a zero dimension or token limit, or if
    /// two specs share an identifier.
    pub fn new(specs: impl IntoIterator<Item = ModelSpec>) -> Result<Self> {
        let mut models = HashMap::new();
        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(EmbedError::invalid_config("Model id must not be empty"));
            }
            if spec.dimension == 0 {
                return Err(EmbedError::invalid_config(format!(
                    "Model {} declares a zero dimension",
                    spec.id
                )));
            }
            if spec.max_tokens == 0 {
                return Err(EmbedError::invalid_config(format!(
                    "Model {} declares a zero token limit",
                    spec.id
                )));
            }
            if spec.modalities.is_empty() {
                return Err(EmbedError::invalid_config(format!(
                    "Model {} declares no modalities",
                    spec.id
                )));
            }
            if models.contains_key(&spec.id) {
                return Err(EmbedError::invalid_config(format!(
                    "Duplicate model id: {}",
                    spec.id
                )));
            }
            models.insert(spec.id.clone(), spec);
        }

        tracing::debug!("Model registry built with {} models", models.len());
        Ok(Self { models })
    }

    /// The built-in model table.
    pub fn builtin() -> Self {
        Self::new(builtin_specs()).expect("built-in model table is valid")
    }

    /// Built-in table extended (or overridden, by id) with extra specs.
    pub fn builtin_with(extra: impl IntoIterator<Item = ModelSpec>) -> Result<Self> {
        let mut specs: HashMap<String, ModelSpec> = builtin_specs()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        for spec in extra {
            specs.insert(spec.id.clone(), spec);
        }
        Self::new(specs.into_values())
    }

    /// Look up a model, failing with `UnknownModel` if absent.
    pub fn resolve(&self, model: &str) -> Result<&ModelSpec> {
        self.models
            .get(model)
            .ok_or_else(|| EmbedError::unknown_model(model))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    /// Check a vector against the model's declared dimensionality.
    pub fn validate_vector(&self, model: &str, vector: &[f32]) -> Result<()> {
        let spec = self.resolve(model)?;
        if vector.len() != spec.dimension {
            return Err(EmbedError::DimensionMismatch {
                model: model.to_string(),
                expected: spec.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Sorted list of registered model ids.
    pub fn models(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn specs(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Preferred model for a modality: lowest priority number, ties broken by id.
    pub fn best_model(&self, modality: Modality) -> Option<&ModelSpec> {
        self.models
            .values()
            .filter(|spec| spec.supports(modality))
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
    }

    /// Rough token estimate: whitespace words x 1.3, rounded up.
    pub fn estimate_tokens(text: &str) -> usize {
        let words = text.split_whitespace().count();
        (words as f64 * 1.3).ceil() as usize
    }

    /// Cut text down to the model's token limit, on word boundaries.
    ///
    /// Text already within the limit is returned unchanged.
    pub fn truncate_to_limit(&self, model: &str, text: &str) -> Result<String> {
        let spec = self.resolve(model)?;
        if Self::estimate_tokens(text) <= spec.max_tokens {
            return Ok(text.to_string());
        }

        let max_words = ((spec.max_tokens as f64) / 1.3).floor() as usize;
        let truncated = text
            .split_whitespace()
            .take(max_words.max(1))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(
            "Truncated input for {} from ~{} to ~{} tokens",
            model,
            Self::estimate_tokens(text),
            Self::estimate_tokens(&truncated)
        );
        Ok(truncated)
    }
}

fn builtin_specs() -> Vec<ModelSpec> {
    use DistanceMetric::Cosine;
    use Modality::{Caption, Code, Image, Text};

    vec![
        ModelSpec::new("embeddinggemma", 1024, Cosine)
            .with_modalities(vec![Text, Code, Caption])
            .with_priority(1)
            .with_description("Google's EmbeddingGemma model via Ollama"),
        ModelSpec::new("nomic-embed-text", 768, Cosine)
            .with_modalities(vec![Text, Caption])
            .with_priority(2)
            .with_description("Nomic's general-purpose embedding model"),
        ModelSpec::new("mxbai-embed-large", 1024, Cosine)
            .with_modalities(vec![Text, Caption])
            .with_priority(2)
            .with_description("Multilingual embedding model"),
        ModelSpec::new("bge-m3", 1024, Cosine)
            .with_modalities(vec![Text, Caption])
            .with_priority(3)
            .with_description("BGE M3 multilingual embedding model"),
        ModelSpec::new("all-minilm", 384, Cosine)
            .with_max_tokens(256)
            .with_modalities(vec![Text, Caption])
            .with_priority(4)
            .with_description("Lightweight sentence transformer model"),
        ModelSpec::new("all-mpnet-base-v2", 768, Cosine)
            .with_max_tokens(384)
            .with_modalities(vec![Text, Caption])
            .with_priority(4)
            .with_description("High-quality sentence transformer model"),
        ModelSpec::new("jina-embeddings-v2-base-code", 768, Cosine)
            .with_max_tokens(8192)
            .with_modalities(vec![Code])
            .with_priority(1)
            .with_description("Source-code embedding model"),
        ModelSpec::new("clip-vit-b-32", 512, Cosine)
            .with_max_tokens(77)
            .with_modalities(vec![Image, Caption])
            .with_priority(1)
            .with_description("CLIP joint image/caption embedding model"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_registry() -> ModelRegistry {
        ModelRegistry::new(vec![
            ModelSpec::new("m1", 3, DistanceMetric::Cosine).with_max_tokens(4),
            ModelSpec::new("m2", 2, DistanceMetric::L2).with_priority(1),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let registry = small_registry();
        let spec = registry.resolve("m1").unwrap();
        assert_eq!(spec.dimension, 3);
        assert_eq!(spec.metric, DistanceMetric::Cosine);

        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, EmbedError::UnknownModel { model } if model == "missing"));
    }

    #[test]
    fn test_validate_vector() {
        let registry = small_registry();
        assert!(registry.validate_vector("m1", &[1.0, 0.0, 0.0]).is_ok());

        let err = registry.validate_vector("m1", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            EmbedError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_invalid_tables() {
        assert!(ModelRegistry::new(vec![ModelSpec::new("z", 0, DistanceMetric::Cosine)]).is_err());
        assert!(
            ModelRegistry::new(vec![
                ModelSpec::new("dup", 3, DistanceMetric::Cosine),
                ModelSpec::new("dup", 4, DistanceMetric::Cosine),
            ])
            .is_err()
        );
        assert!(
            ModelRegistry::new(vec![
                ModelSpec::new("t", 3, DistanceMetric::Cosine).with_max_tokens(0)
            ])
            .is_err()
        );
    }

    #[test]
    fn test_builtin_table() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.resolve("nomic-embed-text").unwrap().dimension, 768);
        assert_eq!(registry.resolve("all-minilm").unwrap().max_tokens, 256);
        assert_eq!(
            registry.best_model(Modality::Image).unwrap().id,
            "clip-vit-b-32"
        );
        assert_eq!(registry.best_model(Modality::Text).unwrap().id, "embeddinggemma");
    }

    #[test]
    fn test_builtin_with_overrides() {
        let registry = ModelRegistry::builtin_with(vec![
            ModelSpec::new("nomic-embed-text", 16, DistanceMetric::InnerProduct),
            ModelSpec::new("custom", 8, DistanceMetric::L2),
        ])
        .unwrap();
        assert_eq!(registry.resolve("nomic-embed-text").unwrap().dimension, 16);
        assert!(registry.contains("custom"));
        assert!(registry.contains("bge-m3"));
    }

    #[test]
    fn test_truncate_to_limit() {
        let registry = small_registry();
        assert_eq!(registry.truncate_to_limit("m1", "one two").unwrap(), "one two");

        // limit 4 tokens -> floor(4 / 1.3) = 3 words
        let truncated = registry
            .truncate_to_limit("m1", "one two   three four five six")
            .unwrap();
        assert_eq!(truncated, "one two three");
    }

    #[test]
    fn test_metric_and_modality_parsing() {
        assert_eq!("cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("L2".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert_eq!(
            "dot".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::InnerProduct
        );
        assert!("manhattan".parse::<DistanceMetric>().is_err());

        assert_eq!("caption".parse::<Modality>().unwrap(), Modality::Caption);
        assert!(!Modality::Image.is_textual());
        assert!(Modality::Code.is_textual());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_build_is_logged() {
        let registry = small_registry();
        assert!(!registry.is_empty());
        assert!(logs_contain("Model registry built with"));
    }
}
