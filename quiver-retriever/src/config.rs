//! Engine configuration, read from a TOML file.
//!
//! ```toml
//! database_path = "data/quiver.db"
//!
//! [scheduler]
//! max_workers = 8
//! max_retries = 5
//!
//! [cache]
//! capacity = 50000
//!
//! [provider]
//! kind = "http"
//! base_url = "http://localhost:11434"
//!
//! [[models]]
//! id = "my-model"
//! dimension = 256
//! metric = "cosine"
//! max_tokens = 512
//! ```
//!
//! Every field has a default, so an empty (or absent) file is a valid
//! configuration.

use crate::error::{EngineError, Result};
use crate::retrieval::scheduler::SchedulerConfig;
use quiver_embed::{
    EmbedConfig, EmbeddingProvider, HashingProvider, HttpEmbeddingProvider, ModelRegistry,
    ModelSpec,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_DATABASE_PATH: &str = "quiver.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database holding collections and records
    pub database_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub provider: ProviderConfig,
    /// Models added to (or overriding) the built-in table
    pub models: Vec<ModelSpec>,
    /// Use only `models`, ignoring the built-in table
    pub replace_builtin_models: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            provider: ProviderConfig::default(),
            models: Vec::new(),
            replace_builtin_models: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached embeddings
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Which embedding provider the engine talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Deterministic offline provider
    Hashing,
    /// Ollama-compatible HTTP server
    Http(EmbedConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Http(EmbedConfig::default())
    }
}

impl EngineConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_request(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`EngineConfig::load`], but an absent file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| EngineError::invalid_request(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        if self.cache.capacity == 0 {
            return Err(EngineError::invalid_request("cache.capacity must be at least 1"));
        }
        if let ProviderConfig::Http(embed) = &self.provider {
            embed.validate()?;
        }
        if self.replace_builtin_models && self.models.is_empty() {
            return Err(EngineError::invalid_request(
                "replace_builtin_models requires at least one [[models]] entry",
            ));
        }
        // surfaces zero dimensions and duplicate ids before anything is opened
        self.registry()?;
        Ok(())
    }

    /// Build the model registry this configuration describes.
    pub fn registry(&self) -> Result<ModelRegistry> {
        let registry = if self.replace_builtin_models {
            ModelRegistry::new(self.models.iter().cloned())?
        } else {
            ModelRegistry::builtin_with(self.models.iter().cloned())?
        };
        Ok(registry)
    }

    pub fn build_provider(
        &self,
        registry: Arc<ModelRegistry>,
    ) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider: Arc<dyn EmbeddingProvider> = match &self.provider {
            ProviderConfig::Hashing => Arc::new(HashingProvider::new(registry)),
            ProviderConfig::Http(embed) => Arc::new(HttpEmbeddingProvider::new(embed.clone())?),
        };
        Ok(provider)
    }
}
