//! # quiver-embed
//!
//! The embedding side of the quiver engine: which models exist, how their
//! vectors are produced, and how repeated content avoids a second trip to the
//! provider.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quiver_embed::{EmbedConfig, EmbeddingProvider, HttpEmbeddingProvider, ModelRegistry};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = ModelRegistry::builtin();
//! let provider = HttpEmbeddingProvider::new(EmbedConfig::ollama("http://localhost:11434"))?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed(&texts, "nomic-embed-text").await?;
//! for vector in &result.embeddings {
//!     registry.validate_vector("nomic-embed-text", vector)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`registry`]: the closed, validated model table
//! - [`cache`]: content-addressed LRU cache of vectors with in-flight pinning
//! - [`provider`]: the [`EmbeddingProvider`] trait and the offline hashing provider
//! - [`http`]: provider for Ollama-compatible HTTP servers
//! - [`config`]: HTTP provider configuration
//! - [`error`]: error types and result handling
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! [`EmbedError::is_transient`] tells callers which failures are worth
//! retrying.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod provider;
pub mod registry;

// Re-export main types for easy access
pub use cache::{CachePin, CacheStats, ContentHash, EmbeddingCache};
pub use config::EmbedConfig;
pub use error::{EmbedError, Result};
pub use http::HttpEmbeddingProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, HashingProvider, normalize};
pub use registry::{DistanceMetric, Modality, ModelRegistry, ModelSpec};
