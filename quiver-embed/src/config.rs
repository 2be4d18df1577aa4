//! Configuration for the HTTP embedding provider

use crate::error::{EmbedError, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default Ollama-compatible endpoint
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Path of the batch embedding endpoint, relative to `base_url`
pub const EMBED_ENDPOINT: &str = "/api/embed";

/// Configuration for an HTTP embedding provider.
///
/// Can be assembled with the builder or read from the `[provider]` table of an
/// engine configuration file; every field has a default.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[serde(default)]
pub struct EmbedConfig {
    /// Base URL of the provider (e.g., "http://localhost:11434")
    #[builder(default = "DEFAULT_BASE_URL.to_string()")]
    pub base_url: String,
    /// Per-request timeout in milliseconds
    #[builder(default = "30_000")]
    pub request_timeout_ms: u64,
    /// Maximum number of inputs sent in one request
    #[builder(default = "32")]
    pub batch_size: usize,
    /// Optional bearer token
    #[builder(default)]
    pub api_key: Option<String>,
}

impl EmbedConfig {
    /// Create a new embedding configuration using the builder
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Configuration pointing at an Ollama-compatible server
    pub fn ollama(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the maximum request batch size (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set the request timeout (builder style)
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            request_timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    /// Set the bearer token (builder style)
    pub fn with_api_key<S: Into<String>>(self, api_key: S) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..self
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Full URL of the embedding endpoint
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), EMBED_ENDPOINT)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(EmbedError::invalid_config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(EmbedError::invalid_config(
                "request_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        EmbedConfigBuilder::default()
            .build()
            .expect("Failed to build default EmbedConfig")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = EmbedConfig::builder().build().unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.api_key, None);
        assert_eq!(config, EmbedConfig::default());
    }

    #[test]
    fn test_builder_methods() {
        let config = EmbedConfig::ollama("http://gpu-box:11434/")
            .with_batch_size(8)
            .with_timeout(Duration::from_secs(5))
            .with_api_key("secret");

        assert_eq!(config.endpoint(), "http://gpu-box:11434/api/embed");
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(EmbedConfig::ollama("localhost:11434").validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(0).validate().is_err());

        let config = EmbedConfig::builder()
            .request_timeout_ms(0u64)
            .build()
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(EmbedError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EmbedConfig =
            serde_json::from_str(r#"{"base_url": "https://embed.internal", "batch_size": 4}"#)
                .unwrap();
        assert_eq!(config.base_url, "https://embed.internal");
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.request_timeout_ms, 30_000);
    }
}
