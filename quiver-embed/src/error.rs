//! Error types for the embedding side of the engine

use std::time::Duration;

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for model lookups, cache validation and provider calls.
///
/// Validation failures (`UnknownModel`, `DimensionMismatch`, `InvalidConfig`)
/// are permanent: retrying the same call cannot succeed. Provider failures
/// (`ProviderTimeout`, `ProviderError`, `Http`) are transient and are expected
/// to be absorbed by the caller's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// The model identifier is not present in the registry
    #[error("Unknown embedding model: {model}")]
    UnknownModel { model: String },

    /// A vector's length disagrees with the model's declared dimensionality
    #[error("Dimension mismatch for model {model}: expected {expected}, got {actual}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    /// The provider did not answer within the configured timeout
    #[error("Embedding provider timed out after {timeout:?} (model {model})")]
    ProviderTimeout { model: String, timeout: Duration },

    /// The provider answered with an error or a malformed response
    #[error("Embedding provider error: {message}")]
    ProviderError { message: String },

    /// Invalid registry or provider configuration
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Transport-level HTTP failures
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
}

impl EmbedError {
    /// Create an unknown-model error.
    pub fn unknown_model<S: Into<String>>(model: S) -> Self {
        Self::UnknownModel {
            model: model.into(),
        }
    }

    /// Create a provider error with a custom message.
    ///
    /// Used for non-success responses, undecodable bodies and responses that
    /// carry the wrong number of vectors.
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::ProviderError {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. } | Self::ProviderError { .. } | Self::Http { .. }
        )
    }
}
