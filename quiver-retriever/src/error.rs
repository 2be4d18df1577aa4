//! Error taxonomy for the engine

use quiver_embed::{EmbedError, Modality};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the vector store, scheduler and query engine.
///
/// Validation errors are returned synchronously from the offending call.
/// Transient errors ([`EngineError::is_transient`]) raised while an ingestion
/// item is processed are absorbed by the retry policy and only reach the
/// caller as the recorded reason of a dead-lettered item.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown embedding model: {model}")]
    UnknownModel { model: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Ingestion queue is full: {requested} items requested, {available} of {capacity} slots free")]
    QueueFull {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("Embedding provider timed out after {timeout:?} (model {model})")]
    ProviderTimeout { model: String, timeout: Duration },

    #[error("Embedding provider error: {message}")]
    ProviderError { message: String },

    #[error("Storage error: {message}")]
    StorageError { message: String },

    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("Collection already exists: {name}")]
    CollectionAlreadyExists { name: String },

    #[error("Collection {collection} uses model {expected}, got {actual}")]
    ModelMismatch {
        collection: String,
        expected: String,
        actual: String,
    },

    #[error("Collection {collection} holds {expected} embeddings, got {actual}")]
    ModalityMismatch {
        collection: String,
        expected: Modality,
        actual: Modality,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Submission not found: {id}")]
    SubmissionNotFound { id: u64 },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::ProviderError {
            message: message.into(),
        }
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn collection_not_found<S: Into<String>>(name: S) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Whether a retry of the failed step could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. } | Self::ProviderError { .. } | Self::StorageError { .. }
        )
    }
}

impl From<EmbedError> for EngineError {
    fn from(error: EmbedError) -> Self {
        match error {
            EmbedError::UnknownModel { model } => Self::UnknownModel { model },
            EmbedError::DimensionMismatch {
                expected, actual, ..
            } => Self::DimensionMismatch { expected, actual },
            EmbedError::ProviderTimeout { model, timeout } => {
                Self::ProviderTimeout { model, timeout }
            }
            EmbedError::ProviderError { message } => Self::ProviderError { message },
            EmbedError::InvalidConfig { message } => Self::InvalidRequest { message },
            EmbedError::Http { source } => Self::ProviderError {
                message: source.to_string(),
            },
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        Self::StorageError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::storage("disk full").is_transient());
        assert!(EngineError::provider("bad gateway").is_transient());
        assert!(
            EngineError::ProviderTimeout {
                model: "m".to_string(),
                timeout: Duration::from_millis(10)
            }
            .is_transient()
        );

        assert!(!EngineError::collection_not_found("docs").is_transient());
        assert!(!EngineError::invalid_request("empty batch").is_transient());
        assert!(
            !EngineError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
            .is_transient()
        );
        assert!(!EngineError::ShuttingDown.is_transient());
    }

    #[test]
    fn test_embed_error_mapping() {
        let err: EngineError = EmbedError::unknown_model("nope").into();
        assert!(matches!(err, EngineError::UnknownModel { model } if model == "nope"));

        let err: EngineError = EmbedError::DimensionMismatch {
            model: "m1".to_string(),
            expected: 3,
            actual: 4,
        }
        .into();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
        ));

        let err: EngineError = EmbedError::provider("boom").into();
        assert!(err.is_transient());

        let err: EngineError = EmbedError::invalid_config("bad").into();
        assert!(matches!(err, EngineError::InvalidRequest { .. }));
    }

    #[test]
    fn test_sqlx_error_is_storage_error() {
        let err: EngineError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, EngineError::StorageError { .. }));
        assert!(err.is_transient());
    }
}
