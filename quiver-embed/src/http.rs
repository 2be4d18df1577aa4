//! HTTP embedding provider for Ollama-compatible servers.
//!
//! Posts `{model, input}` to `/api/embed` and expects `{embeddings: [[f32]]}`
//! back, one vector per input. Large batches are split according to
//! [`EmbedConfig::batch_size`]. Retries are left to the caller so that a single
//! retry policy governs every provider.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Request payload for the batch embedding endpoint
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response from the batch embedding endpoint
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Error body returned on non-success status codes
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    client: Client,
    config: EmbedConfig,
}

impl HttpEmbeddingProvider {
    /// Build a provider from a validated configuration.
    ///
    /// No request is made here; connectivity problems surface on the first
    /// `embed` call as transient errors.
    pub fn new(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    #[instrument(skip(self, texts), fields(batch = texts.len()))]
    async fn embed_batch(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let url = self.config.endpoint();
        let mut request = self.client.post(&url).json(&EmbedRequest {
            model,
            input: texts,
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        debug!("Sending embedding request to {}", url);
        let response = request.send().await.map_err(|e| self.map_error(e, model))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(EmbedError::provider(format!(
                "provider returned {status} for model {model}: {message}"
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::provider(format!("failed to decode response: {e}")))?;

        if body.embeddings.len() != texts.len() {
            return Err(EmbedError::provider(format!(
                "expected {} vectors, provider returned {}",
                texts.len(),
                body.embeddings.len()
            )));
        }

        Ok(body.embeddings)
    }

    fn map_error(&self, error: reqwest::Error, model: &str) -> EmbedError {
        if error.is_timeout() {
            EmbedError::ProviderTimeout {
                model: model.to_string(),
                timeout: self.config.request_timeout(),
            }
        } else {
            EmbedError::from(error)
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, texts: &[String], model: &str) -> Result<EmbeddingResult> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            embeddings.extend(self.embed_batch(batch, model).await?);
        }
        debug!("Embedded {} inputs with model {}", embeddings.len(), model);
        Ok(EmbeddingResult::new(model, embeddings))
    }

    fn provider_name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn provider_for(server: &MockServer) -> HttpEmbeddingProvider {
        HttpEmbeddingProvider::new(EmbedConfig::ollama(server.uri())).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = HttpEmbeddingProvider::new(EmbedConfig::default().with_batch_size(0)).unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
    }

    #[test]
    fn test_request_serialization() {
        let input = vec!["a".to_string(), "b".to_string()];
        let json = serde_json::to_value(EmbedRequest {
            model: "nomic-embed-text",
            input: &input,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"model": "nomic-embed-text", "input": ["a", "b"]})
        );
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_request() {
        // nothing listens on the discard port; an empty batch must not touch it
        let provider = HttpEmbeddingProvider::new(EmbedConfig::ollama("http://127.0.0.1:9")).unwrap();
        let result = provider.embed(&[], "nomic-embed-text").await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let provider = HttpEmbeddingProvider::new(
            EmbedConfig::ollama("http://127.0.0.1:9").with_timeout(Duration::from_secs(2)),
        )
        .unwrap();
        let err = provider
            .embed(&["hello".to_string()], "nomic-embed-text")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(provider.provider_name(), "http");
    }

    #[tokio::test]
    async fn test_successful_response_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_json(json!({"model": "m1", "input": ["a", "b"]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let result = provider.embed(&texts(&["a", "b"]), "m1").await.unwrap();
        assert_eq!(result.model, "m1");
        assert_eq!(result.embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_batches_are_split_and_authenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.5]]})))
            .expect(3)
            .mount(&server)
            .await;

        let provider = HttpEmbeddingProvider::new(
            EmbedConfig::ollama(server.uri())
                .with_batch_size(1)
                .with_api_key("secret"),
        )
        .unwrap();
        let result = provider.embed(&texts(&["a", "b", "c"]), "m1").await.unwrap();
        assert_eq!(result.len(), 3);
    }

    #[tokio::test]
    async fn test_error_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"error": "model not loaded"})),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider.embed(&texts(&["a"]), "m1").await.unwrap_err();
        match &err {
            EmbedError::ProviderError { message } => {
                assert!(message.contains("503"), "{message}");
                assert!(message.contains("model not loaded"), "{message}");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_wrong_vector_count_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0]]})))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider.embed(&texts(&["a", "b"]), "m1").await.unwrap_err();
        assert!(
            matches!(&err, EmbedError::ProviderError { message } if message.contains("expected 2 vectors, provider returned 1")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider.embed(&texts(&["a"]), "m1").await.unwrap_err();
        assert!(
            matches!(&err, EmbedError::ProviderError { message } if message.starts_with("failed to decode response")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_slow_server_is_provider_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embeddings": [[1.0]]}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let provider = HttpEmbeddingProvider::new(
            EmbedConfig::ollama(server.uri()).with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = provider.embed(&texts(&["a"]), "m1").await.unwrap_err();
        assert!(
            matches!(&err, EmbedError::ProviderTimeout { model, .. } if model == "m1"),
            "{err:?}"
        );
    }
}
