//! Client for OpenAI-compatible embedding endpoints (`POST /v1/embeddings`).
//!
//! Retries on 429 and 5xx with exponential backoff. Every failure is reported as
//! `EmbedderError::Unavailable`; callers decide whether that is a soft warning
//! (ingestion) or a retryable 503 (search).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Embedder, EmbedderError};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: String, api_key: Option<String>, dimension: usize) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            endpoint: embeddings_endpoint(base_url),
            model,
            api_key,
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let request_body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };

        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // 1s, 2s
                let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Embedding attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.endpoint).json(&request_body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Embedding endpoint returned {}: {}", status, body);
                last_error = format!("status {status}: {body}");
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbedderError::Unavailable(format!(
                    "status {status}: {body}"
                )));
            }

            let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                EmbedderError::Unavailable(format!("malformed embedding response: {e}"))
            })?;

            let embedding = parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| EmbedderError::Unavailable("empty embedding response".into()))?;

            if embedding.len() != self.dimension {
                return Err(EmbedderError::Dimension {
                    expected: self.dimension,
                    got: embedding.len(),
                });
            }

            debug!(dimension = embedding.len(), "Embedding received");
            return Ok(embedding);
        }

        Err(EmbedderError::Unavailable(format!(
            "giving up after {MAX_RETRIES} attempts: {last_error}"
        )))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn embeddings_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/embeddings")
    } else {
        format!("{base}/v1/embeddings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_bare_host() {
        assert_eq!(
            embeddings_endpoint("http://localhost:1234"),
            "http://localhost:1234/v1/embeddings"
        );
    }

    #[test]
    fn test_endpoint_trailing_slash_and_v1() {
        assert_eq!(
            embeddings_endpoint("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/embeddings"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        tokio::time::pause();
        let embedder = HttpEmbedder::new("http://127.0.0.1:9", "test".into(), None, 8);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbedderError::Unavailable(_)));
    }
}
