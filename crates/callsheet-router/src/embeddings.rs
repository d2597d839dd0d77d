//! Embeddings capability.
//!
//! The secondary provider is also the embeddings source; every consumer
//! (memory writes, vector tools) goes through this trait so the
//! dimensionality contract is enforced in one place.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use callsheet_core::config::{timeouts, ProviderConfig};
use callsheet_core::error::{Error, Result};

/// Fixed dimensionality for all embeddings in the system.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

#[async_trait]
pub trait Embeddings: Send + Sync {
    /// Embed a batch of texts, preserving order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }
}

/// Convenience for the common single-text case.
pub async fn embed_query(embeddings: &dyn Embeddings, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embeddings.embed(std::slice::from_ref(&text.to_string())).await?;
    vectors
        .pop()
        .ok_or_else(|| Error::internal("embeddings returned an empty batch"))
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Embeddings over the OpenAI `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbeddings {
    api_key: String,
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiEmbeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddings")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiEmbeddings {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: "text-embedding-3-small".to_string(),
            http_client: reqwest::Client::builder()
                .build()
                .map_err(|e| Error::internal(format!("http client: {e}")))?,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Embeddings for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .http_client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeouts::LLM_CALL)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout("embeddings", timeouts::LLM_CALL.as_millis() as u64)
                } else {
                    Error::connection(format!("embeddings: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 {
                Error::rate_limited(format!("embeddings ({status})"))
            } else if status.is_server_error() {
                Error::connection(format!("embeddings ({status})"))
            } else {
                Error::internal(format!("embeddings ({status}): {body}"))
            });
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::internal(format!("embeddings: malformed response: {e}")))?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        if data.len() != texts.len() {
            return Err(Error::internal(format!(
                "embeddings: {} inputs produced {} vectors",
                texts.len(),
                data.len()
            )));
        }

        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            if vector.len() != EMBEDDING_DIMENSIONS {
                return Err(Error::data_integrity(format!(
                    "embedding has {} dimensions, expected {EMBEDDING_DIMENSIONS}",
                    vector.len()
                )));
            }
        }
        Ok(vectors)
    }
}
