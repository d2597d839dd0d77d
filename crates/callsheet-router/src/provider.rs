//! Provider client for the OpenAI-compatible chat-completions protocol.
//!
//! The primary ("together") and secondary ("openai") providers are both
//! instances of this client with different base URLs, credentials, and model
//! catalogs.

use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::StatusCode;
use tracing::{debug, warn};

use callsheet_core::config::{timeouts, ProviderConfig};
use callsheet_core::error::{Error, Result};

use crate::usage::estimate_cost;
use crate::wire::{
    from_wire_response, to_wire_request, StreamToolCallAssembler, WireResponse, WireStreamChunk,
};
use crate::{ChatProvider, ChatResponse, CompletionRequest, DeltaStream, StreamDelta, StreamFinal};

/// Truncation bound for provider error bodies captured into error messages.
const MAX_ERROR_BODY: usize = 200;

#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    name: String,
    api_key: String,
    base_url: String,
    http_client: reqwest::Client,
}

// Custom Debug to keep the API key out of logs.
impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("name", &self.name)
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::internal(format!("http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn map_http_error(&self, status: StatusCode, body: &str) -> Error {
        let mut message = body.trim().to_string();
        if message.len() > MAX_ERROR_BODY {
            message.truncate(MAX_ERROR_BODY);
            message.push('…');
        }
        let message = format!("{} ({status}): {message}", self.name);

        match status {
            StatusCode::TOO_MANY_REQUESTS => Error::rate_limited(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::unauthorized(message),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::PAYLOAD_TOO_LARGE => {
                Error::validation(message)
            }
            _ if status.is_server_error() => Error::connection(message),
            _ => Error::internal(message),
        }
    }

    fn map_transport_error(&self, err: &reqwest::Error, operation: &str, timeout_ms: u64) -> Error {
        if err.is_timeout() {
            Error::timeout(format!("{} {operation}", self.name), timeout_ms)
        } else {
            Error::connection(format!("{} {operation}: {err}", self.name))
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ChatResponse> {
        let body = to_wire_request(request, false);
        let response = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(timeouts::LLM_CALL)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.map_transport_error(&e, "completion", timeouts::LLM_CALL.as_millis() as u64)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status, &body));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| Error::internal(format!("{}: malformed response: {e}", self.name)))?;
        from_wire_response(wire, &self.name)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream> {
        let body = to_wire_request(request, true);
        let response = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(timeouts::LLM_STREAM)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.map_transport_error(&e, "stream", timeouts::LLM_STREAM.as_millis() as u64)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status, &body));
        }

        let provider = self.name.clone();
        let model = request.model.clone();
        let mut events = response.bytes_stream().eventsource();

        let stream = try_stream! {
            let mut assembler = StreamToolCallAssembler::default();
            let mut usage = callsheet_core::message::TokenUsage::default();

            while let Some(event) = events.next().await {
                let event = event.map_err(|e| {
                    Error::connection(format!("{provider} stream: {e}"))
                })?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let chunk: WireStreamChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "skipping malformed stream chunk");
                        continue;
                    }
                };

                if let Some(chunk_usage) = chunk.usage {
                    usage = chunk_usage.into();
                }

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield StreamDelta::Content(content);
                        }
                    }
                    if let Some(fragments) = choice.delta.tool_calls {
                        for fragment in fragments {
                            assembler.absorb(fragment);
                        }
                    }
                    if choice.finish_reason.as_deref() == Some("tool_calls") {
                        for call in assembler.finish() {
                            yield StreamDelta::ToolCall(call);
                        }
                    }
                }
            }

            // tool calls left unflushed by a provider that omits the
            // finish_reason on the last chunk
            for call in assembler.finish() {
                yield StreamDelta::ToolCall(call);
            }

            let cost_estimate = estimate_cost(&model, &usage);
            debug!(provider = %provider, model = %model, total_tokens = usage.total_tokens, "stream complete");
            yield StreamDelta::Final(StreamFinal {
                usage,
                cost_estimate,
                provider: provider.clone(),
                model: model.clone(),
            });
        };

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> bool {
        let result = self
            .http_client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeouts::HEALTH_PROBE)
            .send()
            .await;
        matches!(result, Ok(response) if response.status().is_success())
    }
}
