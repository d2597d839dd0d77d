//! LLM provider router.
//!
//! Given a message list, an agent type, and a principal, the router picks a
//! provider and model under the sensitivity, complexity, and health rules,
//! executes the call (optionally streaming), accounts for usage and cost,
//! and falls back across providers on transient failure.

pub mod complexity;
pub mod embeddings;
pub mod provider;
pub mod router;
pub mod test_support;
pub mod usage;
mod wire;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use callsheet_core::error::Result;
use callsheet_core::message::{ChatMessage, TokenUsage, ToolCall, ToolDefinition};

pub use complexity::QueryComplexity;
pub use embeddings::{Embeddings, OpenAiEmbeddings};
pub use provider::OpenAiCompatibleProvider;
pub use router::{LlmRouter, ModelPreferences, RouteRequest};
pub use usage::{ProviderUsage, UsageTracker};

/// Request handed to a single provider after routing decided model and
/// parameters.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<ToolDefinition>>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            tools: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self
    }
}

/// A completed (non-streaming) chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub model: String,
    /// Which provider actually served the call; filled in by the router.
    pub provider: String,
    pub finish_reason: Option<String>,
}

/// Trailer carried by the final element of a delta stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFinal {
    pub usage: TokenUsage,
    pub cost_estimate: f64,
    pub provider: String,
    pub model: String,
}

/// One element of a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A chunk of assistant text.
    Content(String),
    /// A complete tool call assembled from streamed fragments.
    ToolCall(ToolCall),
    /// Terminal element; nothing follows it.
    Final(StreamFinal),
}

/// Lazy, cancellable sequence of deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// One LLM provider: chat completion, streaming, and a health probe.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<ChatResponse>;

    /// Start a streaming completion. Dropping the returned stream cancels
    /// the underlying connection; no deltas are produced after a drop.
    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream>;

    /// Cheap liveness probe under a strict timeout.
    async fn health(&self) -> bool;
}
