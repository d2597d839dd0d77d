//! Serde types for the OpenAI-compatible chat-completions wire protocol.
//!
//! Both providers speak this protocol; only base URL, credentials, and model
//! catalog differ.

use serde::{Deserialize, Serialize};

use callsheet_core::error::{Error, Result};
use callsheet_core::message::{ChatMessage, TokenUsage, ToolCall, ToolDefinition};

use crate::{ChatResponse, CompletionRequest};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireTool {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    pub function: WireToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCallFunction {
    pub name: String,
    /// Arguments arrive as a JSON-encoded string.
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireResponse {
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// One SSE chunk of a streaming response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireStreamChunk {
    #[serde(default)]
    pub choices: Vec<WireStreamChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireStreamChoice {
    pub delta: WireStreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireStreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireStreamToolCall {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<WireStreamToolCallFunction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireStreamToolCallFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

pub(crate) fn to_wire_message(message: &ChatMessage) -> WireMessage {
    WireMessage {
        role: message.role.as_str().to_string(),
        content: Some(message.content.clone()),
        tool_calls: if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: Some("function".to_string()),
                        function: WireToolCallFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        },
        tool_call_id: message.tool_call_id.clone(),
    }
}

pub(crate) fn to_wire_request(request: &CompletionRequest, stream: bool) -> WireRequest {
    WireRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(to_wire_message).collect(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        tools: request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| WireTool {
                    tool_type: "function",
                    function: WireFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect()
        }),
        stream: stream.then_some(true),
        stream_options: stream.then_some(StreamOptions { include_usage: true }),
    }
}

/// Parse the argument string of a tool call; a malformed payload is wrapped
/// rather than dropped so the agent loop can surface it to the model.
pub(crate) fn parse_tool_call(call: WireToolCall) -> ToolCall {
    let arguments = if call.function.arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
            serde_json::json!({
                "error": format!("failed to parse tool arguments: {e}"),
                "raw": call.function.arguments,
            })
        })
    };
    ToolCall {
        id: call.id,
        name: call.function.name,
        arguments,
    }
}

pub(crate) fn from_wire_response(response: WireResponse, provider: &str) -> Result<ChatResponse> {
    let model = response.model;
    let usage = response.usage.map(TokenUsage::from).unwrap_or_default();
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::internal(format!("{provider}: response carried no choices")))?;

    let content = choice.message.content.unwrap_or_default();
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(parse_tool_call)
        .collect();

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model,
        provider: provider.to_string(),
        finish_reason: choice.finish_reason,
    })
}

/// Accumulates streamed tool-call fragments until the call is complete.
#[derive(Debug, Default)]
pub(crate) struct StreamToolCallAssembler {
    calls: Vec<(Option<String>, Option<String>, String)>,
}

impl StreamToolCallAssembler {
    pub(crate) fn absorb(&mut self, fragment: WireStreamToolCall) {
        while self.calls.len() <= fragment.index {
            self.calls.push((None, None, String::new()));
        }
        let slot = &mut self.calls[fragment.index];
        if let Some(id) = fragment.id {
            slot.0 = Some(id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                slot.1 = Some(name);
            }
            if let Some(arguments) = function.arguments {
                slot.2.push_str(&arguments);
            }
        }
    }

    /// Drain completed calls once the stream signals the end of tool input.
    pub(crate) fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .filter_map(|(id, name, arguments)| {
                let (id, name) = (id?, name?);
                Some(parse_tool_call(WireToolCall {
                    id,
                    call_type: None,
                    function: WireToolCallFunction { name, arguments },
                }))
            })
            .collect()
    }
}
