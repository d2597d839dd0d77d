//! Websocket frame protocol.
//!
//! One JSON document per text frame, tagged by `type`. Every outbound frame
//! carries a per-session `seq` assigned by the single writer task, so `seq`
//! is strictly increasing and contiguous within an assistant turn.

use serde::{Deserialize, Serialize};

use callsheet_core::message::{TokenUsage, ToolCall};

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Auth {
        token: String,
    },
    UserMessage {
        #[serde(default)]
        conversation_id: Option<String>,
        content: String,
        #[serde(default)]
        agent_preference: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    Cancel {
        conversation_id: String,
    },
    Ping,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("malformed frame: {e}"))
    }
}

/// Server-to-client frames, before the writer assigns `seq`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    AuthSuccess {
        data: AuthData,
    },
    AssistantDelta {
        conversation_id: String,
        data: DeltaData,
    },
    AssistantFinal {
        conversation_id: String,
        data: FinalData,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Pong,
    Status {
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthData {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaData {
    pub content_chunk: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalData {
    pub content: String,
    pub agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// The wire shape: an outbound frame plus its session sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct SequencedFrame {
    #[serde(flatten)]
    pub frame: OutboundFrame,
    pub seq: u64,
}

impl SequencedFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"type\":\"error\",\"code\":\"internal\",\"message\":\"frame serialize: {e}\",\"seq\":{}}}", self.seq)
        })
    }
}
