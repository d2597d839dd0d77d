//! Turn and message model.
//!
//! [`ChatMessage`] is the in-flight shape handed to LLM providers;
//! [`Turn`] is the persisted conversation record. The two overlap but are
//! kept separate so that persistence concerns (timestamps, usage, provider
//! attribution, status) never leak into provider request bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The specialist agents the orchestrator can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Sales,
    Talent,
    Analytics,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Sales => "sales",
            AgentKind::Talent => "talent",
            AgentKind::Analytics => "analytics",
        }
    }

    /// Parse a caller-supplied preference. Unknown values are rejected so
    /// typos do not silently land on the default agent.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sales" => Some(AgentKind::Sales),
            "talent" => Some(AgentKind::Talent),
            "analytics" => Some(AgentKind::Analytics),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message/turn author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// Declaration of a callable tool, as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// A structured tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool result message.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Arguments as parsed JSON.
    pub arguments: serde_json::Value,
}

/// Result envelope returned to the model after a tool invocation.
///
/// Serialized to a JSON string and embedded into the next request as a
/// tool-role message, so the shape here is part of the LLM-facing surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    /// "ok" or "error".
    pub status: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(name: impl Into<String>, found: bool, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            status: "ok".to_string(),
            found,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "error".to_string(),
            found: false,
            data: None,
            error: Some(summary.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Token accounting for a single completed LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// In-flight message handed to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    /// Tool invocations attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Links a tool-role message back to the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, result: &ToolResult) -> Self {
        Self {
            role: MessageRole::Tool,
            // Unserializable results would be a bug in ToolResult itself;
            // fall back to an inline error envelope rather than panicking.
            content: serde_json::to_string(result).unwrap_or_else(|e| {
                format!("{{\"name\":\"{}\",\"status\":\"error\",\"found\":false,\"error\":\"serialize: {e}\"}}", result.name)
            }),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Terminal status of a persisted assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Complete,
    Cancelled,
    Error,
}

/// One persisted conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default = "TurnStatus::complete")]
    pub status: TurnStatus,
}

impl TurnStatus {
    fn complete() -> Self {
        TurnStatus::Complete
    }
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            usage: None,
            tool_calls: Vec::new(),
            provider: None,
            status: TurnStatus::Complete,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            usage: None,
            tool_calls: Vec::new(),
            provider: None,
            status: TurnStatus::Complete,
        }
    }
}

/// A conversation: ordered turns plus routing metadata.
///
/// Conversations are created by their first turn, mutated only through the
/// owning user's session, and archived (never destroyed) after inactivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_affinity: Option<AgentKind>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Set when the conversation is archived for inactivity. Archived
    /// conversations are retained, never destroyed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            agent_affinity: None,
            turns: Vec::new(),
            summary: None,
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Append a turn, enforcing strictly monotonic timestamps.
    ///
    /// Clock skew between hosts can hand us an equal-or-earlier timestamp;
    /// nudge it forward rather than violating the ordering invariant.
    pub fn push_turn(&mut self, mut turn: Turn) {
        if let Some(last) = self.turns.last() {
            if turn.timestamp <= last.timestamp {
                turn.timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }
        self.turns.push(turn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_parse_rejects_unknown() {
        assert_eq!(AgentKind::parse("sales"), Some(AgentKind::Sales));
        assert_eq!(AgentKind::parse("talent"), Some(AgentKind::Talent));
        assert_eq!(AgentKind::parse("analytics"), Some(AgentKind::Analytics));
        assert_eq!(AgentKind::parse("Sales"), None);
        assert_eq!(AgentKind::parse(""), None);
    }

    #[test]
    fn tool_result_serializes_as_envelope() {
        let result = ToolResult::ok("get_person_profile", true, serde_json::json!({"name": "Jane"}));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["found"], true);
        assert_eq!(json["data"]["name"], "Jane");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn tool_message_embeds_result_json() {
        let result = ToolResult::error("get_deal_details", "graph unavailable");
        let msg = ChatMessage::tool("call_1", &result);
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        let parsed: ToolResult = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn push_turn_keeps_timestamps_strictly_increasing() {
        let mut conv = Conversation::new("c1", "u1");
        let t = Turn::user("first");
        let stamp = t.timestamp;
        conv.push_turn(t);

        let mut second = Turn::assistant("second");
        second.timestamp = stamp; // simulate clock skew
        conv.push_turn(second);

        assert!(conv.turns[1].timestamp > conv.turns[0].timestamp);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.add(&TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        });
        assert_eq!(total.total_tokens, 20);
        assert_eq!(total.prompt_tokens, 13);
    }

    #[test]
    fn turn_round_trips_through_json() {
        let mut turn = Turn::assistant("done");
        turn.provider = Some("together".to_string());
        turn.usage = Some(TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        });
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }
}
