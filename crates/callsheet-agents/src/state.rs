//! Serializable agent-graph state.
//!
//! Everything a step needs to continue from is in [`AgentState`], including
//! recorded provider output, so replaying checkpoints 0..k reproduces the
//! run without re-invoking the provider.

use serde::{Deserialize, Serialize};

use callsheet_core::message::{AgentKind, ChatMessage, TokenUsage, ToolCall};
use callsheet_memory::MemoryRecall;

/// Decision taken by the classify node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPlan {
    DirectAnswer,
    ToolAugmented,
    Clarify,
}

/// Provider output recorded for deterministic replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedLlmCall {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// The node sequence; the executor advances through these in order, with a
/// bounded tool loop between `RouteTools` and `CallLlm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentNode {
    Initialize,
    LoadMemory,
    Classify,
    RouteTools,
    CallLlm,
    Respond,
    Persist,
}

/// Complete per-turn agent state, checkpointed after every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub conversation_id: String,
    pub user_id: String,
    pub agent: AgentKind,
    pub node: AgentNode,
    pub step: u32,
    /// Message list as sent to the provider, system prompt included.
    pub messages: Vec<ChatMessage>,
    pub memories: Vec<MemoryRecall>,
    pub plan: Option<TurnPlan>,
    /// Completed `(route_tools -> call_llm)` rounds this turn.
    pub tool_rounds: u32,
    /// Tool calls the last LLM output requested and we have not executed.
    pub pending_tool_calls: Vec<ToolCall>,
    /// Every tool call executed this turn, for the final frame.
    pub executed_tool_calls: Vec<ToolCall>,
    /// Recorded provider outputs, one per `CallLlm` visit.
    pub llm_calls: Vec<RecordedLlmCall>,
    pub usage: TokenUsage,
    pub final_text: Option<String>,
    pub cancelled: bool,
    /// False for multi-agent fan-out runs, which neither checkpoint nor
    /// persist.
    pub record: bool,
}

impl AgentState {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        agent: AgentKind,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            agent,
            node: AgentNode::Initialize,
            step: 0,
            messages: Vec::new(),
            memories: Vec::new(),
            plan: None,
            tool_rounds: 0,
            pending_tool_calls: Vec::new(),
            executed_tool_calls: Vec::new(),
            llm_calls: Vec::new(),
            usage: TokenUsage::default(),
            final_text: None,
            cancelled: false,
            record: true,
        }
    }

    pub fn last_llm_call(&self) -> Option<&RecordedLlmCall> {
        self.llm_calls.last()
    }

    pub fn provider(&self) -> Option<&str> {
        self.last_llm_call().map(|call| call.provider.as_str())
    }

    pub fn model(&self) -> Option<&str> {
        self.last_llm_call().map(|call| call.model.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_with_tool_arguments_intact() {
        let mut state = AgentState::new("c1", "u1", AgentKind::Talent);
        state.messages.push(ChatMessage::user("find me a director"));
        state.plan = Some(TurnPlan::ToolAugmented);
        state.llm_calls.push(RecordedLlmCall {
            content: "checking".to_string(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "get_person_profile".to_string(),
                arguments: serde_json::json!({"name": "Jane Doe", "nested": {"k": [1, 2]}}),
            }],
            provider: "together".to_string(),
            model: "llama".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        });

        let bytes = serde_json::to_vec(&state).unwrap();
        let back: AgentState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn provider_attribution_follows_last_call() {
        let mut state = AgentState::new("c1", "u1", AgentKind::Sales);
        assert_eq!(state.provider(), None);

        state.llm_calls.push(RecordedLlmCall {
            provider: "together".to_string(),
            model: "llama".to_string(),
            ..Default::default()
        });
        state.llm_calls.push(RecordedLlmCall {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            ..Default::default()
        });
        assert_eq!(state.provider(), Some("openai"));
        assert_eq!(state.model(), Some("gpt-4o"));
    }
}
