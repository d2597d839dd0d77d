//! Deterministic query-complexity heuristic.

use serde::{Deserialize, Serialize};

use callsheet_core::message::{AgentKind, ChatMessage, MessageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryComplexity {
    Simple,
    Moderate,
    Complex,
}

impl QueryComplexity {
    fn from_score(score: u32) -> Self {
        match score {
            0 => QueryComplexity::Simple,
            1 => QueryComplexity::Moderate,
            _ => QueryComplexity::Complex,
        }
    }
}

/// Characters of conversational content below which a query counts as short.
const SHORT_CONTENT_CHARS: usize = 240;
/// Above this, the conversation alone makes the query complex.
const LONG_CONTENT_CHARS: usize = 1200;

/// Estimate complexity from the message list, agent type, and tool
/// availability. An explicit hint short-circuits the heuristic. The result
/// is a pure function of its inputs.
pub fn estimate_complexity(
    messages: &[ChatMessage],
    hint: Option<QueryComplexity>,
    agent: AgentKind,
    has_tools: bool,
) -> QueryComplexity {
    if let Some(hint) = hint {
        return hint;
    }

    let content_chars: usize = messages
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .map(|m| m.content.chars().count())
        .sum();

    let mut score = 0u32;
    if content_chars >= SHORT_CONTENT_CHARS {
        score += 1;
    }
    if content_chars >= LONG_CONTENT_CHARS {
        score += 1;
    }
    if has_tools {
        score += 1;
    }
    // analytics queries lean on aggregation and comparison; budget a
    // stronger model earlier
    if agent == AgentKind::Analytics {
        score += 1;
    }

    QueryComplexity::from_score(score.min(2))
}
