//! Agent profiles.
//!
//! Variants differ only in data: system prompt, permitted tool subset,
//! model preferences, and memory-type weights. Behavior lives in one
//! executor over these profiles.

use std::collections::HashMap;

use callsheet_core::message::AgentKind;
use callsheet_memory::MemoryType;

/// Relative weights applied to recalled memories by type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryWeights {
    pub semantic: f32,
    pub episodic: f32,
    pub procedural: f32,
}

impl MemoryWeights {
    pub fn weight_for(&self, memory_type: MemoryType) -> f32 {
        match memory_type {
            MemoryType::Semantic => self.semantic,
            MemoryType::Episodic => self.episodic,
            MemoryType::Procedural => self.procedural,
        }
    }
}

/// Static description of one agent variant.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub system_prompt: &'static str,
    /// Names into the tool registry; intersected with RBAC visibility.
    pub allowed_tools: &'static [&'static str],
    pub memory_weights: MemoryWeights,
    /// Memories injected into the prompt per turn.
    pub memory_top_k: usize,
}

const SALES_PROMPT: &str = "\
You are the sales intelligence agent for an entertainment-industry \
business hub. You help with clients, deals, pipelines, and pitch \
preparation. Ground every claim in tool results; say so when the graph \
has no answer. Never reveal redacted fields.";

const TALENT_PROMPT: &str = "\
You are the talent discovery agent for an entertainment-industry business \
hub. You help find directors, crew, writers, and creative collaborators, \
with their project history and availability signals. Ground every claim \
in tool results; say so when the graph has no answer. Never reveal \
redacted fields.";

const ANALYTICS_PROMPT: &str = "\
You are the analytics agent for an entertainment-industry business hub. \
You compare projects, track performance, and summarize trends across the \
knowledge graph. Be precise about what the data does and does not \
support. Never reveal redacted fields.";

const SALES_TOOLS: &[&str] = &[
    "get_organization_profile",
    "get_person_profile",
    "get_deal_details",
    "get_deal_sourcer",
    "find_people_at_organization",
    "search_documents_full_text",
    "universal_vector_search",
];

const TALENT_TOOLS: &[&str] = &[
    "get_person_profile",
    "get_project_details",
    "find_contributors_on_client_projects",
    "find_people_at_organization",
    "find_projects_by_concept",
    "universal_vector_search",
];

const ANALYTICS_TOOLS: &[&str] = &[
    "get_project_details",
    "get_organization_profile",
    "get_deal_details",
    "find_projects_by_concept",
    "search_documents_full_text",
    "universal_vector_search",
];

/// Profile table, one entry per agent kind.
pub fn profiles() -> HashMap<AgentKind, AgentProfile> {
    HashMap::from([
        (
            AgentKind::Sales,
            AgentProfile {
                kind: AgentKind::Sales,
                system_prompt: SALES_PROMPT,
                allowed_tools: SALES_TOOLS,
                memory_weights: MemoryWeights {
                    semantic: 1.0,
                    episodic: 0.8,
                    procedural: 0.4,
                },
                memory_top_k: 5,
            },
        ),
        (
            AgentKind::Talent,
            AgentProfile {
                kind: AgentKind::Talent,
                system_prompt: TALENT_PROMPT,
                allowed_tools: TALENT_TOOLS,
                memory_weights: MemoryWeights {
                    semantic: 1.0,
                    episodic: 0.6,
                    procedural: 0.6,
                },
                memory_top_k: 5,
            },
        ),
        (
            AgentKind::Analytics,
            AgentProfile {
                kind: AgentKind::Analytics,
                system_prompt: ANALYTICS_PROMPT,
                allowed_tools: ANALYTICS_TOOLS,
                memory_weights: MemoryWeights {
                    semantic: 0.9,
                    episodic: 0.5,
                    procedural: 1.0,
                },
                memory_top_k: 3,
            },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_agent_kind_has_a_profile() {
        let table = profiles();
        for kind in [AgentKind::Sales, AgentKind::Talent, AgentKind::Analytics] {
            let profile = table.get(&kind).expect("profile present");
            assert_eq!(profile.kind, kind);
            assert!(!profile.system_prompt.is_empty());
            assert!(!profile.allowed_tools.is_empty());
            assert!(profile.memory_top_k > 0);
        }
    }

    #[test]
    fn tool_subsets_differ_by_agent() {
        let table = profiles();
        assert!(table[&AgentKind::Sales].allowed_tools.contains(&"get_deal_details"));
        assert!(!table[&AgentKind::Talent].allowed_tools.contains(&"get_deal_details"));
        assert!(table[&AgentKind::Talent].allowed_tools.contains(&"find_contributors_on_client_projects"));
        // every agent can reach semantic search
        for profile in table.values() {
            assert!(profile.allowed_tools.contains(&"universal_vector_search"));
        }
    }

    #[test]
    fn memory_weights_resolve_by_type() {
        let weights = profiles()[&AgentKind::Analytics].memory_weights;
        assert_eq!(weights.weight_for(MemoryType::Procedural), 1.0);
        assert!(weights.weight_for(MemoryType::Episodic) < 1.0);
    }
}
