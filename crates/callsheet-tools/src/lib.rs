//! Typed tool registry.
//!
//! A closed set of idempotent read tools over the knowledge graph, each
//! carrying an input schema, an output envelope, and a policy annotation.
//! Agents never touch the graph directly; they hold a policy-filtered view
//! of this registry, and every tool output passes through RBAC redaction
//! before it leaves the registry.

pub mod args;
pub mod deals;
pub mod documents;
pub mod people;
pub mod projects;
pub mod registry;
pub mod vector_search;

use async_trait::async_trait;

use callsheet_core::error::Result;
use callsheet_core::message::{ToolDefinition, ToolResult};
use callsheet_core::principal::Principal;
use callsheet_core::rbac::ToolPolicy;

pub use registry::{ToolCallOutcome, ToolRegistry};
pub use vector_search::UniversalVectorSearch;

/// A single typed tool over the graph.
///
/// Implementations return raw results; the registry applies the policy's
/// field redaction at egress. All current tools are idempotent reads, which
/// the default reflects.
#[async_trait]
pub trait GraphTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema for the arguments object.
    fn parameters(&self) -> serde_json::Value;

    fn policy(&self) -> &ToolPolicy;

    fn idempotent(&self) -> bool {
        true
    }

    async fn call(&self, arguments: &serde_json::Value, principal: &Principal) -> Result<ToolResult>;
}

/// LLM-facing definition for a tool.
pub fn definition_of(tool: &dyn GraphTool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters(),
    }
}
