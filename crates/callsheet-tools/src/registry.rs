//! The registry: policy filtering, bounded fan-out, egress redaction.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, warn};

use callsheet_core::config::timeouts;
use callsheet_core::error::{Error, Result};
use callsheet_core::message::{ToolCall, ToolDefinition, ToolResult};
use callsheet_core::principal::Principal;
use callsheet_core::rbac::PermissionGate;
use callsheet_graph::GraphStore;
use callsheet_router::Embeddings;

use crate::deals::{GetDealDetails, GetDealSourcer};
use crate::documents::SearchDocumentsFullText;
use crate::people::{FindPeopleAtOrganization, GetOrganizationProfile, GetPersonProfile};
use crate::projects::{
    FindContributorsOnClientProjects, FindProjectsByConcept, GetProjectDetails,
};
use crate::vector_search::UniversalVectorSearch;
use crate::{definition_of, GraphTool};

/// Parallel tool invocations per agent step.
pub const TOOL_FANOUT: usize = 4;

/// One completed invocation from [`ToolRegistry::call_many`].
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub call: ToolCall,
    pub result: ToolResult,
}

/// The closed tool set, with the RBAC gate at its egress.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn GraphTool>>,
    gate: PermissionGate,
    tool_timeout: Duration,
}

impl ToolRegistry {
    /// Registry over an explicit tool list (tests compose small ones).
    pub fn new(tools: Vec<Arc<dyn GraphTool>>, gate: PermissionGate) -> Self {
        Self {
            tools,
            gate,
            tool_timeout: timeouts::TOOL_CALL,
        }
    }

    /// The full canonical tool set.
    pub fn standard(
        graph: Arc<dyn GraphStore>,
        embeddings: Arc<dyn Embeddings>,
        gate: PermissionGate,
    ) -> Self {
        let tools: Vec<Arc<dyn GraphTool>> = vec![
            Arc::new(GetPersonProfile::new(Arc::clone(&graph))),
            Arc::new(GetOrganizationProfile::new(Arc::clone(&graph))),
            Arc::new(GetProjectDetails::new(Arc::clone(&graph))),
            Arc::new(FindPeopleAtOrganization::new(Arc::clone(&graph))),
            Arc::new(FindProjectsByConcept::new(Arc::clone(&graph))),
            Arc::new(FindContributorsOnClientProjects::new(Arc::clone(&graph))),
            Arc::new(GetDealDetails::new(Arc::clone(&graph))),
            Arc::new(GetDealSourcer::new(Arc::clone(&graph))),
            Arc::new(SearchDocumentsFullText::new(Arc::clone(&graph))),
            Arc::new(UniversalVectorSearch::new(graph, embeddings)),
        ];
        Self::new(tools, gate)
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    fn find(&self, name: &str) -> Option<Arc<dyn GraphTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Tools this principal may invoke.
    pub async fn visible_for(&self, principal: &Principal) -> Vec<Arc<dyn GraphTool>> {
        let mut visible = Vec::new();
        for tool in &self.tools {
            if self.gate.permits_tool(principal, tool.policy()).await {
                visible.push(Arc::clone(tool));
            }
        }
        visible
    }

    /// LLM-facing definitions for the visible subset, optionally narrowed to
    /// an agent's permitted tool names.
    pub async fn definitions_for(
        &self,
        principal: &Principal,
        allowed_names: Option<&[&str]>,
    ) -> Vec<ToolDefinition> {
        self.visible_for(principal)
            .await
            .iter()
            .filter(|tool| {
                allowed_names.map_or(true, |names| names.contains(&tool.name()))
            })
            .map(|tool| definition_of(tool.as_ref()))
            .collect()
    }

    /// Invoke one tool. Authorization failures are errors (audited by the
    /// caller); execution failures come back as an error envelope so the
    /// agent loop can show the model what went wrong.
    pub async fn call(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        principal: &Principal,
    ) -> Result<ToolResult> {
        let Some(tool) = self.find(name) else {
            return Ok(ToolResult::error(name, "unknown tool"));
        };

        if !self.gate.permits_tool(principal, tool.policy()).await {
            return Err(Error::forbidden(format!(
                "{} may not call {name}",
                principal.id
            )));
        }

        let outcome = tokio::time::timeout(self.tool_timeout, tool.call(arguments, principal)).await;
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
            Ok(Err(err)) => {
                warn!(tool = name, error = %err, "tool failed");
                ToolResult::error(name, err.user_message())
            }
            Err(_) => {
                warn!(tool = name, timeout_ms = self.tool_timeout.as_millis() as u64, "tool timed out");
                ToolResult::error(name, "tool timed out")
            }
        };

        // field-level masking at egress, always
        if let Some(data) = result.data.as_mut() {
            self.gate.redact(data, tool.policy(), principal);
        }
        debug!(tool = name, found = result.found, status = %result.status, "tool call complete");
        Ok(result)
    }

    /// Invoke a batch with bounded parallelism, preserving order. Individual
    /// failures become error envelopes; only authorization failures and
    /// cancellation abort the batch.
    pub async fn call_many(
        &self,
        calls: &[ToolCall],
        principal: &Principal,
    ) -> Result<Vec<ToolCallOutcome>> {
        let outcomes: Vec<Result<ToolCallOutcome>> = futures::stream::iter(calls.iter().cloned())
            .map(|call| async move {
                let result = self.call(&call.name, &call.arguments, principal).await?;
                Ok(ToolCallOutcome { call, result })
            })
            .buffered(TOOL_FANOUT)
            .collect()
            .await;

        outcomes.into_iter().collect()
    }
}
