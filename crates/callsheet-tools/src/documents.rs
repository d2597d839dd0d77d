//! Document search.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use callsheet_core::error::Result;
use callsheet_core::message::ToolResult;
use callsheet_core::principal::Principal;
use callsheet_core::rbac::{SensitivityPolicy, ToolPolicy};
use callsheet_graph::{CypherQuery, GraphStore, DOCUMENT_FULLTEXT_INDEX};

use crate::args::required_str;
use crate::GraphTool;

/// `search_documents_full_text` - full-text search over titles and bodies.
pub struct SearchDocumentsFullText {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl SearchDocumentsFullText {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:documents")
                .with_sensitivity(SensitivityPolicy::new().field("content", 3)),
        }
    }
}

#[async_trait]
impl GraphTool for SearchDocumentsFullText {
    fn name(&self) -> &'static str {
        "search_documents_full_text"
    }

    fn description(&self) -> &'static str {
        "Full-text search across document titles and contents; returns scored matches."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search terms"}
            },
            "required": ["query"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let search = required_str(arguments, "query")?;

        let query = CypherQuery::read(format!(
            "CALL db.index.fulltext.queryNodes('{DOCUMENT_FULLTEXT_INDEX}', $query) \
             YIELD node, score \
             RETURN node {{.id, .title, .documentType, .content}} AS document, score \
             ORDER BY score DESC LIMIT 20"
        ))
        .param("query", search.clone())
        .returning(["document", "score"]);

        let rows = self.graph.run(query).await?;
        let documents: Vec<Value> = rows
            .into_iter()
            .map(|mut row| {
                json!({
                    "document": row.remove("document").unwrap_or(Value::Null),
                    "score": row.remove("score").unwrap_or(Value::Null),
                })
            })
            .collect();

        let found = !documents.is_empty();
        Ok(ToolResult::ok(
            self.name(),
            found,
            json!({"query": search, "documents": documents}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_core::principal::Role;
    use callsheet_graph::test_support::FakeGraph;
    use callsheet_graph::JsonRow;

    #[tokio::test]
    async fn search_returns_scored_documents() {
        let graph = Arc::new(FakeGraph::new());
        let mut row = JsonRow::new();
        row.insert(
            "document".to_string(),
            json!({"id": "doc1", "title": "Boost Mobile Treatment", "documentType": "Treatment"}),
        );
        row.insert("score".to_string(), json!(2.4));
        graph.respond("db.index.fulltext.queryNodes", vec![row]);

        let tool = SearchDocumentsFullText::new(graph);
        let principal = Principal::new("u1", Role::CreativeDirector, 1).unwrap();
        let result = tool
            .call(&json!({"query": "boost mobile treatment"}), &principal)
            .await
            .unwrap();

        assert!(result.found);
        let data = result.data.unwrap();
        assert_eq!(data["documents"][0]["document"]["id"], "doc1");
        assert_eq!(data["documents"][0]["score"], 2.4);
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let graph = Arc::new(FakeGraph::new());
        let tool = SearchDocumentsFullText::new(graph);
        let principal = Principal::new("u1", Role::CreativeDirector, 1).unwrap();
        assert!(tool.call(&json!({"query": "  "}), &principal).await.is_err());
    }
}
