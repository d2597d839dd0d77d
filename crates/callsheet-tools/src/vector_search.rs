//! Cross-kind semantic search.
//!
//! One query embedding fans out to the per-kind vector indexes in parallel,
//! RBAC redaction is applied to each record before grouping, and a failed
//! kind degrades to a per-group error marker instead of failing the call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use callsheet_core::error::{Error, Result};
use callsheet_core::message::ToolResult;
use callsheet_core::principal::Principal;
use callsheet_core::rbac::{SensitivityPolicy, ToolPolicy};
use callsheet_graph::{GraphStore, VectorHit};
use callsheet_router::Embeddings;

use crate::args::{optional_f64, optional_usize, required_str};
use crate::GraphTool;

/// Result groups, in output order, with their backing indexes.
const KIND_INDEXES: [(&str, &str); 4] = [
    ("people", "person_bio_vector"),
    ("projects", "project_profile_vector"),
    ("organizations", "organization_profile_vector"),
    ("documents", "document_content_vector"),
];

const DEFAULT_K: usize = 10;
const MAX_K: usize = 50;
const DEFAULT_MIN_SCORE: f64 = 0.5;

/// Fields masked across every kind; redaction is field-driven, so one
/// combined policy covers all four groups.
fn combined_sensitivity() -> SensitivityPolicy {
    SensitivityPolicy::new()
        .field("email", 2)
        .field("unionStatus", 3)
        .field("budget", 4)
        .field("value", 4)
        .field("probability", 4)
        .field("content", 3)
        .field("tier", 3)
}

/// `universal_vector_search` - grouped semantic search across people,
/// projects, organizations, and documents.
pub struct UniversalVectorSearch {
    graph: Arc<dyn GraphStore>,
    embeddings: Arc<dyn Embeddings>,
    policy: ToolPolicy,
}

impl UniversalVectorSearch {
    pub fn new(graph: Arc<dyn GraphStore>, embeddings: Arc<dyn Embeddings>) -> Self {
        Self {
            graph,
            embeddings,
            policy: ToolPolicy::open("read:projects").with_sensitivity(combined_sensitivity()),
        }
    }

    fn rank_and_cap(hits: Vec<VectorHit>, k: usize) -> Vec<Value> {
        let mut records: Vec<(f64, String, Value)> = hits
            .into_iter()
            .map(|hit| {
                let id = hit.node["id"].as_str().unwrap_or_default().to_string();
                let mut record = hit.node;
                if let Some(object) = record.as_object_mut() {
                    object.insert("score".to_string(), json!(hit.score));
                }
                (hit.score, id, record)
            })
            .collect();

        // score desc, then id asc so equal scores order deterministically
        records.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        records.truncate(k);
        records.into_iter().map(|(_, _, record)| record).collect()
    }
}

#[async_trait]
impl GraphTool for UniversalVectorSearch {
    fn name(&self) -> &'static str {
        "universal_vector_search"
    }

    fn description(&self) -> &'static str {
        "Semantic search across people, projects, organizations, and documents; returns scored groups per kind."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query_text": {"type": "string", "description": "Natural-language query (min 2 characters)"},
                "k": {"type": "integer", "description": "Max results per kind (default 10)"},
                "min_score": {"type": "number", "description": "Similarity floor in [0,1] (default 0.5)"}
            },
            "required": ["query_text"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, principal: &Principal) -> Result<ToolResult> {
        let query_text = required_str(arguments, "query_text")?;
        if query_text.trim().chars().count() < 2 {
            return Err(Error::validation(
                "query_text must be at least 2 characters",
            ));
        }
        let k = optional_usize(arguments, "k", DEFAULT_K)?.min(MAX_K);
        let min_score = optional_f64(arguments, "min_score", DEFAULT_MIN_SCORE)?;

        // one embedding for all four kind queries
        let vector = callsheet_router::embeddings::embed_query(
            self.embeddings.as_ref(),
            query_text.trim(),
        )
        .await?;

        // per-kind queries in parallel; the fan-out is the fixed kind set
        let searches = KIND_INDEXES.map(|(kind, index)| {
            let graph = Arc::clone(&self.graph);
            let vector = vector.clone();
            async move { (kind, graph.vector_search(index, &vector, k, min_score).await) }
        });
        let outcomes = futures::future::join_all(searches).await;

        let sensitivity = combined_sensitivity();
        let mut groups = serde_json::Map::new();
        let mut total_results = 0usize;
        let mut errors = 0usize;
        let mut first_error: Option<Error> = None;

        for (kind, outcome) in outcomes {
            match outcome {
                Ok(hits) => {
                    let mut records = Self::rank_and_cap(hits, k);
                    for record in &mut records {
                        sensitivity.redact(record, principal);
                    }
                    total_results += records.len();
                    groups.insert(kind.to_string(), json!({"results": records}));
                }
                Err(err) => {
                    warn!(kind, error = %err, "kind query failed in universal search");
                    errors += 1;
                    groups.insert(
                        kind.to_string(),
                        json!({"results": [], "error": err.code()}),
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        // degrade per group; only fail outright when every kind failed
        if errors == KIND_INDEXES.len() {
            return Err(first_error.unwrap_or_else(|| Error::internal("all kind queries failed")));
        }

        groups.insert("total_results".to_string(), json!(total_results));
        Ok(ToolResult::ok(
            self.name(),
            total_results > 0,
            Value::Object(groups),
        ))
    }
}
