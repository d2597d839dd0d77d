//! Knowledge-graph client.
//!
//! A thin, typed surface over the property-graph store: parameterized Cypher
//! execution with bounded retries, vector-index similarity search with
//! dimensionality validation, all-or-nothing transactions, and a health
//! probe. No business logic lives here; the tool registry owns the query
//! templates.

pub mod client;
pub mod query;
pub mod schema;
pub mod test_support;

use std::collections::BTreeMap;

use async_trait::async_trait;

use callsheet_core::error::Result;

pub use client::GraphClient;
pub use query::{CypherQuery, ParamValue};
pub use schema::{VectorIndexSpec, DOCUMENT_FULLTEXT_INDEX, EMBEDDING_DIM, VECTOR_INDEXES};

/// One result row: RETURN column name to JSON value.
pub type JsonRow = BTreeMap<String, serde_json::Value>;

/// One vector-search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Node properties as a JSON object (embedding properties elided).
    pub node: serde_json::Value,
    /// Node labels, for callers that search across kinds.
    pub labels: Vec<String>,
    pub score: f64,
}

/// The store seam the tool registry and memory subsystem program against.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Execute a parameterized query and materialize its declared RETURN
    /// columns. Retried only for idempotent queries.
    async fn run(&self, query: CypherQuery) -> Result<Vec<JsonRow>>;

    /// ANN search on a named vector index. The query vector must match the
    /// index dimensionality.
    async fn vector_search(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<VectorHit>>;

    /// Run all queries in one transaction; rollback on the first error.
    async fn transaction(&self, queries: Vec<CypherQuery>) -> Result<()>;

    /// Trivial probe under a strict timeout.
    async fn health(&self) -> bool;
}
