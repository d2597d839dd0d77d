//! Programmable [`GraphStore`] double for unit tests in dependent crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use callsheet_core::error::{Error, Result};

use crate::query::CypherQuery;
use crate::schema::vector_index;
use crate::{GraphStore, JsonRow, VectorHit};

/// In-memory graph double. Responses are registered against a substring of
/// the query text; vector hits are registered per index name.
#[derive(Default)]
pub struct FakeGraph {
    responses: Mutex<Vec<(String, Vec<JsonRow>)>>,
    vector_hits: Mutex<HashMap<String, Vec<VectorHit>>>,
    failing_fragments: Mutex<Vec<String>>,
    failing_indexes: Mutex<Vec<String>>,
    executed: Mutex<Vec<CypherQuery>>,
    healthy: AtomicBool,
}

impl FakeGraph {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.healthy.store(true, Ordering::SeqCst);
        fake
    }

    /// Rows to return for any query whose text contains `fragment`.
    pub fn respond(&self, fragment: impl Into<String>, rows: Vec<JsonRow>) {
        self.responses.lock().push((fragment.into(), rows));
    }

    pub fn respond_vector(&self, index: impl Into<String>, hits: Vec<VectorHit>) {
        self.vector_hits.lock().insert(index.into(), hits);
    }

    /// Make any query containing `fragment` fail with a connection error.
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.failing_fragments.lock().push(fragment.into());
    }

    pub fn fail_index(&self, index: impl Into<String>) {
        self.failing_indexes.lock().push(index.into());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Every query executed, in order.
    pub fn executed(&self) -> Vec<CypherQuery> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl GraphStore for FakeGraph {
    async fn run(&self, query: CypherQuery) -> Result<Vec<JsonRow>> {
        if let Some(fragment) = self
            .failing_fragments
            .lock()
            .iter()
            .find(|f| query.text().contains(f.as_str()))
        {
            return Err(Error::connection(format!("injected failure on {fragment}")));
        }
        self.executed.lock().push(query.clone());
        let responses = self.responses.lock();
        for (fragment, rows) in responses.iter() {
            if query.text().contains(fragment.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn vector_search(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<VectorHit>> {
        // mirror the real client's validation so dimension tests are honest
        let spec = vector_index(index)
            .ok_or_else(|| Error::validation(format!("unknown vector index: {index}")))?;
        if vector.len() != spec.dimensions {
            return Err(Error::data_integrity(format!(
                "query vector has {} dimensions, index {} expects {}",
                vector.len(),
                spec.name,
                spec.dimensions
            )));
        }
        if self.failing_indexes.lock().iter().any(|i| i == index) {
            return Err(Error::connection(format!("injected failure on {index}")));
        }
        let mut hits = self
            .vector_hits
            .lock()
            .get(index)
            .cloned()
            .unwrap_or_default();
        hits.retain(|hit| hit.score >= min_score);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn transaction(&self, queries: Vec<CypherQuery>) -> Result<()> {
        let mut executed = self.executed.lock();
        for query in queries {
            executed.push(query);
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Build a query vector of the registered dimensionality.
pub fn test_vector(seed: f32) -> Vec<f32> {
    let mut v = vec![0.0; crate::schema::EMBEDDING_DIM];
    v[0] = seed;
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responds_by_fragment() {
        let fake = FakeGraph::new();
        let mut row = JsonRow::new();
        row.insert("name".to_string(), serde_json::json!("Courtney Phillips"));
        fake.respond("MATCH (p:Person", vec![row]);

        let rows = fake
            .run(CypherQuery::read("MATCH (p:Person {id: $id}) RETURN p.name AS name")
                .param("id", "p1")
                .returning(["name"]))
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], "Courtney Phillips");

        let empty = fake
            .run(CypherQuery::read("MATCH (o:Organization) RETURN o").returning(["o"]))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn vector_search_validates_dimensions() {
        let fake = FakeGraph::new();
        let err = fake
            .vector_search("memory_content_vector", &[0.5; 3], 5, 0.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "data_integrity");

        let ok = fake
            .vector_search("memory_content_vector", &test_vector(1.0), 5, 0.0)
            .await
            .unwrap();
        assert!(ok.is_empty());
    }

    #[tokio::test]
    async fn vector_hits_filtered_and_capped() {
        let fake = FakeGraph::new();
        fake.respond_vector(
            "person_bio_vector",
            vec![
                VectorHit {
                    node: serde_json::json!({"id": "p1"}),
                    labels: vec!["Person".to_string()],
                    score: 0.9,
                },
                VectorHit {
                    node: serde_json::json!({"id": "p2"}),
                    labels: vec!["Person".to_string()],
                    score: 0.4,
                },
            ],
        );

        let hits = fake
            .vector_search("person_bio_vector", &test_vector(1.0), 5, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node["id"], "p1");
    }
}
