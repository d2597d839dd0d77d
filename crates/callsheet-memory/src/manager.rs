//! Long-term memory manager over the graph store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use callsheet_core::config::MemoryConfig;
use callsheet_core::error::{Error, Result};
use callsheet_graph::{CypherQuery, GraphStore};
use callsheet_router::embeddings::embed_query;
use callsheet_router::Embeddings;

use crate::item::{MemoryItem, MemoryType};
use crate::vectors::{cluster_by_cohesion, cosine_similarity, normalized_centroid};

/// Floor below which vector hits are noise for recall purposes.
const SEARCH_MIN_SCORE: f64 = 0.3;

/// Outcome of a store attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored(String),
    /// An existing same-type item was similar enough to absorb this one.
    Deduplicated { existing_id: String },
}

/// One recalled memory, ranked for prompt injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecall {
    pub id: String,
    pub memory_type: MemoryType,
    pub summary: String,
    pub content: String,
    pub score: f64,
    pub importance: f32,
}

/// Items plus provenance edges, for the memory-graph view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryGraph {
    pub items: Vec<Value>,
    pub edges: Vec<MemoryEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub from: String,
    pub to: String,
}

pub struct MemoryManager {
    graph: Arc<dyn GraphStore>,
    embeddings: Arc<dyn Embeddings>,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(graph: Arc<dyn GraphStore>, embeddings: Arc<dyn Embeddings>, config: MemoryConfig) -> Self {
        Self {
            graph,
            embeddings,
            config,
        }
    }

    /// Attach embeddings to an item that arrived without them.
    async fn embed_item(&self, item: &mut MemoryItem) -> Result<()> {
        if item.embedding.is_empty() || item.summary_embedding.is_empty() {
            let texts = vec![item.content.clone(), item.summary.clone()];
            let mut vectors = self.embeddings.embed(&texts).await?;
            item.summary_embedding = vectors
                .pop()
                .ok_or_else(|| Error::internal("embeddings batch came back short"))?;
            item.embedding = vectors
                .pop()
                .ok_or_else(|| Error::internal("embeddings batch came back short"))?;
        }
        item.validate_embeddings()
    }

    /// Find an existing same-type item of this user that duplicates the
    /// candidate (cosine at or above the dedup threshold).
    async fn find_duplicate(&self, item: &MemoryItem) -> Result<Option<String>> {
        let hits = self
            .graph
            .vector_search(
                "memory_content_vector",
                &item.embedding,
                10,
                f64::from(self.config.dedup_similarity) - 0.05,
            )
            .await?;

        for hit in hits {
            let node = &hit.node;
            if node["userId"].as_str() != Some(item.user_id.as_str()) {
                continue;
            }
            if node["type"].as_str() != Some(item.memory_type.as_str()) {
                continue;
            }
            if !node["supersededBy"].is_null() {
                continue;
            }
            if hit.score >= f64::from(self.config.dedup_similarity) {
                return Ok(node["id"].as_str().map(str::to_string));
            }
        }
        Ok(None)
    }

    /// Store a memory item, deduplicating against recent same-type items.
    pub async fn store(&self, mut item: MemoryItem) -> Result<StoreOutcome> {
        self.embed_item(&mut item).await?;

        if let Some(existing_id) = self.find_duplicate(&item).await? {
            debug!(user_id = %item.user_id, existing_id = %existing_id, "memory deduplicated");
            return Ok(StoreOutcome::Deduplicated { existing_id });
        }

        let query = CypherQuery::write(
            "CREATE (m:Memory { \
               id: $id, userId: $user_id, type: $type, importance: $importance, \
               content: $content, summary: $summary, \
               embedding: $embedding, summaryEmbedding: $summary_embedding, \
               createdAt: $created_at, lastAccessedAt: $last_accessed_at, \
               accessCount: 0, sourceTurnRefs: $source_turn_refs })",
        )
        .param("id", item.id.clone())
        .param("user_id", item.user_id.clone())
        .param("type", item.memory_type.as_str())
        .param("importance", f64::from(item.importance))
        .param("content", item.content.clone())
        .param("summary", item.summary.clone())
        .param("embedding", item.embedding.clone())
        .param("summary_embedding", item.summary_embedding.clone())
        .param("created_at", item.created_at.to_rfc3339())
        .param("last_accessed_at", item.last_accessed_at.to_rfc3339())
        .param("source_turn_refs", item.source_turn_refs.clone());

        self.graph.run(query).await?;
        info!(user_id = %item.user_id, memory_type = item.memory_type.as_str(), "memory stored");
        Ok(StoreOutcome::Stored(item.id))
    }

    /// Dual-index semantic recall.
    ///
    /// The query is embedded once and searched against both the content and
    /// summary indexes; hits union by id at max score, decay with access
    /// count, and cap at `k`. Access bookkeeping on the returned items is
    /// best effort.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        type_filter: Option<MemoryType>,
    ) -> Result<Vec<MemoryRecall>> {
        if query.trim().len() < 2 {
            return Err(Error::validation("memory query must be at least 2 characters"));
        }
        let vector = embed_query(self.embeddings.as_ref(), query.trim()).await?;

        let fetch = k.max(1) * 2;
        let mut union: std::collections::BTreeMap<String, (Value, f64)> = std::collections::BTreeMap::new();
        for index in ["memory_content_vector", "memory_summary_vector"] {
            let hits = match self.graph.vector_search(index, &vector, fetch, SEARCH_MIN_SCORE).await {
                Ok(hits) => hits,
                Err(e) => {
                    // one healthy index still yields useful recall
                    warn!(index, error = %e, "memory index query failed");
                    continue;
                }
            };
            for hit in hits {
                let Some(id) = hit.node["id"].as_str().map(str::to_string) else {
                    continue;
                };
                let entry = union.entry(id).or_insert_with(|| (hit.node.clone(), hit.score));
                if hit.score > entry.1 {
                    *entry = (hit.node, hit.score);
                }
            }
        }

        let mut recalls: Vec<MemoryRecall> = union
            .into_values()
            .filter_map(|(node, score)| {
                if node["userId"].as_str() != Some(user_id) {
                    return None;
                }
                if !node["supersededBy"].is_null() {
                    return None;
                }
                let memory_type = MemoryType::parse(node["type"].as_str()?)?;
                if let Some(filter) = type_filter {
                    if memory_type != filter {
                        return None;
                    }
                }
                let access_count = node["accessCount"].as_u64().unwrap_or(0);
                let decayed = score / (1.0 + 0.05 * access_count as f64);
                Some(MemoryRecall {
                    id: node["id"].as_str().unwrap_or_default().to_string(),
                    memory_type,
                    summary: node["summary"].as_str().unwrap_or_default().to_string(),
                    content: node["content"].as_str().unwrap_or_default().to_string(),
                    score: decayed,
                    importance: node["importance"].as_f64().unwrap_or(0.0) as f32,
                })
            })
            .collect();

        recalls.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        recalls.truncate(k);

        if !recalls.is_empty() {
            let ids: Vec<String> = recalls.iter().map(|r| r.id.clone()).collect();
            let touch = CypherQuery::write(
                "MATCH (m:Memory) WHERE m.id IN $ids \
                 SET m.accessCount = m.accessCount + 1, m.lastAccessedAt = $now",
            )
            .param("ids", ids)
            .param("now", chrono::Utc::now().to_rfc3339())
            .idempotent();
            if let Err(e) = self.graph.run(touch).await {
                warn!(error = %e, "memory access bookkeeping failed");
            }
        }

        Ok(recalls)
    }

    /// All items (embeddings elided) plus supersession edges.
    pub async fn get_graph(&self, user_id: &str) -> Result<MemoryGraph> {
        let query = CypherQuery::read(
            "MATCH (m:Memory {userId: $user_id}) \
             RETURN collect(m {.id, .type, .summary, .content, .importance, \
                               .accessCount, .createdAt, .supersededBy}) AS items",
        )
        .param("user_id", user_id)
        .returning(["items"]);

        let mut rows = self.graph.run(query).await?;
        let items: Vec<Value> = rows
            .pop()
            .and_then(|mut row| row.remove("items"))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let edges = items
            .iter()
            .filter_map(|item| {
                let from = item["id"].as_str()?;
                let to = item["supersededBy"].as_str()?;
                Some(MemoryEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            })
            .collect();

        Ok(MemoryGraph { items, edges })
    }

    /// Compact clusters of near-duplicate episodic items into semantic
    /// items. Sources are marked superseded but retained. Returns the
    /// number of clusters consolidated.
    pub async fn consolidate(&self, user_id: &str) -> Result<usize> {
        let query = CypherQuery::read(
            "MATCH (m:Memory {userId: $user_id, type: 'episodic'}) \
             WHERE m.supersededBy IS NULL \
             RETURN m.id AS id, m.content AS content, m.summary AS summary, \
                    m.importance AS importance, m.embedding AS embedding, \
                    m.sourceTurnRefs AS source_turn_refs \
             ORDER BY m.createdAt",
        )
        .param("user_id", user_id)
        .returning(["id", "content", "summary", "importance", "embedding", "source_turn_refs"]);

        let rows = self.graph.run(query).await?;
        if rows.len() < self.config.min_cluster_size {
            return Ok(0);
        }

        struct Source {
            id: String,
            content: String,
            summary: String,
            importance: f32,
            embedding: Vec<f32>,
            refs: Vec<String>,
        }

        let mut sources = Vec::with_capacity(rows.len());
        for mut row in rows {
            let embedding: Vec<f32> = row
                .remove("embedding")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if embedding.len() != callsheet_graph::EMBEDDING_DIM {
                continue;
            }
            sources.push(Source {
                id: row.remove("id").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
                content: row.remove("content").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
                summary: row.remove("summary").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
                importance: row.remove("importance").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
                embedding,
                refs: row
                    .remove("source_turn_refs")
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default(),
            });
        }

        let vectors: Vec<Vec<f32>> = sources.iter().map(|s| s.embedding.clone()).collect();
        let clusters = cluster_by_cohesion(
            &vectors,
            self.config.consolidation_cohesion,
            self.config.min_cluster_size,
        );

        for cluster in &clusters {
            let members: Vec<&Source> = cluster.iter().map(|&i| &sources[i]).collect();

            // the most important member names the consolidated fact
            let lead = members
                .iter()
                .max_by(|a, b| {
                    a.importance
                        .partial_cmp(&b.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .ok_or_else(|| Error::internal("empty cluster"))?;
            let content = members
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let importance = members
                .iter()
                .map(|s| s.importance)
                .fold(0.0f32, f32::max);
            let mut refs: Vec<String> = members.iter().flat_map(|s| s.refs.clone()).collect();
            refs.sort();
            refs.dedup();

            let member_vectors: Vec<&[f32]> = members.iter().map(|s| s.embedding.as_slice()).collect();
            let embedding = normalized_centroid(&member_vectors);
            let summary_embedding = embed_query(self.embeddings.as_ref(), &lead.summary).await?;

            let consolidated_id = uuid::Uuid::new_v4().to_string();
            let source_ids: Vec<String> = members.iter().map(|s| s.id.clone()).collect();

            let create = CypherQuery::write(
                "CREATE (m:Memory { \
                   id: $id, userId: $user_id, type: 'semantic', importance: $importance, \
                   content: $content, summary: $summary, \
                   embedding: $embedding, summaryEmbedding: $summary_embedding, \
                   createdAt: $created_at, lastAccessedAt: $created_at, \
                   accessCount: 0, sourceTurnRefs: $source_turn_refs })",
            )
            .param("id", consolidated_id.clone())
            .param("user_id", user_id)
            .param("importance", f64::from(importance))
            .param("content", content)
            .param("summary", lead.summary.clone())
            .param("embedding", embedding)
            .param("summary_embedding", summary_embedding)
            .param("created_at", chrono::Utc::now().to_rfc3339())
            .param("source_turn_refs", refs);

            let supersede = CypherQuery::write(
                "MATCH (m:Memory) WHERE m.id IN $ids SET m.supersededBy = $new_id",
            )
            .param("ids", source_ids)
            .param("new_id", consolidated_id);

            self.graph.transaction(vec![create, supersede]).await?;
        }

        if !clusters.is_empty() {
            info!(user_id, clusters = clusters.len(), "episodic memories consolidated");
        }
        Ok(clusters.len())
    }

    /// Users with unconsolidated episodic memories; drives the sweeper.
    pub async fn users_with_episodic_memory(&self) -> Result<Vec<String>> {
        let query = CypherQuery::read(
            "MATCH (m:Memory {type: 'episodic'}) WHERE m.supersededBy IS NULL \
             RETURN collect(DISTINCT m.userId) AS users",
        )
        .returning(["users"]);
        let mut rows = self.graph.run(query).await?;
        Ok(rows
            .pop()
            .and_then(|mut row| row.remove("users"))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    /// Dedup threshold sanity check, used by tests and startup validation.
    pub fn is_duplicate_pair(&self, a: &[f32], b: &[f32]) -> bool {
        cosine_similarity(a, b) >= self.config.dedup_similarity
    }
}
