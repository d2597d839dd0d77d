//! Neo4j-backed [`GraphStore`] implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neo4rs::{ConfigBuilder, Graph};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use callsheet_core::config::{timeouts, GraphConfig};
use callsheet_core::error::{Error, Result};
use callsheet_core::metrics::Metrics;

use crate::query::CypherQuery;
use crate::schema::{schema_statements, vector_index};
use crate::{GraphStore, JsonRow, VectorHit};

/// Retries after the first attempt, for idempotent queries only.
const READ_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Embedding properties are large and never useful to callers; elide them
/// from returned nodes.
const ELIDED_PROPERTIES: [&str; 3] = ["embedding", "summaryEmbedding", "bioEmbedding"];

fn map_neo4j_error(err: &neo4rs::Error) -> Error {
    let msg = err.to_string();
    let lowered = msg.to_lowercase();
    if lowered.contains("connection") || lowered.contains("io error") || lowered.contains("broken pipe")
    {
        Error::connection(format!("neo4j: {msg}"))
    } else {
        Error::internal(format!("neo4j: {msg}"))
    }
}

/// Exponential backoff with +-10% jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY.as_millis() as f64 * 2f64.powi(attempt as i32);
    let capped = base.min(RETRY_MAX_DELAY.as_millis() as f64);
    let jitter = capped * 0.1 * (rand::thread_rng().gen::<f64>() - 0.5);
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

/// Pooled Neo4j client.
pub struct GraphClient {
    graph: Arc<Graph>,
    /// Bounds in-flight queries; exhausting it within the borrow timeout is
    /// a `Saturation` error, not an unbounded queue.
    permits: Arc<Semaphore>,
    borrow_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl GraphClient {
    /// Connect and size the pool from config.
    pub async fn connect(config: &GraphConfig) -> Result<Self> {
        let driver_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.username)
            .password(&config.password)
            .db(config.database.as_str())
            .max_connections(config.pool_max)
            .build()
            .map_err(|e| Error::validation(format!("neo4j config: {e}")))?;

        let graph = Graph::connect(driver_config)
            .await
            .map_err(|e| Error::connection(format!("failed to connect to neo4j: {e}")))?;
        debug!(uri = %config.uri, pool_max = config.pool_max, "neo4j connection established");

        Ok(Self {
            graph: Arc::new(graph),
            permits: Arc::new(Semaphore::new(config.pool_max)),
            borrow_timeout: config.connection_timeout,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create vector indexes and id-uniqueness constraints. Safe to run on
    /// every startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in schema_statements() {
            self.execute_once(&statement, timeouts::GRAPH_QUERY).await?;
        }
        debug!("graph schema ensured");
        Ok(())
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        match tokio::time::timeout(self.borrow_timeout, Arc::clone(&self.permits).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::internal("graph pool closed")),
            Err(_) => Err(Error::saturation(
                "graph connection pool exhausted within borrow timeout",
            )),
        }
    }

    /// One attempt: borrow, execute, collect declared columns.
    async fn execute_once(&self, query: &CypherQuery, budget: Duration) -> Result<Vec<JsonRow>> {
        let _permit = self.acquire_permit().await?;
        let started = std::time::Instant::now();

        let result = tokio::time::timeout(budget, async {
            let mut stream = self
                .graph
                .execute(query.to_neo4rs())
                .await
                .map_err(|e| map_neo4j_error(&e))?;

            let mut rows = Vec::new();
            while let Some(row) = stream.next().await.map_err(|e| map_neo4j_error(&e))? {
                let mut json_row = JsonRow::new();
                for column in query.return_columns() {
                    let value: serde_json::Value = row.get(column.as_str()).map_err(|e| {
                        Error::internal(format!("column {column} missing from result: {e}"))
                    })?;
                    json_row.insert(column.clone(), value);
                }
                rows.push(json_row);
            }
            Ok(rows)
        })
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.observe_duration("graph_query_time_ms", started.elapsed());
        }

        match result {
            Ok(rows) => rows,
            Err(_) => Err(Error::timeout("graph query", budget.as_millis() as u64)),
        }
    }

    async fn execute_with_retry(&self, query: &CypherQuery, budget: Duration) -> Result<Vec<JsonRow>> {
        let retries = if query.is_idempotent() { READ_RETRIES } else { 0 };
        let mut attempt = 0;
        loop {
            match self.execute_once(query, budget).await {
                Ok(rows) => return Ok(rows),
                Err(err) if attempt < retries && err.is_retryable() => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying graph query"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl GraphStore for GraphClient {
    async fn run(&self, query: CypherQuery) -> Result<Vec<JsonRow>> {
        let budget = if query.is_vector() {
            timeouts::GRAPH_VECTOR
        } else {
            timeouts::GRAPH_QUERY
        };
        self.execute_with_retry(&query, budget).await
    }

    async fn vector_search(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<VectorHit>> {
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
        if k == 0 {
            return Ok(Vec::new());
        }

        // index name and k come from the static registry / a validated
        // usize; the vector and floor are bound parameters
        let query = CypherQuery::read(format!(
            "CALL db.index.vector.queryNodes('{}', {k}, $embedding) \
             YIELD node, score \
             WHERE score >= $min_score \
             RETURN properties(node) AS props, labels(node) AS labels, score \
             ORDER BY score DESC",
            spec.name
        ))
        .param("embedding", vector.to_vec())
        .param("min_score", min_score)
        .returning(["props", "labels", "score"])
        .with_vector_timeout();

        let rows = self.execute_with_retry(&query, timeouts::GRAPH_VECTOR).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for mut row in rows {
            let mut node = row.remove("props").unwrap_or(serde_json::Value::Null);
            if let Some(object) = node.as_object_mut() {
                for elided in ELIDED_PROPERTIES {
                    object.remove(elided);
                }
            }
            let labels = row
                .remove("labels")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            let score = row.remove("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            hits.push(VectorHit { node, labels, score });
        }
        Ok(hits)
    }

    async fn transaction(&self, queries: Vec<CypherQuery>) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        let budget = timeouts::GRAPH_QUERY * queries.len().max(1) as u32;

        tokio::time::timeout(budget, async {
            let mut txn = self
                .graph
                .start_txn()
                .await
                .map_err(|e| map_neo4j_error(&e))?;

            for query in &queries {
                if let Err(e) = txn.run(query.to_neo4rs()).await {
                    let mapped = map_neo4j_error(&e);
                    if let Err(rollback_err) = txn.rollback().await {
                        warn!(error = %rollback_err, "transaction rollback failed");
                    }
                    return Err(mapped);
                }
            }

            txn.commit().await.map_err(|e| map_neo4j_error(&e))
        })
        .await
        .map_err(|_| Error::timeout("graph transaction", budget.as_millis() as u64))?
    }

    async fn health(&self) -> bool {
        let probe = CypherQuery::read("RETURN 1 AS ok").returning(["ok"]);
        matches!(
            self.execute_once(&probe, timeouts::HEALTH_PROBE).await,
            Ok(rows) if !rows.is_empty()
        )
    }
}
