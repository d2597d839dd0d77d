//! Background memory workers.
//!
//! Extraction workers drain the shared task queue, turn conversation turns
//! into memory items through a small router call, and write them via the
//! manager. The consolidation sweeper periodically compacts each user's
//! episodic memories under a per-user cache lock.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use callsheet_cache::{BackgroundTask, Cache, CacheLock, TaskKind, TaskQueue};
use callsheet_core::error::{Error, Result};
use callsheet_core::message::{AgentKind, ChatMessage};
use callsheet_core::metrics::Metrics;
use callsheet_core::principal::{Principal, Role};
use callsheet_router::{LlmRouter, QueryComplexity, RouteRequest};

use crate::item::{MemoryItem, MemoryType};
use crate::manager::MemoryManager;

/// Queue priority for extraction tasks (lower runs sooner).
pub const EXTRACTION_PRIORITY: i32 = 5;

const IDLE_POLL: Duration = Duration::from_millis(500);
const CONSOLIDATION_LOCK_TTL: Duration = Duration::from_secs(300);

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract durable facts about the user from conversation turns. \
Return a JSON array (possibly empty) of objects with fields: \
\"type\" (one of \"semantic\", \"episodic\", \"procedural\"), \
\"content\" (the fact, self-contained), \
\"summary\" (one short line), and \
\"importance\" (0.0 to 1.0). \
Only include facts worth remembering across conversations. \
Return the JSON array and nothing else.";

/// Payload of an `extract_memory` background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub conversation_id: String,
    pub user_id: String,
    /// Captured at enqueue time so routing applies the same sensitivity
    /// floor the originating session had.
    pub data_access_level: u8,
    pub turn_refs: Vec<String>,
    /// The turns to mine, already rendered to text.
    pub content: String,
}

impl ExtractionTask {
    pub fn into_background_task(self) -> Result<BackgroundTask> {
        let payload = serde_json::to_value(&self)
            .map_err(|e| Error::internal(format!("serialize extraction task: {e}")))?;
        Ok(BackgroundTask::new(
            TaskKind::ExtractMemory,
            EXTRACTION_PRIORITY,
            payload,
        ))
    }

    pub fn from_background_task(task: &BackgroundTask) -> Result<Self> {
        serde_json::from_value(task.payload.clone())
            .map_err(|e| Error::data_integrity(format!("malformed extraction payload: {e}")))
    }
}

/// One extraction candidate as produced by the model.
#[derive(Debug, Clone, Deserialize)]
struct Candidate {
    #[serde(rename = "type")]
    memory_type: String,
    content: String,
    summary: String,
    #[serde(default)]
    importance: f32,
}

/// Parse the model's output into candidates. Tolerates markdown fences and
/// skips malformed entries; importance is clipped to [0,1].
pub fn parse_extraction_candidates(output: &str) -> Vec<(MemoryType, String, String, f32)> {
    let trimmed = output.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    // fall back to the widest bracketed slice when the model wrapped the
    // array in prose
    let sliced = match (body.find('['), body.rfind(']')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => body,
    };

    let Ok(candidates) = serde_json::from_str::<Vec<Candidate>>(sliced) else {
        return Vec::new();
    };

    candidates
        .into_iter()
        .filter_map(|candidate| {
            let memory_type = MemoryType::parse(&candidate.memory_type)?;
            if candidate.content.trim().is_empty() {
                return None;
            }
            Some((
                memory_type,
                candidate.content,
                candidate.summary,
                candidate.importance.clamp(0.0, 1.0),
            ))
        })
        .collect()
}

/// Pool of extraction workers over the shared background queue.
pub struct ExtractionWorkerPool {
    queue: TaskQueue,
    router: Arc<LlmRouter>,
    manager: Arc<MemoryManager>,
    metrics: Arc<Metrics>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl ExtractionWorkerPool {
    pub fn new(
        queue: TaskQueue,
        router: Arc<LlmRouter>,
        manager: Arc<MemoryManager>,
        metrics: Arc<Metrics>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            router,
            manager,
            metrics,
            max_retries,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    /// Shrink backoff delays; tests use this to avoid real sleeps.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Spawn `count` workers that drain the queue until cancelled.
    pub fn spawn(self: Arc<Self>, count: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let pool = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "extraction worker started");
                    pool.run(worker_id, cancel).await;
                    debug!(worker_id, "extraction worker stopped");
                })
            })
            .collect()
    }

    async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                task = self.queue.dequeue() => {
                    match task {
                        Ok(Some(task)) => self.handle(worker_id, task).await,
                        Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                        Err(e) => {
                            warn!(worker_id, error = %e, "queue dequeue failed");
                            tokio::time::sleep(IDLE_POLL).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, worker_id: usize, task: BackgroundTask) {
        if task.kind != TaskKind::ExtractMemory {
            warn!(worker_id, kind = ?task.kind, "unexpected task kind on queue; dropping");
            return;
        }
        let extraction = match ExtractionTask::from_background_task(&task) {
            Ok(extraction) => extraction,
            Err(e) => {
                error!(worker_id, error = %e, "dropping malformed extraction task");
                self.metrics.incr("memory_extraction_dropped");
                return;
            }
        };

        // bounded retries with exponential backoff, then drop + metric
        for attempt in 0..=self.max_retries {
            match self.extract(&extraction).await {
                Ok(stored) => {
                    debug!(worker_id, stored, conversation_id = %extraction.conversation_id, "extraction complete");
                    self.metrics.incr_by("memory_items_extracted", stored as u64);
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt);
                    warn!(worker_id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "extraction failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(worker_id, error = %e, conversation_id = %extraction.conversation_id, "extraction dropped after retries");
                    self.metrics.incr("memory_extraction_dropped");
                    return;
                }
            }
        }
    }

    /// One extraction attempt: router call, parse, store candidates.
    async fn extract(&self, task: &ExtractionTask) -> Result<usize> {
        let principal = Principal::new(
            task.user_id.clone(),
            Role::Salesperson,
            task.data_access_level,
        )?;

        let request = RouteRequest::new(
            vec![
                ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
                ChatMessage::user(task.content.clone()),
            ],
            AgentKind::Sales,
        )
        .with_complexity(QueryComplexity::Simple);

        let response = self.router.route_query(&request, &principal).await?;
        let candidates = parse_extraction_candidates(&response.content);

        let mut stored = 0usize;
        for (memory_type, content, summary, importance) in candidates {
            let item = MemoryItem::new(&task.user_id, memory_type, content, summary, importance)
                .with_source_turns(task.turn_refs.clone());
            match self.manager.store(item).await {
                Ok(crate::manager::StoreOutcome::Stored(_)) => stored += 1,
                Ok(crate::manager::StoreOutcome::Deduplicated { .. }) => {
                    self.metrics.incr("memory_items_deduplicated");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(stored)
    }
}

/// Periodic per-user consolidation with a cache-backed mutual exclusion.
pub struct ConsolidationSweeper {
    manager: Arc<MemoryManager>,
    cache: Arc<dyn Cache>,
    interval: Duration,
}

impl ConsolidationSweeper {
    pub fn new(manager: Arc<MemoryManager>, cache: Arc<dyn Cache>, interval: Duration) -> Self {
        Self {
            manager,
            cache,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => self.sweep_once().await,
                }
            }
        })
    }

    /// One pass over every user holding unconsolidated episodic memories.
    pub async fn sweep_once(&self) {
        let users = match self.manager.users_with_episodic_memory().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "consolidation sweep could not list users");
                return;
            }
        };

        for user_id in users {
            let lock_name = format!("consolidate:{user_id}");
            let lock = match CacheLock::acquire(Arc::clone(&self.cache), &lock_name, CONSOLIDATION_LOCK_TTL).await
            {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    debug!(user_id = %user_id, "consolidation already running elsewhere");
                    continue;
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "consolidation lock failed");
                    continue;
                }
            };

            match self.manager.consolidate(&user_id).await {
                Ok(0) => {}
                Ok(clusters) => info!(user_id = %user_id, clusters, "consolidation pass complete"),
                Err(e) => warn!(user_id = %user_id, error = %e, "consolidation failed"),
            }
            if let Err(e) = lock.release().await {
                warn!(user_id = %user_id, error = %e, "consolidation lock release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_cache::test_support::MemoryCache;
    use callsheet_core::config::{MemoryConfig, ProviderConfig, RouterConfig};
    use callsheet_graph::test_support::FakeGraph;
    use callsheet_router::test_support::{FakeChatProvider, FakeEmbeddings};
    use callsheet_router::ChatProvider;

    #[test]
    fn candidate_parsing_handles_fences_and_noise() {
        let fenced = "```json\n[{\"type\": \"semantic\", \"content\": \"Only greenlights sci-fi on 2M+ budgets\", \"summary\": \"budget rule for sci-fi\", \"importance\": 0.9}]\n```";
        let parsed = parse_extraction_candidates(fenced);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, MemoryType::Semantic);
        assert_eq!(parsed[0].3, 0.9);

        let wrapped = "Here are the facts:\n[{\"type\": \"episodic\", \"content\": \"Asked about Nike crew\", \"summary\": \"nike crew question\", \"importance\": 3.5}]\nDone.";
        let parsed = parse_extraction_candidates(wrapped);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].3, 1.0, "importance clipped to [0,1]");

        assert!(parse_extraction_candidates("no json at all").is_empty());
        assert!(parse_extraction_candidates("[]").is_empty());

        let mixed = "[{\"type\": \"unknown\", \"content\": \"x\", \"summary\": \"s\"}, {\"type\": \"semantic\", \"content\": \"keep me\", \"summary\": \"kept\"}]";
        let parsed = parse_extraction_candidates(mixed);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1, "keep me");
    }

    fn memory_config() -> MemoryConfig {
        MemoryConfig {
            workers: 1,
            extraction_retries: 2,
            consolidation_interval: Duration::from_secs(3600),
            dedup_similarity: 0.92,
            consolidation_cohesion: 0.85,
            min_cluster_size: 3,
        }
    }

    fn router_config() -> RouterConfig {
        RouterConfig {
            together: ProviderConfig {
                api_key: String::new(),
                default_model: "llama".to_string(),
                base_url: "http://localhost/v1".to_string(),
            },
            openai: ProviderConfig {
                api_key: String::new(),
                default_model: "gpt-4o".to_string(),
                base_url: "http://localhost/v1".to_string(),
            },
            trusted_providers: vec!["openai".to_string()],
            sensitivity_floor: 4,
            // zero cool-down: a failed first attempt must not bench the only
            // provider before the worker's retry
            health_cooldown: Duration::ZERO,
        }
    }

    fn pool_with(provider: Arc<FakeChatProvider>, graph: Arc<FakeGraph>) -> (Arc<ExtractionWorkerPool>, TaskQueue, Arc<Metrics>) {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let queue = TaskQueue::new(Arc::clone(&cache));
        let embeddings = Arc::new(FakeEmbeddings::new());
        let router = Arc::new(LlmRouter::new(
            vec![provider as Arc<dyn ChatProvider>],
            Arc::clone(&embeddings) as Arc<dyn callsheet_router::Embeddings>,
            &router_config(),
        ));
        let manager = Arc::new(MemoryManager::new(
            graph,
            embeddings,
            memory_config(),
        ));
        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(
            ExtractionWorkerPool::new(queue.clone(), router, manager, Arc::clone(&metrics), 2)
                .with_retry_base_delay(Duration::from_millis(5)),
        );
        (pool, queue, metrics)
    }

    fn task() -> BackgroundTask {
        ExtractionTask {
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            data_access_level: 2,
            turn_refs: vec!["c1:3".to_string()],
            content: "user: I only greenlight sci-fi on 2M+ budgets".to_string(),
        }
        .into_background_task()
        .unwrap()
    }

    const EXTRACTION_JSON: &str = "[{\"type\": \"semantic\", \"content\": \"Only greenlights sci-fi on 2M+ budgets\", \"summary\": \"budget rule for sci-fi\", \"importance\": 0.9}]";

    #[tokio::test]
    async fn worker_extracts_and_stores() {
        let provider = Arc::new(FakeChatProvider::new("together"));
        provider.respond(EXTRACTION_JSON);
        let graph = Arc::new(FakeGraph::new());
        let (pool, queue, metrics) = pool_with(provider, Arc::clone(&graph));

        queue.enqueue(&task()).await.unwrap();
        let dequeued = queue.dequeue().await.unwrap().unwrap();
        pool.handle(0, dequeued).await;

        assert_eq!(metrics.counter("memory_items_extracted"), 1);
        assert_eq!(metrics.counter("memory_extraction_dropped"), 0);
        assert!(graph
            .executed()
            .iter()
            .any(|q| q.text().contains("CREATE (m:Memory")));
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let provider = Arc::new(FakeChatProvider::new("together"));
        // first routed attempt fails terminally at the router level (both
        // in-provider tries), second worker attempt succeeds
        provider
            .fail(|| Error::connection("503"))
            .fail(|| Error::connection("503"))
            .respond(EXTRACTION_JSON);
        let graph = Arc::new(FakeGraph::new());
        let (pool, _queue, metrics) = pool_with(Arc::clone(&provider), graph);

        pool.handle(0, task()).await;

        assert_eq!(metrics.counter("memory_items_extracted"), 1);
        assert_eq!(metrics.counter("memory_extraction_dropped"), 0);
    }

    #[tokio::test]
    async fn persistent_failure_drops_with_metric() {
        let provider = Arc::new(FakeChatProvider::new("together"));
        for _ in 0..8 {
            provider.fail(|| Error::connection("down"));
        }
        let graph = Arc::new(FakeGraph::new());
        let (pool, _queue, metrics) = pool_with(provider, graph);

        pool.handle(0, task()).await;

        assert_eq!(metrics.counter("memory_extraction_dropped"), 1);
        assert_eq!(metrics.counter("memory_items_extracted"), 0);
    }

    #[tokio::test]
    async fn workers_stop_on_cancellation() {
        let provider = Arc::new(FakeChatProvider::new("together"));
        let graph = Arc::new(FakeGraph::new());
        let (pool, _queue, _metrics) = pool_with(provider, graph);

        let cancel = CancellationToken::new();
        let handles = pool.spawn(2, cancel.clone());
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker exits promptly")
                .unwrap();
        }
    }

    #[test]
    fn extraction_task_round_trips_through_queue_payload() {
        let original = ExtractionTask {
            conversation_id: "c9".to_string(),
            user_id: "u9".to_string(),
            data_access_level: 5,
            turn_refs: vec!["c9:1".to_string(), "c9:2".to_string()],
            content: "turns".to_string(),
        };
        let background = original.clone().into_background_task().unwrap();
        assert_eq!(background.kind, TaskKind::ExtractMemory);
        assert_eq!(background.priority, EXTRACTION_PRIORITY);
        let parsed = ExtractionTask::from_background_task(&background).unwrap();
        assert_eq!(parsed, original);
    }
}
