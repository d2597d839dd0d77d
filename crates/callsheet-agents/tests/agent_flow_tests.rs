//! End-to-end agent and orchestrator flows over in-memory doubles: scripted
//! providers, a fake graph store, and the in-memory cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use callsheet_agents::{
    AgentDeps, AgentEvent, Orchestrator, OrchestratorRequest,
};
use callsheet_cache::test_support::MemoryCache;
use callsheet_cache::{Cache, CachePermissionStore, TaskQueue};
use callsheet_core::config::{MemoryConfig, ProviderConfig, RouterConfig};
use callsheet_core::error::Error;
use callsheet_core::message::{AgentKind, MessageRole, ToolCall, TurnStatus};
use callsheet_core::metrics::Metrics;
use callsheet_core::principal::{Principal, Role};
use callsheet_core::rbac::PermissionGate;
use callsheet_graph::test_support::FakeGraph;
use callsheet_graph::{GraphStore, JsonRow, VectorHit};
use callsheet_memory::{
    CheckpointStore, ConversationStore, MemoryContextCache, MemoryManager,
};
use callsheet_router::test_support::{FakeChatProvider, FakeEmbeddings};
use callsheet_router::{ChatProvider, Embeddings, LlmRouter};
use callsheet_tools::ToolRegistry;

struct Harness {
    orchestrator: Orchestrator,
    deps: Arc<AgentDeps>,
    provider: Arc<FakeChatProvider>,
    graph: Arc<FakeGraph>,
}

fn router_config() -> RouterConfig {
    RouterConfig {
        together: ProviderConfig {
            api_key: String::new(),
            default_model: "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo".to_string(),
            base_url: "http://localhost/v1".to_string(),
        },
        openai: ProviderConfig {
            api_key: String::new(),
            default_model: "gpt-4o".to_string(),
            base_url: "http://localhost/v1".to_string(),
        },
        trusted_providers: vec!["openai".to_string()],
        sensitivity_floor: 4,
        // a scripted failure must not bench the only provider mid-test
        health_cooldown: Duration::ZERO,
    }
}

fn memory_config() -> MemoryConfig {
    MemoryConfig {
        workers: 1,
        extraction_retries: 3,
        consolidation_interval: Duration::from_secs(3600),
        dedup_similarity: 0.92,
        consolidation_cohesion: 0.85,
        min_cluster_size: 3,
    }
}

fn harness() -> Harness {
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let graph = Arc::new(FakeGraph::new());
    let provider = Arc::new(FakeChatProvider::new("together"));
    let embeddings: Arc<dyn Embeddings> = Arc::new(FakeEmbeddings::new());

    let router = Arc::new(LlmRouter::new(
        vec![Arc::clone(&provider) as Arc<dyn ChatProvider>],
        Arc::clone(&embeddings),
        &router_config(),
    ));
    let gate = PermissionGate::new(
        Arc::new(CachePermissionStore::new(Arc::clone(&cache))),
        900,
    );
    let registry = Arc::new(ToolRegistry::standard(
        Arc::clone(&graph) as Arc<dyn GraphStore>,
        Arc::clone(&embeddings),
        gate,
    ));
    let memory = Arc::new(MemoryManager::new(
        Arc::clone(&graph) as Arc<dyn GraphStore>,
        Arc::clone(&embeddings),
        memory_config(),
    ));

    let deps = Arc::new(AgentDeps {
        registry,
        router,
        memory,
        context_cache: MemoryContextCache::new(Arc::clone(&cache)),
        conversations: ConversationStore::new(Arc::clone(&cache)),
        checkpoints: Arc::new(CheckpointStore::new(Arc::clone(&cache))),
        queue: TaskQueue::new(Arc::clone(&cache)),
        metrics: Arc::new(Metrics::new()),
    });

    Harness {
        orchestrator: Orchestrator::new(Arc::clone(&deps)),
        deps,
        provider,
        graph,
    }
}

fn principal(level: u8) -> Principal {
    Principal::new("u1", Role::Salesperson, level).unwrap()
}

fn request(content: &str, preference: Option<AgentKind>) -> OrchestratorRequest {
    OrchestratorRequest {
        principal: principal(3),
        conversation_id: Some("c1".to_string()),
        content: content.to_string(),
        agent_preference: preference,
        preferred_provider: None,
    }
}

fn search_tool_call() -> ToolCall {
    ToolCall {
        id: "call_1".to_string(),
        name: "universal_vector_search".to_string(),
        arguments: serde_json::json!({"query_text": "boost mobile treatment writer"}),
    }
}

async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<String> {
    let mut chunks = Vec::new();
    while let Ok(event) = rx.try_recv() {
        let AgentEvent::Delta { content } = event;
        chunks.push(content);
    }
    chunks
}

#[tokio::test]
async fn tool_augmented_turn_answers_from_the_graph() {
    let h = harness();

    // knowledge lookup: the model calls universal search, the graph knows
    // Courtney Phillips, the model answers from the result
    h.graph.respond_vector(
        "person_bio_vector",
        vec![VectorHit {
            node: serde_json::json!({"id": "p1", "name": "Courtney Phillips", "title": "Writer"}),
            labels: vec!["Person".to_string()],
            score: 0.82,
        }],
    );
    h.provider
        .respond_with_tool_calls("", vec![search_tool_call()])
        .respond("Courtney Phillips wrote the treatment for the Boost Mobile project.");

    let (tx, rx) = mpsc::channel(64);
    let reply = h
        .orchestrator
        .handle_message(
            request("Who wrote the treatment for Boost Mobile?", Some(AgentKind::Sales)),
            Some(tx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(reply.content.contains("Courtney Phillips"));
    assert!(reply.content.contains("Boost Mobile"));
    assert_eq!(reply.agent_label, "sales");
    assert_eq!(reply.provider.as_deref(), Some("together"));
    assert!(!reply.cancelled);
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].name, "universal_vector_search");

    // the full answer was streamed before the final frame
    let chunks = drain(rx).await;
    assert_eq!(chunks.concat(), reply.content);

    // turn persisted: user + assistant
    let conversation = h.deps.conversations.load("c1").await.unwrap().unwrap();
    assert_eq!(conversation.turns.len(), 2);
    assert_eq!(conversation.turns[0].role, MessageRole::User);
    assert_eq!(conversation.turns[1].status, TurnStatus::Complete);
    assert_eq!(conversation.turns[1].provider.as_deref(), Some("together"));

    // extraction enqueued strictly after persist
    assert_eq!(h.deps.queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn checkpoints_form_a_contiguous_prefix() {
    let h = harness();
    h.provider
        .respond_with_tool_calls("", vec![search_tool_call()])
        .respond("Done.");

    h.orchestrator
        .handle_message(
            request("Who wrote the treatment for Boost Mobile?", Some(AgentKind::Sales)),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let latest = h.deps.checkpoints.latest("c1").await.unwrap().unwrap();
    assert!(latest.step >= 4, "several nodes checkpointed");
    for step in 0..=latest.step {
        assert!(
            h.deps.checkpoints.load("c1", step).await.unwrap().is_some(),
            "step {step} missing from prefix"
        );
    }
}

#[tokio::test]
async fn cancellation_persists_a_cancelled_turn_without_extraction() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let reply = h
        .orchestrator
        .handle_message(
            request("Find directors for the Nike shoot", Some(AgentKind::Talent)),
            None,
            cancel,
        )
        .await
        .unwrap();

    assert!(reply.cancelled);

    let conversation = h.deps.conversations.load("c1").await.unwrap().unwrap();
    assert_eq!(conversation.turns.last().unwrap().status, TurnStatus::Cancelled);
    assert_eq!(h.deps.queue.len().await.unwrap(), 0, "no extraction for cancelled turns");
}

#[tokio::test]
async fn provider_exhaustion_degrades_to_a_generic_reply() {
    let h = harness();
    h.provider
        .fail(|| Error::connection("503"))
        .fail(|| Error::connection("503"));

    let reply = h
        .orchestrator
        .handle_message(
            request("Which clients drive our deal pipeline revenue?", Some(AgentKind::Sales)),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(reply.content.contains("went wrong"));
    assert!(!reply.cancelled);

    let conversation = h.deps.conversations.load("c1").await.unwrap().unwrap();
    assert_eq!(conversation.turns.last().unwrap().status, TurnStatus::Error);
    assert_eq!(h.deps.metrics.counter("agent_turn_failures"), 1);
}

#[tokio::test]
async fn keyword_routing_picks_the_talent_agent() {
    let h = harness();
    h.provider
        .respond("Here are three directors with strong commercial reels.");

    let reply = h
        .orchestrator
        .handle_message(
            request("Help me find experienced directors and crew for a commercial", None),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(reply.agent_label, "talent");
}

#[tokio::test]
async fn low_confidence_routing_falls_back_to_the_llm() {
    let h = harness();
    // first scripted response answers the classification call, second the turn
    h.provider
        .respond("analytics")
        .respond("Hello! I can compare project performance for you.");

    let reply = h
        .orchestrator
        .handle_message(
            request("Hello, what can you do for me today?", None),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(reply.agent_label, "analytics");
}

#[tokio::test]
async fn multi_agent_queries_merge_under_one_turn() {
    let h = harness();
    // two fanned-out agents answer, then the supervisor merges
    h.provider
        .respond("Specialist finding one.")
        .respond("Specialist finding two.")
        .respond("[analytics] strong ROI history. [talent] Jane Doe fits the brief.");

    let (tx, rx) = mpsc::channel(64);
    let reply = h
        .orchestrator
        .handle_message(
            request(
                "Find an experienced director we've used before and assess viability with a performance report",
                None,
            ),
            Some(tx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(reply.agent_label, "multi");
    assert!(reply.content.contains("[analytics]"));
    assert!(reply.content.contains("[talent]"));

    // exactly one merged turn was recorded
    let conversation = h.deps.conversations.load("c1").await.unwrap().unwrap();
    assert_eq!(conversation.turns.len(), 2);
    assert_eq!(h.deps.queue.len().await.unwrap(), 1);

    let chunks = drain(rx).await;
    assert_eq!(chunks.concat(), reply.content);
}

#[tokio::test]
async fn budgets_stay_redacted_for_low_access_principals() {
    let h = harness();

    let mut row = JsonRow::new();
    row.insert(
        "project".to_string(),
        serde_json::json!({"id": "proj1", "title": "Air Max 2024", "budget": 500000}),
    );
    row.insert("crew".to_string(), serde_json::json!([]));
    row.insert("client".to_string(), serde_json::json!("Nike"));
    row.insert("director".to_string(), serde_json::json!(null));
    h.graph.respond("MATCH (proj:Project)", vec![row]);

    h.provider
        .respond_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "get_project_details".to_string(),
                arguments: serde_json::json!({"name": "Air Max 2024"}),
            }],
        )
        .respond("The exact budget for Air Max 2024 was $500,000.");

    let mut req = request("What was the exact budget for the Air Max project?", Some(AgentKind::Sales));
    req.principal = principal(1);

    let reply = h
        .orchestrator
        .handle_message(req, None, CancellationToken::new())
        .await
        .unwrap();

    // the defensive pass scrubs what the model leaked past tool redaction
    assert!(!reply.content.contains("500,000"));
    assert!(reply.content.contains("[redacted]"));
}

#[tokio::test]
async fn dispatch_serializes_per_conversation() {
    let h = Arc::new(harness());
    h.provider.respond("first answer").respond("second answer");

    let a = {
        let h = Arc::clone(&h);
        tokio::spawn(async move {
            h.orchestrator
                .handle_message(
                    request("Pipeline revenue by client for our deals?", Some(AgentKind::Sales)),
                    None,
                    CancellationToken::new(),
                )
                .await
        })
    };
    let b = {
        let h = Arc::clone(&h);
        tokio::spawn(async move {
            h.orchestrator
                .handle_message(
                    request("And which deal closed largest?", Some(AgentKind::Sales)),
                    None,
                    CancellationToken::new(),
                )
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let conversation = h.deps.conversations.load("c1").await.unwrap().unwrap();
    assert_eq!(conversation.turns.len(), 4, "two full turns, never interleaved");
    // timestamps strictly increase across the whole conversation
    for pair in conversation.turns.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
}
