//! Callsheet server: wires the storage clients, providers, agents, and
//! background workers together, then serves the websocket endpoint.

mod auth;
mod frames;
mod server;
mod session;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use callsheet_agents::{AgentDeps, Orchestrator};
use callsheet_cache::metrics_sink::MetricsSink;
use callsheet_cache::{Cache, CachePermissionStore, RedisCache, TaskQueue};
use callsheet_core::config::AppConfig;
use callsheet_core::error::Result;
use callsheet_core::metrics::{default_thresholds, Metrics};
use callsheet_core::rbac::PermissionGate;
use callsheet_graph::{GraphClient, GraphStore};
use callsheet_memory::{
    CheckpointStore, ConsolidationSweeper, ConversationStore, ExtractionWorkerPool,
    MemoryContextCache, MemoryManager,
};
use callsheet_router::{
    ChatProvider, Embeddings, LlmRouter, OpenAiCompatibleProvider, OpenAiEmbeddings,
};
use callsheet_tools::ToolRegistry;

use crate::auth::UnverifiedPayloadVerifier;
use crate::server::AppState;
use crate::session::SessionHandles;

/// Cadence for flushing metrics and usage summaries to the cache.
const METRICS_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.runtime.log_level.clone())),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let metrics = Arc::new(Metrics::new());

    // storage clients
    let cache: Arc<dyn Cache> = Arc::new(
        RedisCache::connect(&config.cache.url)
            .await?
            .with_metrics(Arc::clone(&metrics)),
    );
    let graph_client = GraphClient::connect(&config.graph)
        .await?
        .with_metrics(Arc::clone(&metrics));
    if let Err(e) = graph_client.ensure_schema().await {
        warn!(error = %e, "schema bootstrap failed; continuing with existing schema");
    }
    let graph: Arc<dyn GraphStore> = Arc::new(graph_client);

    // providers and the router
    let together = OpenAiCompatibleProvider::new("together", &config.router.together)?;
    let openai = OpenAiCompatibleProvider::new("openai", &config.router.openai)?;
    let embeddings: Arc<dyn Embeddings> = Arc::new(OpenAiEmbeddings::new(&config.router.openai)?);
    let router = Arc::new(
        LlmRouter::new(
            vec![
                Arc::new(together) as Arc<dyn ChatProvider>,
                Arc::new(openai) as Arc<dyn ChatProvider>,
            ],
            Arc::clone(&embeddings),
            &config.router,
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    // tools behind the RBAC gate
    let gate = PermissionGate::new(
        Arc::new(CachePermissionStore::new(Arc::clone(&cache))),
        config.rbac.permission_cache_ttl_secs,
    );
    let registry = Arc::new(ToolRegistry::standard(
        Arc::clone(&graph),
        Arc::clone(&embeddings),
        gate,
    ));

    // memory tiers
    let memory = Arc::new(MemoryManager::new(
        Arc::clone(&graph),
        Arc::clone(&embeddings),
        config.memory.clone(),
    ));
    let queue = TaskQueue::new(Arc::clone(&cache));

    let deps = Arc::new(AgentDeps {
        registry,
        router: Arc::clone(&router),
        memory: Arc::clone(&memory),
        context_cache: MemoryContextCache::new(Arc::clone(&cache)),
        conversations: ConversationStore::new(Arc::clone(&cache)),
        checkpoints: Arc::new(CheckpointStore::new(Arc::clone(&cache))),
        queue: queue.clone(),
        metrics: Arc::clone(&metrics),
    });
    let orchestrator = Arc::new(Orchestrator::new(deps));

    // background workers, all under one shutdown scope
    let shutdown = CancellationToken::new();

    let extraction_pool = Arc::new(ExtractionWorkerPool::new(
        queue.clone(),
        Arc::clone(&router),
        Arc::clone(&memory),
        Arc::clone(&metrics),
        config.memory.extraction_retries,
    ));
    let worker_handles = extraction_pool.spawn(config.memory.workers, shutdown.child_token());
    info!(workers = config.memory.workers, "extraction workers started");

    let sweeper = ConsolidationSweeper::new(
        Arc::clone(&memory),
        Arc::clone(&cache),
        config.memory.consolidation_interval,
    );
    let sweeper_handle = sweeper.spawn(shutdown.child_token());

    let flusher_handle = {
        let sink = MetricsSink::new(Arc::clone(&cache), default_thresholds());
        let metrics = Arc::clone(&metrics);
        let router = Arc::clone(&router);
        let cache = Arc::clone(&cache);
        let queue = queue.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Ok(depth) = queue.len().await {
                            metrics.observe("background_queue_size", depth as f64);
                        }
                        router.probe_health().await;
                        sink.flush(&metrics).await;
                        router.persist_usage(&cache).await;
                    }
                }
            }
        })
    };

    // the websocket surface
    let state = Arc::new(AppState {
        handles: Arc::new(SessionHandles {
            orchestrator,
            // deployment concern: swap in a JWKS-verifying implementation
            verifier: Arc::new(UnverifiedPayloadVerifier::for_development()),
            metrics: Arc::clone(&metrics),
        }),
        cache,
        graph,
        buffer_frames: config.runtime.websocket_buffer_frames,
    });
    let app = server::router(state);

    let address = format!("{}:{}", config.runtime.host, config.runtime.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| callsheet_core::error::Error::connection(format!("bind {address}: {e}")))?;
    info!(%address, "callsheet server listening");

    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_signal.cancel();
        })
        .await
        .map_err(|e| callsheet_core::error::Error::internal(format!("server: {e}")))?;

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = sweeper_handle.await;
    let _ = flusher_handle.await;
    info!("callsheet server stopped");
    Ok(())
}
