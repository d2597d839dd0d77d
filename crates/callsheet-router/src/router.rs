//! Provider selection, fallback, and accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callsheet_cache::Cache;
use callsheet_core::config::RouterConfig;
use callsheet_core::error::{Error, ProviderAttempt, Result};
use callsheet_core::message::{AgentKind, ChatMessage, ToolDefinition};
use callsheet_core::metrics::Metrics;
use callsheet_core::principal::Principal;

use crate::complexity::{estimate_complexity, QueryComplexity};
use crate::embeddings::Embeddings;
use crate::usage::UsageTracker;
use crate::{ChatProvider, ChatResponse, CompletionRequest, DeltaStream, StreamDelta};

/// Canonical provider names.
pub const PRIMARY_PROVIDER: &str = "together";
pub const SECONDARY_PROVIDER: &str = "openai";

/// Low-capability model used for simple queries on the primary provider.
const PRIMARY_SMALL_MODEL: &str = "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo";
/// Mid-capability model on the secondary provider.
const SECONDARY_MID_MODEL: &str = "gpt-4o-mini";

const IN_PROVIDER_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Routing input: the conversation plus everything selection needs.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub messages: Vec<ChatMessage>,
    pub agent: AgentKind,
    pub complexity_hint: Option<QueryComplexity>,
    pub preferred_provider: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

impl RouteRequest {
    pub fn new(messages: Vec<ChatMessage>, agent: AgentKind) -> Self {
        Self {
            messages,
            agent,
            complexity_hint: None,
            preferred_provider: None,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_complexity(mut self, complexity: QueryComplexity) -> Self {
        self.complexity_hint = Some(complexity);
        self
    }
}

/// A provider/model pair chosen by the preference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
}

/// Per-agent model preferences, one entry per complexity level.
#[derive(Debug, Clone)]
pub struct ModelPreferences {
    pub simple: ProviderModel,
    pub moderate: ProviderModel,
    pub complex: ProviderModel,
}

impl ModelPreferences {
    pub fn select(&self, complexity: QueryComplexity) -> &ProviderModel {
        match complexity {
            QueryComplexity::Simple => &self.simple,
            QueryComplexity::Moderate => &self.moderate,
            QueryComplexity::Complex => &self.complex,
        }
    }
}

fn default_preferences(config: &RouterConfig) -> HashMap<AgentKind, ModelPreferences> {
    let primary = |model: &str| ProviderModel {
        provider: PRIMARY_PROVIDER.to_string(),
        model: model.to_string(),
    };
    let secondary = |model: &str| ProviderModel {
        provider: SECONDARY_PROVIDER.to_string(),
        model: model.to_string(),
    };

    let conversational = ModelPreferences {
        simple: primary(PRIMARY_SMALL_MODEL),
        moderate: primary(&config.together.default_model),
        complex: secondary(&config.openai.default_model),
    };
    let analytical = ModelPreferences {
        simple: primary(&config.together.default_model),
        moderate: secondary(SECONDARY_MID_MODEL),
        complex: secondary(&config.openai.default_model),
    };

    HashMap::from([
        (AgentKind::Sales, conversational.clone()),
        (AgentKind::Talent, conversational),
        (AgentKind::Analytics, analytical),
    ])
}

/// Tracks provider failures to keep them out of rotation for a cool-down.
struct HealthGate {
    cooldown: Duration,
    failed_at: DashMap<String, Instant>,
}

impl HealthGate {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            failed_at: DashMap::new(),
        }
    }

    fn is_available(&self, provider: &str) -> bool {
        match self.failed_at.get(provider) {
            Some(at) => at.elapsed() >= self.cooldown,
            None => true,
        }
    }

    fn record_failure(&self, provider: &str) {
        self.failed_at.insert(provider.to_string(), Instant::now());
    }

    fn record_success(&self, provider: &str) {
        self.failed_at.remove(provider);
    }
}

/// The provider arbiter.
pub struct LlmRouter {
    providers: Vec<Arc<dyn ChatProvider>>,
    embeddings: Arc<dyn Embeddings>,
    preferences: HashMap<AgentKind, ModelPreferences>,
    default_models: HashMap<String, String>,
    trusted_providers: Vec<String>,
    sensitivity_floor: u8,
    health: HealthGate,
    usage: Arc<UsageTracker>,
    metrics: Option<Arc<Metrics>>,
}

impl LlmRouter {
    pub fn new(
        providers: Vec<Arc<dyn ChatProvider>>,
        embeddings: Arc<dyn Embeddings>,
        config: &RouterConfig,
    ) -> Self {
        let default_models = HashMap::from([
            (
                PRIMARY_PROVIDER.to_string(),
                config.together.default_model.clone(),
            ),
            (
                SECONDARY_PROVIDER.to_string(),
                config.openai.default_model.clone(),
            ),
        ]);
        Self {
            providers,
            embeddings,
            preferences: default_preferences(config),
            default_models,
            trusted_providers: config.trusted_providers.clone(),
            sensitivity_floor: config.sensitivity_floor,
            health: HealthGate::new(config.health_cooldown),
            usage: Arc::new(UsageTracker::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the model-preference table (used by agent profiles).
    pub fn with_preferences(mut self, preferences: HashMap<AgentKind, ModelPreferences>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn embeddings(&self) -> Arc<dyn Embeddings> {
        Arc::clone(&self.embeddings)
    }

    /// Embed a batch through the configured embeddings provider.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embeddings.embed(texts).await
    }

    /// Flush the usage summary to the cache.
    pub async fn persist_usage(&self, cache: &Arc<dyn Cache>) {
        self.usage.persist_summary(cache).await;
    }

    /// Probe every provider and bench the ones that fail. Run periodically;
    /// a benched provider re-enters rotation after the cool-down or its
    /// next successful probe.
    pub async fn probe_health(&self) {
        for provider in &self.providers {
            if provider.health().await {
                self.health.record_success(provider.name());
            } else {
                warn!(provider = provider.name(), "health probe failed");
                self.health.record_failure(provider.name());
            }
        }
    }

    /// Sensitivity floor (spec step 1): principals handling data above the
    /// floor are restricted to the trusted provider set.
    fn eligible_providers(&self, principal: &Principal) -> Result<Vec<Arc<dyn ChatProvider>>> {
        let restricted = principal.data_access_level >= self.sensitivity_floor;
        let eligible: Vec<Arc<dyn ChatProvider>> = self
            .providers
            .iter()
            .filter(|p| {
                !restricted || self.trusted_providers.iter().any(|t| t == p.name())
            })
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(Error::provider_unavailable(format!(
                "no trusted provider for data access level {}",
                principal.data_access_level
            )));
        }
        Ok(eligible)
    }

    /// Order candidates: caller override first (if eligible), then the
    /// preference-table provider, then the rest; health-gated throughout.
    fn candidate_order(
        &self,
        eligible: &[Arc<dyn ChatProvider>],
        request: &RouteRequest,
        table_choice: &ProviderModel,
    ) -> Vec<Arc<dyn ChatProvider>> {
        let mut names: Vec<&str> = Vec::new();
        if let Some(preferred) = &request.preferred_provider {
            names.push(preferred.as_str());
        }
        names.push(table_choice.provider.as_str());
        for provider in eligible {
            names.push(provider.name());
        }

        let mut ordered = Vec::new();
        let mut seen = Vec::new();
        for name in names {
            if seen.contains(&name.to_string()) {
                continue;
            }
            seen.push(name.to_string());
            if let Some(provider) = eligible.iter().find(|p| p.name() == name) {
                if self.health.is_available(name) {
                    ordered.push(Arc::clone(provider));
                } else {
                    debug!(provider = name, "skipping provider in health cool-down");
                }
            }
        }
        ordered
    }

    fn model_for(&self, provider: &str, table_choice: &ProviderModel) -> String {
        if provider == table_choice.provider {
            table_choice.model.clone()
        } else {
            self.default_models
                .get(provider)
                .cloned()
                .unwrap_or_else(|| table_choice.model.clone())
        }
    }

    fn plan(&self, request: &RouteRequest, principal: &Principal) -> Result<(Vec<Arc<dyn ChatProvider>>, ProviderModel, QueryComplexity)> {
        let complexity = estimate_complexity(
            &request.messages,
            request.complexity_hint,
            request.agent,
            !request.tools.is_empty(),
        );
        let table_choice = self
            .preferences
            .get(&request.agent)
            .map(|prefs| prefs.select(complexity).clone())
            .ok_or_else(|| Error::internal(format!("no preferences for agent {}", request.agent)))?;

        let eligible = self.eligible_providers(principal)?;
        let candidates = self.candidate_order(&eligible, request, &table_choice);
        if candidates.is_empty() {
            return Err(Error::provider_unavailable(
                "all eligible providers are in health cool-down",
            ));
        }
        Ok((candidates, table_choice, complexity))
    }

    fn completion_request(&self, request: &RouteRequest, model: String) -> CompletionRequest {
        CompletionRequest {
            messages: request.messages.clone(),
            model,
            temperature: None,
            max_tokens: None,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.clone())
            },
        }
    }

    /// Route and execute a non-streaming completion.
    pub async fn route_query(
        &self,
        request: &RouteRequest,
        principal: &Principal,
    ) -> Result<ChatResponse> {
        let (candidates, table_choice, complexity) = self.plan(request, principal)?;
        debug!(
            agent = %request.agent,
            complexity = ?complexity,
            table_provider = %table_choice.provider,
            "routing query"
        );

        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        for provider in candidates {
            let model = self.model_for(provider.name(), &table_choice);
            let completion = self.completion_request(request, model.clone());
            let started = Instant::now();

            match self.call_with_retry(provider.as_ref(), &completion).await {
                Ok(mut response) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_duration("llm_response_time_ms", started.elapsed());
                        metrics.incr("llm_requests");
                    }
                    self.usage.record(provider.name(), &model, &response.usage);
                    self.health.record_success(provider.name());
                    response.provider = provider.name().to_string();
                    return Ok(response);
                }
                // malformed input will fail identically everywhere; surface it
                Err(err @ Error::Validation(_)) => return Err(err),
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "provider failed; falling through");
                    self.health.record_failure(provider.name());
                    if let Some(metrics) = &self.metrics {
                        metrics.incr("llm_provider_failures");
                    }
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Err(Error::ExhaustedProviders { attempts })
    }

    /// One in-provider retry with a short backoff, for retryable errors.
    async fn call_with_retry(
        &self,
        provider: &dyn ChatProvider,
        request: &CompletionRequest,
    ) -> Result<ChatResponse> {
        match provider.complete(request).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_retryable() => {
                debug!(provider = provider.name(), error = %err, "retrying within provider");
                tokio::time::sleep(IN_PROVIDER_RETRY_DELAY).await;
                provider.complete(request).await
            }
            Err(err) => Err(err),
        }
    }

    /// Route and start a streaming completion.
    ///
    /// Fallback protects stream establishment only; once deltas flow, a
    /// failure surfaces in the stream. Cancelling the token ends the stream
    /// immediately and drops the provider connection; no further deltas are
    /// produced.
    pub async fn stream_query(
        &self,
        request: &RouteRequest,
        principal: &Principal,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let (candidates, table_choice, _) = self.plan(request, principal)?;

        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        for provider in candidates {
            let model = self.model_for(provider.name(), &table_choice);
            let completion = self.completion_request(request, model.clone());

            let inner = match provider.stream(&completion).await {
                Ok(stream) => stream,
                Err(err) if matches!(err, Error::Validation(_)) => return Err(err),
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "stream start failed; falling through");
                    self.health.record_failure(provider.name());
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            self.health.record_success(provider.name());
            info!(provider = provider.name(), model = %model, "stream established");
            return Ok(self.instrument_stream(inner, provider.name().to_string(), cancel));
        }

        Err(Error::ExhaustedProviders { attempts })
    }

    /// Wrap a provider stream with cancellation and usage accounting.
    fn instrument_stream(
        &self,
        mut inner: DeltaStream,
        provider: String,
        cancel: CancellationToken,
    ) -> DeltaStream {
        use futures::StreamExt;

        // detached streams outlive this call; hand them their own handle
        let usage = Arc::clone(&self.usage);
        let stream = async_stream::stream! {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!(provider = %provider, "stream cancelled by caller");
                        yield Err(Error::Cancelled);
                        break;
                    }
                    next = inner.next() => {
                        match next {
                            Some(Ok(delta)) => {
                                if let StreamDelta::Final(trailer) = &delta {
                                    usage.record(&trailer.provider, &trailer.model, &trailer.usage);
                                }
                                yield Ok(delta);
                            }
                            Some(Err(err)) => {
                                yield Err(err);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        };
        Box::pin(stream)
    }
}
