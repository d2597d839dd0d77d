//! The supervisor: classify, dispatch, merge, persist.
//!
//! The orchestrator owns agent lifetimes, serializes dispatch per
//! conversation, cascades cancellation into everything it starts, and in
//! multi-agent mode records the single merged turn itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callsheet_core::error::{Error, Result};
use callsheet_core::message::{AgentKind, ChatMessage, TokenUsage, Turn, TurnStatus};
use callsheet_core::principal::Principal;
use callsheet_memory::worker::ExtractionTask;
use callsheet_router::RouteRequest;

use crate::classifier::{classify, CONFIDENCE_THRESHOLD};
use crate::graph::{scrub_currency_amounts, AgentDeps, AgentEvent, AgentGraph, AgentReply, TurnRequest};
use crate::profile::profiles;

/// Agents running in parallel in multi-agent mode (spec cap is 3; the
/// classifier currently surfaces at most one runner-up).
pub const AGENT_FANOUT: usize = 2;

/// Budget for each fanned-out agent before it is labeled unavailable.
const FANOUT_AGENT_TIMEOUT: Duration = Duration::from_secs(60);

/// One inbound user message.
#[derive(Debug, Clone)]
pub struct OrchestratorRequest {
    pub principal: Principal,
    /// Absent for the first turn of a new conversation.
    pub conversation_id: Option<String>,
    pub content: String,
    pub agent_preference: Option<AgentKind>,
    pub preferred_provider: Option<String>,
}

/// The finished turn plus routing attribution.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorReply {
    pub conversation_id: String,
    pub content: String,
    /// "sales" | "talent" | "analytics" | "multi"
    pub agent_label: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cancelled: bool,
    pub tool_calls: Vec<callsheet_core::message::ToolCall>,
}

pub struct Orchestrator {
    agents: HashMap<AgentKind, AgentGraph>,
    deps: Arc<AgentDeps>,
    /// Per-conversation dispatch serialization.
    dispatch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(deps: Arc<AgentDeps>) -> Self {
        let agents = profiles()
            .into_iter()
            .map(|(kind, profile)| (kind, AgentGraph::new(profile, Arc::clone(&deps))))
            .collect();
        Self {
            agents,
            deps,
            dispatch_locks: DashMap::new(),
        }
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .dispatch_locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Handle one user message end to end. Deltas stream through `events`;
    /// the returned reply is the terminal frame's payload.
    pub async fn handle_message(
        &self,
        request: OrchestratorRequest,
        events: Option<mpsc::Sender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> Result<OrchestratorReply> {
        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // assistant turns are totally ordered within a conversation
        let lock = self.conversation_lock(&conversation_id);
        let _guard = lock.lock().await;

        let (primary, runner_up) = self.route(&request, &cancel).await;
        self.deps.metrics.incr("orchestrator_messages");

        match runner_up {
            Some(secondary) if request.agent_preference.is_none() => {
                self.dispatch_multi(
                    &conversation_id,
                    &request,
                    [primary, secondary],
                    events,
                    cancel,
                )
                .await
            }
            _ => {
                self.dispatch_single(&conversation_id, &request, primary, events, cancel)
                    .await
            }
        }
    }

    /// Pick the primary agent (and a runner-up for contested queries).
    async fn route(
        &self,
        request: &OrchestratorRequest,
        cancel: &CancellationToken,
    ) -> (AgentKind, Option<AgentKind>) {
        if let Some(preference) = request.agent_preference {
            return (preference, None);
        }

        let classification = classify(&request.content);
        debug!(
            agent = %classification.agent,
            confidence = classification.confidence,
            "rule classification"
        );

        if classification.confidence >= CONFIDENCE_THRESHOLD || cancel.is_cancelled() {
            return (classification.agent, classification.contested_runner_up());
        }

        // low confidence: one small LLM call; the rule result wins a tie or
        // any failure
        let llm_choice = self.llm_classify(request).await;
        match llm_choice {
            Some(choice) if choice != classification.agent => (choice, None),
            _ => (classification.agent, classification.contested_runner_up()),
        }
    }

    async fn llm_classify(&self, request: &OrchestratorRequest) -> Option<AgentKind> {
        let route = RouteRequest::new(
            vec![
                ChatMessage::system(
                    "Classify the user's query for routing. Reply with exactly one word: \
                     sales, talent, or analytics.",
                ),
                ChatMessage::user(request.content.clone()),
            ],
            AgentKind::Sales,
        );
        match self.deps.router.route_query(&route, &request.principal).await {
            Ok(response) => {
                let word = response.content.trim().to_lowercase();
                let parsed = AgentKind::parse(word.as_str());
                debug!(raw = %word, parsed = ?parsed, "llm classification");
                parsed
            }
            Err(e) => {
                warn!(error = %e, "llm classification failed; using rule result");
                None
            }
        }
    }

    async fn dispatch_single(
        &self,
        conversation_id: &str,
        request: &OrchestratorRequest,
        agent: AgentKind,
        events: Option<mpsc::Sender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> Result<OrchestratorReply> {
        let graph = self
            .agents
            .get(&agent)
            .ok_or_else(|| Error::internal(format!("no agent registered for {agent}")))?;

        let mut turn = TurnRequest::new(
            conversation_id,
            request.principal.clone(),
            request.content.clone(),
        );
        turn.preferred_provider = request.preferred_provider.clone();

        let reply = graph.run(&turn, events, cancel).await?;
        Ok(self.to_reply(conversation_id, reply.agent.as_str().to_string(), reply))
    }

    /// Fan out to two agents, merge with a supervisor call, persist once.
    async fn dispatch_multi(
        &self,
        conversation_id: &str,
        request: &OrchestratorRequest,
        kinds: [AgentKind; AGENT_FANOUT],
        events: Option<mpsc::Sender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> Result<OrchestratorReply> {
        info!(agents = ?kinds, conversation_id, "multi-agent dispatch");

        let runs = kinds.map(|kind| {
            let turn = TurnRequest::new(
                conversation_id,
                request.principal.clone(),
                request.content.clone(),
            )
            .quiet();
            let cancel = cancel.child_token();
            async move {
                let Some(graph) = self.agents.get(&kind) else {
                    return (kind, None);
                };
                match tokio::time::timeout(FANOUT_AGENT_TIMEOUT, graph.run(&turn, None, cancel)).await
                {
                    Ok(Ok(reply)) if !reply.cancelled => (kind, Some(reply)),
                    Ok(Ok(_)) => (kind, None),
                    Ok(Err(e)) => {
                        warn!(agent = %kind, error = %e, "fanned-out agent failed");
                        (kind, None)
                    }
                    Err(_) => {
                        warn!(agent = %kind, "fanned-out agent timed out");
                        (kind, None)
                    }
                }
            }
        });
        let outcomes = futures::future::join_all(runs).await;

        if cancel.is_cancelled() {
            return Ok(OrchestratorReply {
                conversation_id: conversation_id.to_string(),
                content: String::new(),
                agent_label: "multi".to_string(),
                provider: None,
                model: None,
                usage: TokenUsage::default(),
                cancelled: true,
                tool_calls: Vec::new(),
            });
        }

        // late or failed agents contribute an "unavailable" label; the turn
        // only fails when nobody answered
        let mut contributions = Vec::new();
        let mut usage = TokenUsage::default();
        let mut tool_calls = Vec::new();
        let mut answered = 0usize;
        for (kind, outcome) in &outcomes {
            match outcome {
                Some(reply) => {
                    answered += 1;
                    usage.add(&reply.usage);
                    tool_calls.extend(reply.tool_calls.iter().cloned());
                    contributions.push(format!("[{kind}]\n{}", reply.content));
                }
                None => contributions.push(format!("[{kind}]\nunavailable")),
            }
        }
        if answered == 0 {
            return Err(Error::internal("all fanned-out agents failed"));
        }

        let (merged, provider, model, merge_usage) = self
            .supervisor_merge(request, &contributions)
            .await;
        usage.add(&merge_usage);

        let mut content = merged;
        if request.principal.data_access_level < 4 {
            content = scrub_currency_amounts(&content);
        }

        self.persist_merged(conversation_id, request, &content, provider.as_deref(), usage)
            .await;

        if let Some(events) = &events {
            let _ = events
                .send(AgentEvent::Delta {
                    content: content.clone(),
                })
                .await;
        }

        Ok(OrchestratorReply {
            conversation_id: conversation_id.to_string(),
            content,
            agent_label: "multi".to_string(),
            provider,
            model,
            usage,
            cancelled: false,
            tool_calls,
        })
    }

    /// Merge fanned-out contributions into one response. Falls back to a
    /// labeled concatenation when the supervisor call fails.
    async fn supervisor_merge(
        &self,
        request: &OrchestratorRequest,
        contributions: &[String],
    ) -> (String, Option<String>, Option<String>, TokenUsage) {
        let joined = contributions.join("\n\n");
        let route = RouteRequest::new(
            vec![
                ChatMessage::system(
                    "You are the supervisor for a team of specialist agents. Merge their \
                     contributions into one coherent answer for the user. Keep each \
                     specialist's findings attributed by its bracketed label, and state \
                     plainly when a specialist was unavailable. Do not invent facts.",
                ),
                ChatMessage::user(format!(
                    "User question: {}\n\nSpecialist contributions:\n{joined}",
                    request.content
                )),
            ],
            AgentKind::Analytics,
        );

        match self.deps.router.route_query(&route, &request.principal).await {
            Ok(response) => (
                response.content,
                Some(response.provider),
                Some(response.model),
                response.usage,
            ),
            Err(e) => {
                warn!(error = %e, "supervisor merge failed; concatenating contributions");
                (joined, None, None, TokenUsage::default())
            }
        }
    }

    /// Multi-agent turns are recorded once, by the orchestrator.
    async fn persist_merged(
        &self,
        conversation_id: &str,
        request: &OrchestratorRequest,
        content: &str,
        provider: Option<&str>,
        usage: TokenUsage,
    ) {
        let mut conversation = match self
            .deps
            .conversations
            .load_or_create(conversation_id, &request.principal.id)
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!(error = %e, "merged turn could not load conversation");
                return;
            }
        };
        conversation.archived_at = None;
        conversation.push_turn(Turn::user(request.content.clone()));

        let mut turn = Turn::assistant(content.to_string());
        turn.status = TurnStatus::Complete;
        turn.provider = provider.map(str::to_string);
        turn.usage = Some(usage);
        conversation.push_turn(turn);

        if let Err(e) = self.deps.conversations.save(&conversation).await {
            warn!(error = %e, "merged turn save failed");
            return;
        }

        let turn_index = conversation.turns.len().saturating_sub(1);
        let task = ExtractionTask {
            conversation_id: conversation_id.to_string(),
            user_id: request.principal.id.clone(),
            data_access_level: request.principal.data_access_level,
            turn_refs: vec![format!("{conversation_id}:{turn_index}")],
            content: format!("user: {}\nassistant: {content}", request.content),
        };
        if let Ok(background) = task.into_background_task() {
            if let Err(e) = self.deps.queue.enqueue(&background).await {
                warn!(error = %e, "extraction enqueue failed for merged turn");
            }
        }
    }

    fn to_reply(
        &self,
        conversation_id: &str,
        agent_label: String,
        reply: AgentReply,
    ) -> OrchestratorReply {
        OrchestratorReply {
            conversation_id: conversation_id.to_string(),
            content: reply.content,
            agent_label,
            provider: reply.provider,
            model: reply.model,
            usage: reply.usage,
            cancelled: reply.cancelled,
            tool_calls: reply.tool_calls,
        }
    }
}
