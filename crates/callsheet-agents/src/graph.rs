//! The per-agent state machine.
//!
//! One executor advances every agent variant through the fixed node
//! sequence, checkpointing after each node:
//!
//! ```text
//! START -> initialize -> load_memory -> classify
//!       -> (route_tools <-> call_llm)* -> respond -> persist -> END
//! ```
//!
//! Any node failure lands in an error terminal that yields a generic
//! user-visible message; partial tool failures stay in-band as error
//! envelopes the model can see.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use callsheet_cache::TaskQueue;
use callsheet_core::error::{correlation_id, Error, Result};
use callsheet_core::message::{
    AgentKind, ChatMessage, MessageRole, TokenUsage, ToolCall, Turn, TurnStatus,
};
use callsheet_core::metrics::Metrics;
use callsheet_core::principal::Principal;
use callsheet_memory::worker::ExtractionTask;
use callsheet_memory::{
    Checkpoint, CheckpointStore, ConversationStore, MemoryContextCache, MemoryManager,
};
use callsheet_router::{LlmRouter, RouteRequest, StreamDelta};
use callsheet_tools::ToolRegistry;
use futures::StreamExt;

use crate::profile::AgentProfile;
use crate::state::{AgentNode, AgentState, RecordedLlmCall, TurnPlan};

/// Bound on `(route_tools -> call_llm)` rounds per turn.
pub const MAX_TOOL_ROUNDS: u32 = 6;

/// Prior turns replayed into the prompt.
const HISTORY_WINDOW: usize = 20;

/// Turn-count multiple at which the conversation summary refreshes.
const SUMMARY_EVERY_TURNS: usize = 10;

const GENERIC_FAILURE: &str =
    "Something went wrong while processing your request. Please try again.";

/// Events surfaced to the session while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Delta { content: String },
}

/// The finished turn, as returned to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub content: String,
    pub agent: AgentKind,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cancelled: bool,
    pub tool_calls: Vec<ToolCall>,
}

/// One inbound turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub principal: Principal,
    pub content: String,
    pub preferred_provider: Option<String>,
    /// When false the agent neither checkpoints nor persists; used for
    /// multi-agent fan-out where the orchestrator records the merged turn.
    pub record: bool,
}

impl TurnRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        principal: Principal,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            principal,
            content: content.into(),
            preferred_provider: None,
            record: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.record = false;
        self
    }
}

/// Shared collaborators, injected once and handed to every agent.
pub struct AgentDeps {
    pub registry: Arc<ToolRegistry>,
    pub router: Arc<LlmRouter>,
    pub memory: Arc<MemoryManager>,
    pub context_cache: MemoryContextCache,
    pub conversations: ConversationStore,
    pub checkpoints: Arc<CheckpointStore<AgentState>>,
    pub queue: TaskQueue,
    pub metrics: Arc<Metrics>,
}

/// One agent variant: the shared executor specialized by a profile.
pub struct AgentGraph {
    profile: AgentProfile,
    deps: Arc<AgentDeps>,
}

impl AgentGraph {
    pub fn new(profile: AgentProfile, deps: Arc<AgentDeps>) -> Self {
        Self { profile, deps }
    }

    pub fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    /// Run one turn. Node failures produce a generic reply rather than an
    /// error; only ownership violations propagate as `Err`.
    pub async fn run(
        &self,
        request: &TurnRequest,
        events: Option<mpsc::Sender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> Result<AgentReply> {
        let mut state = AgentState::new(
            request.conversation_id.clone(),
            request.principal.id.clone(),
            self.profile.kind,
        );
        state.record = request.record;

        match self
            .drive(&mut state, request, events.as_ref(), &cancel)
            .await
        {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                state.cancelled = true;
                if request.record {
                    self.persist(&mut state, request, TurnStatus::Cancelled).await;
                }
            }
            Err(Error::Forbidden(msg)) => return Err(Error::Forbidden(msg)),
            Err(err) => {
                let correlation = correlation_id();
                error!(
                    conversation_id = %request.conversation_id,
                    agent = %self.profile.kind,
                    correlation_id = %correlation,
                    error = %err,
                    "agent turn failed"
                );
                self.deps.metrics.incr("agent_turn_failures");
                state.final_text = Some(GENERIC_FAILURE.to_string());
                if request.record {
                    self.persist(&mut state, request, TurnStatus::Error).await;
                }
            }
        }

        Ok(AgentReply {
            content: state.final_text.clone().unwrap_or_default(),
            agent: self.profile.kind,
            provider: state.provider().map(str::to_string),
            model: state.model().map(str::to_string),
            usage: state.usage,
            cancelled: state.cancelled,
            tool_calls: state.executed_tool_calls.clone(),
        })
    }

    /// The happy path through the node sequence.
    async fn drive(
        &self,
        state: &mut AgentState,
        request: &TurnRequest,
        events: Option<&mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.initialize(state, request).await?;
        self.checkpoint(state, AgentNode::LoadMemory).await;
        self.guard(cancel)?;

        self.load_memory(state, request).await;
        self.checkpoint(state, AgentNode::Classify).await;
        self.guard(cancel)?;

        let definitions = self
            .deps
            .registry
            .definitions_for(&request.principal, Some(self.profile.allowed_tools))
            .await;
        self.classify(state, &definitions);
        self.checkpoint(state, AgentNode::CallLlm).await;
        self.guard(cancel)?;

        match state.plan.unwrap_or(TurnPlan::DirectAnswer) {
            TurnPlan::ToolAugmented => {
                self.tool_loop(state, request, &definitions, events, cancel)
                    .await?;
            }
            TurnPlan::DirectAnswer | TurnPlan::Clarify => {
                let call = self
                    .call_llm_streaming(state, request, events, cancel)
                    .await?;
                state.messages.push(ChatMessage::assistant(call.content.clone()));
                state.usage.add(&call.usage);
                state.llm_calls.push(call);
                self.checkpoint(state, AgentNode::Respond).await;
            }
        }
        self.guard(cancel)?;

        self.respond(state, request);

        if request.record {
            self.persist(state, request, TurnStatus::Complete).await;
        }
        Ok(())
    }

    fn guard(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn checkpoint(&self, state: &mut AgentState, next: AgentNode) {
        state.node = next;
        if !state.record {
            return;
        }
        let snapshot = Checkpoint::new(state.conversation_id.clone(), state.step, state.clone());
        if let Err(e) = self.deps.checkpoints.save(&snapshot).await {
            // a lost checkpoint degrades resumption, not the live turn
            warn!(conversation_id = %state.conversation_id, step = state.step, error = %e, "checkpoint save failed");
        }
        state.step += 1;
    }

    /// Hydrate conversation context and the system prompt.
    async fn initialize(&self, state: &mut AgentState, request: &TurnRequest) -> Result<()> {
        let conversation = self
            .deps
            .conversations
            .load_or_create(&request.conversation_id, &request.principal.id)
            .await?;

        // checkpoint steps continue across turns of the same conversation
        if let Some(latest) = self.deps.checkpoints.latest(&request.conversation_id).await? {
            state.step = latest.step + 1;
        }

        state.messages.push(ChatMessage::system(self.profile.system_prompt));
        if let Some(summary) = &conversation.summary {
            state
                .messages
                .push(ChatMessage::system(format!("Conversation so far: {summary}")));
        }
        for turn in conversation
            .turns
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .filter(|t| matches!(t.role, MessageRole::User | MessageRole::Assistant))
        {
            state.messages.push(ChatMessage {
                role: turn.role,
                content: turn.content.clone(),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        state.messages.push(ChatMessage::user(request.content.clone()));
        debug!(conversation_id = %request.conversation_id, agent = %self.profile.kind, "turn initialized");
        Ok(())
    }

    /// Attach top-k relevant memories as a synthesized system message.
    /// Memory loss degrades quality, never the turn.
    async fn load_memory(&self, state: &mut AgentState, request: &TurnRequest) {
        let cached = self
            .deps
            .context_cache
            .get(&request.conversation_id)
            .await
            .unwrap_or_default();

        let mut recalls = match cached {
            Some(recalls) => recalls,
            None => match self
                .deps
                .memory
                .search(
                    &request.principal.id,
                    &request.content,
                    self.profile.memory_top_k * 2,
                    None,
                )
                .await
            {
                Ok(recalls) => {
                    if let Err(e) = self
                        .deps
                        .context_cache
                        .put(&request.conversation_id, &recalls)
                        .await
                    {
                        debug!(error = %e, "memory context cache write failed");
                    }
                    recalls
                }
                Err(e) => {
                    warn!(error = %e, "memory recall failed; continuing without");
                    Vec::new()
                }
            },
        };

        // agent-specific weighting over memory types
        for recall in &mut recalls {
            recall.score *= f64::from(self.profile.memory_weights.weight_for(recall.memory_type));
        }
        recalls.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        recalls.truncate(self.profile.memory_top_k);

        if !recalls.is_empty() {
            let rendered = recalls
                .iter()
                .map(|r| format!("- {}", r.summary))
                .collect::<Vec<_>>()
                .join("\n");
            state.messages.insert(
                1,
                ChatMessage::system(format!("Relevant things you know about this user:\n{rendered}")),
            );
        }
        state.memories = recalls;
    }

    /// Decide between direct answer, tool-augmented, and clarify.
    fn classify(&self, state: &mut AgentState, definitions: &[callsheet_core::message::ToolDefinition]) {
        let trimmed = state
            .messages
            .last()
            .map(|m| m.content.trim())
            .unwrap_or_default();
        let plan = if trimmed.chars().count() < 2 {
            TurnPlan::Clarify
        } else if !definitions.is_empty() {
            TurnPlan::ToolAugmented
        } else {
            TurnPlan::DirectAnswer
        };
        debug!(plan = ?plan, "turn classified");
        state.plan = Some(plan);
    }

    /// The bounded `(call_llm -> route_tools)` loop.
    async fn tool_loop(
        &self,
        state: &mut AgentState,
        request: &TurnRequest,
        definitions: &[callsheet_core::message::ToolDefinition],
        events: Option<&mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            self.guard(cancel)?;

            let call = self
                .call_llm_once(state, request, Some(definitions.to_vec()))
                .await?;
            // a cancel that landed mid-call must not leak further deltas
            self.guard(cancel)?;
            state.usage.add(&call.usage);

            if call.tool_calls.is_empty() || state.tool_rounds >= MAX_TOOL_ROUNDS {
                if state.tool_rounds >= MAX_TOOL_ROUNDS && !call.tool_calls.is_empty() {
                    warn!(
                        conversation_id = %state.conversation_id,
                        "tool budget exhausted with calls still pending"
                    );
                }
                state.messages.push(ChatMessage::assistant(call.content.clone()));
                if let (Some(events), false) = (events, call.content.is_empty()) {
                    // the emitted chunk must match the redaction applied to
                    // the final text
                    let content = if request.principal.data_access_level < 4 {
                        scrub_currency_amounts(&call.content)
                    } else {
                        call.content.clone()
                    };
                    let _ = events.send(AgentEvent::Delta { content }).await;
                }
                state.llm_calls.push(call);
                self.checkpoint(state, AgentNode::Respond).await;
                return Ok(());
            }

            state.pending_tool_calls = call.tool_calls.clone();
            state.messages.push(ChatMessage::assistant_with_tool_calls(
                call.content.clone(),
                call.tool_calls.clone(),
            ));
            state.llm_calls.push(call);
            self.checkpoint(state, AgentNode::RouteTools).await;
            self.guard(cancel)?;

            // bounded-parallel tool execution; failures stay in-band
            let pending = std::mem::take(&mut state.pending_tool_calls);
            let outcomes = self.deps.registry.call_many(&pending, &request.principal).await?;
            for outcome in outcomes {
                state.executed_tool_calls.push(outcome.call.clone());
                state
                    .messages
                    .push(ChatMessage::tool(outcome.call.id.clone(), &outcome.result));
            }
            state.tool_rounds += 1;
            self.checkpoint(state, AgentNode::CallLlm).await;
        }
    }

    async fn call_llm_once(
        &self,
        state: &AgentState,
        request: &TurnRequest,
        tools: Option<Vec<callsheet_core::message::ToolDefinition>>,
    ) -> Result<RecordedLlmCall> {
        let mut route = RouteRequest::new(state.messages.clone(), self.profile.kind);
        if let Some(tools) = tools {
            route = route.with_tools(tools);
        }
        if let Some(preferred) = &request.preferred_provider {
            route = route.with_preferred_provider(preferred.clone());
        }

        let response = self.deps.router.route_query(&route, &request.principal).await?;
        Ok(RecordedLlmCall {
            content: response.content,
            tool_calls: response.tool_calls,
            provider: response.provider,
            model: response.model,
            usage: response.usage,
        })
    }

    /// Streaming call for direct answers; deltas are forwarded as they
    /// arrive and the assembled call is recorded for replay.
    async fn call_llm_streaming(
        &self,
        state: &mut AgentState,
        request: &TurnRequest,
        events: Option<&mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<RecordedLlmCall> {
        if state.plan == Some(TurnPlan::Clarify) {
            state.messages.push(ChatMessage::system(
                "The user's message is too vague to act on. Ask one short clarifying question.",
            ));
        }

        let mut route = RouteRequest::new(state.messages.clone(), self.profile.kind);
        if let Some(preferred) = &request.preferred_provider {
            route = route.with_preferred_provider(preferred.clone());
        }

        let mut stream = self
            .deps
            .router
            .stream_query(&route, &request.principal, cancel.child_token())
            .await?;

        let mut call = RecordedLlmCall::default();
        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::Content(chunk) => {
                    call.content.push_str(&chunk);
                    if let Some(events) = events {
                        let _ = events.send(AgentEvent::Delta { content: chunk }).await;
                    }
                }
                StreamDelta::ToolCall(tool_call) => call.tool_calls.push(tool_call),
                StreamDelta::Final(trailer) => {
                    call.provider = trailer.provider;
                    call.model = trailer.model;
                    call.usage = trailer.usage;
                }
            }
        }
        Ok(call)
    }

    /// Finalize output with a defensive redaction pass.
    fn respond(&self, state: &mut AgentState, request: &TurnRequest) {
        let mut text = state
            .last_llm_call()
            .map(|call| call.content.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            text = "I wasn't able to find an answer for that.".to_string();
        }
        if request.principal.data_access_level < 4 {
            text = scrub_currency_amounts(&text);
        }
        state.final_text = Some(text);
    }

    /// Write the assistant turn, checkpoint, and enqueue extraction. Memory
    /// writes are causally after the persisted turn.
    async fn persist(&self, state: &mut AgentState, request: &TurnRequest, status: TurnStatus) {
        let content = state.final_text.clone().unwrap_or_default();

        let mut conversation = match self
            .deps
            .conversations
            .load_or_create(&request.conversation_id, &request.principal.id)
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                error!(error = %e, "persist could not load conversation");
                return;
            }
        };
        conversation.agent_affinity = Some(self.profile.kind);
        conversation.archived_at = None;
        conversation.push_turn(Turn::user(request.content.clone()));

        let mut turn = Turn::assistant(content.clone());
        turn.status = status;
        turn.usage = Some(state.usage);
        turn.provider = state.provider().map(str::to_string);
        turn.tool_calls = state.executed_tool_calls.clone();
        conversation.push_turn(turn);

        if let Err(e) = self.deps.conversations.save(&conversation).await {
            error!(error = %e, "persist failed to save conversation");
            return;
        }

        self.checkpoint(state, AgentNode::Persist).await;

        // extraction strictly after the turn is durable
        if status == TurnStatus::Complete {
            let turn_index = conversation.turns.len().saturating_sub(1);
            let task = ExtractionTask {
                conversation_id: request.conversation_id.clone(),
                user_id: request.principal.id.clone(),
                data_access_level: request.principal.data_access_level,
                turn_refs: vec![
                    format!("{}:{}", request.conversation_id, turn_index.saturating_sub(1)),
                    format!("{}:{turn_index}", request.conversation_id),
                ],
                content: format!("user: {}\nassistant: {content}", request.content),
            };
            match task.into_background_task() {
                Ok(background) => {
                    if let Err(e) = self.deps.queue.enqueue(&background).await {
                        warn!(error = %e, "extraction enqueue failed");
                    }
                }
                Err(e) => warn!(error = %e, "extraction task build failed"),
            }

            self.maybe_refresh_summary(&mut conversation, request).await;
        }

        info!(
            conversation_id = %request.conversation_id,
            agent = %self.profile.kind,
            status = ?status,
            tool_rounds = state.tool_rounds,
            "turn persisted"
        );
    }

    /// Opportunistic summary refresh every N turns; never fatal.
    async fn maybe_refresh_summary(
        &self,
        conversation: &mut callsheet_core::message::Conversation,
        request: &TurnRequest,
    ) {
        if conversation.turns.is_empty() || conversation.turns.len() % SUMMARY_EVERY_TURNS != 0 {
            return;
        }

        let transcript = conversation
            .turns
            .iter()
            .rev()
            .take(SUMMARY_EVERY_TURNS)
            .rev()
            .map(|t| format!("{}: {}", t.role.as_str(), t.content))
            .collect::<Vec<_>>()
            .join("\n");
        let route = RouteRequest::new(
            vec![
                ChatMessage::system(
                    "Summarize this conversation in at most three sentences, keeping named people, \
                     organizations, and decisions.",
                ),
                ChatMessage::user(transcript),
            ],
            self.profile.kind,
        );

        match self.deps.router.route_query(&route, &request.principal).await {
            Ok(response) => {
                conversation.summary = Some(response.content);
                if let Err(e) = self.deps.conversations.save(conversation).await {
                    debug!(error = %e, "summary save failed");
                }
            }
            Err(e) => debug!(error = %e, "summary refresh skipped"),
        }
    }
}

/// Replace `$`-prefixed amounts (e.g. `$500,000`, `$2.5M`) with the
/// redaction sentinel. Backstop for principals below the budget-visibility
/// level, applied after tool-level redaction.
pub fn scrub_currency_amounts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().map_or(false, |n| n.is_ascii_digit()) {
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() || next == ',' || next == '.' {
                    chars.next();
                } else if matches!(next, 'k' | 'K' | 'm' | 'M' | 'b' | 'B') {
                    chars.next();
                    break;
                } else {
                    break;
                }
            }
            out.push_str("[redacted]");
        } else {
            out.push(c);
        }
    }
    out
}
