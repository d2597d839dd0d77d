//! Per-connection session state machine.
//!
//! The socket glue in `server` feeds inbound frames to [`Session`] and
//! drains [`OutboundFrame`]s from the bounded channel through a single
//! writer task that assigns `seq`. The channel is the backpressure buffer:
//! when it fills, the session is torn down rather than queueing without
//! bound.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callsheet_agents::{AgentEvent, Orchestrator, OrchestratorRequest};
use callsheet_core::error::Error;
use callsheet_core::message::AgentKind;
use callsheet_core::metrics::Metrics;
use callsheet_core::principal::Principal;

use crate::auth::TokenVerifier;
use crate::frames::{AuthData, DeltaData, FinalData, InboundFrame, OutboundFrame};

/// Assigns the per-session sequence numbers; owned by the writer task, so
/// assignment is single-threaded and strictly increasing.
#[derive(Debug, Default)]
pub struct SeqCounter {
    next: u64,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn assign(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }
}

/// Shared collaborators every session needs.
pub struct SessionHandles {
    pub orchestrator: Arc<Orchestrator>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Arc<Metrics>,
}

struct ActiveTurn {
    conversation_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One authenticated (or not-yet-authenticated) websocket session.
pub struct Session {
    handles: Arc<SessionHandles>,
    out_tx: mpsc::Sender<OutboundFrame>,
    /// Tears down the whole session, cascading into any in-flight turn.
    pub session_cancel: CancellationToken,
    principal: Option<Principal>,
    active: Option<ActiveTurn>,
}

/// Enqueue a frame, tearing the session down on overflow (slow consumer).
fn send_or_close(
    out_tx: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
    session_cancel: &CancellationToken,
    metrics: &Metrics,
) {
    match out_tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics.incr("websocket_dropped_frames");
            warn!("outbound buffer full; dropping session");
            session_cancel.cancel();
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            session_cancel.cancel();
        }
    }
}

impl Session {
    pub fn new(handles: Arc<SessionHandles>, out_tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            handles,
            out_tx,
            session_cancel: CancellationToken::new(),
            principal: None,
            active: None,
        }
    }

    fn send(&self, frame: OutboundFrame) {
        send_or_close(&self.out_tx, frame, &self.session_cancel, &self.handles.metrics);
    }

    /// Surface a protocol-level rejection (e.g. a malformed frame).
    pub fn reject(&self, code: &str, message: impl Into<String>) {
        self.send(OutboundFrame::Error {
            code: code.to_string(),
            message: message.into(),
            conversation_id: None,
        });
    }

    fn turn_in_progress(&self) -> bool {
        self.active.as_ref().map_or(false, |turn| !turn.handle.is_finished())
    }

    /// Drive one inbound frame.
    pub async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Ping => self.send(OutboundFrame::Pong),
            InboundFrame::Auth { token } => self.handle_auth(&token).await,
            InboundFrame::UserMessage {
                conversation_id,
                content,
                agent_preference,
                metadata: _,
            } => {
                self.handle_user_message(conversation_id, content, agent_preference);
            }
            InboundFrame::Cancel { conversation_id } => self.handle_cancel(&conversation_id),
        }
    }

    async fn handle_auth(&mut self, token: &str) {
        match self.handles.verifier.verify(token).await {
            Ok(principal) => {
                info!(user_id = %principal.id, role = principal.role.as_str(), "session authenticated");
                self.send(OutboundFrame::AuthSuccess {
                    data: AuthData {
                        user_id: principal.id.clone(),
                        role: principal.role.as_str().to_string(),
                    },
                });
                self.principal = Some(principal);
            }
            Err(e) => {
                // fail closed, audit, let the client retry
                warn!(error = %e, "authentication failed");
                self.handles.metrics.incr("websocket_auth_failures");
                self.send(OutboundFrame::Error {
                    code: e.code().to_string(),
                    message: e.user_message(),
                    conversation_id: None,
                });
            }
        }
    }

    fn handle_user_message(
        &mut self,
        conversation_id: Option<String>,
        content: String,
        agent_preference: Option<String>,
    ) {
        let Some(principal) = self.principal.clone() else {
            self.send(OutboundFrame::Error {
                code: "unauthorized".to_string(),
                message: "authenticate before sending messages".to_string(),
                conversation_id,
            });
            return;
        };

        // one turn at a time per session
        if self.turn_in_progress() {
            self.send(OutboundFrame::Error {
                code: "busy".to_string(),
                message: "a turn is already in progress on this session".to_string(),
                conversation_id,
            });
            return;
        }

        let agent_preference = match agent_preference.as_deref() {
            None => None,
            Some(raw) => match AgentKind::parse(raw) {
                Some(kind) => Some(kind),
                None => {
                    self.send(OutboundFrame::Error {
                        code: "validation".to_string(),
                        message: format!("unknown agent preference: {raw}"),
                        conversation_id,
                    });
                    return;
                }
            },
        };

        let conversation_id =
            conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let turn_cancel = self.session_cancel.child_token();

        let request = OrchestratorRequest {
            principal,
            conversation_id: Some(conversation_id.clone()),
            content,
            agent_preference,
            preferred_provider: None,
        };

        let handles = Arc::clone(&self.handles);
        let out_tx = self.out_tx.clone();
        let session_cancel = self.session_cancel.clone();
        let cancel = turn_cancel.clone();
        let thread_id = conversation_id.clone();

        let handle = tokio::spawn(async move {
            let (delta_tx, mut delta_rx) = mpsc::channel::<AgentEvent>(64);

            // forward deltas as they arrive; the turn future runs alongside
            let forwarder = {
                let out_tx = out_tx.clone();
                let session_cancel = session_cancel.clone();
                let handles = Arc::clone(&handles);
                let thread_id = thread_id.clone();
                tokio::spawn(async move {
                    while let Some(AgentEvent::Delta { content }) = delta_rx.recv().await {
                        send_or_close(
                            &out_tx,
                            OutboundFrame::AssistantDelta {
                                conversation_id: thread_id.clone(),
                                data: DeltaData {
                                    content_chunk: content,
                                },
                            },
                            &session_cancel,
                            &handles.metrics,
                        );
                    }
                })
            };

            let result = handles
                .orchestrator
                .handle_message(request, Some(delta_tx), cancel)
                .await;
            // delta channel sender dropped above; drain before the final
            let _ = forwarder.await;

            let frame = match result {
                Ok(reply) => OutboundFrame::AssistantFinal {
                    conversation_id: thread_id.clone(),
                    data: FinalData {
                        content: reply.content,
                        agent_type: reply.agent_label,
                        provider: reply.provider,
                        model: reply.model,
                        usage: reply.usage,
                        cancelled: reply.cancelled,
                        tool_calls: reply.tool_calls,
                    },
                },
                Err(e) => {
                    let correlation = callsheet_core::error::correlation_id();
                    warn!(correlation_id = %correlation, error = %e, "turn failed");
                    OutboundFrame::Error {
                        code: e.code().to_string(),
                        message: e.user_message(),
                        conversation_id: Some(thread_id.clone()),
                    }
                }
            };
            send_or_close(&out_tx, frame, &session_cancel, &handles.metrics);
        });

        self.active = Some(ActiveTurn {
            conversation_id,
            cancel: turn_cancel,
            handle,
        });
    }

    fn handle_cancel(&mut self, conversation_id: &str) {
        match &self.active {
            Some(turn) if turn.conversation_id == conversation_id && !turn.handle.is_finished() => {
                debug!(conversation_id, "turn cancelled by client");
                turn.cancel.cancel();
            }
            _ => {
                // cancelling an idle conversation is a no-op status, not an
                // error
                self.send(OutboundFrame::Status {
                    data: serde_json::json!({
                        "conversation_id": conversation_id,
                        "state": "idle",
                    }),
                });
            }
        }
    }

    /// Abort everything this session started; called when the socket goes
    /// away or the writer tears down.
    pub async fn shutdown(&mut self) {
        self.session_cancel.cancel();
        if let Some(turn) = self.active.take() {
            turn.cancel.cancel();
            // give the turn a moment to record its cancelled state
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), turn.handle).await;
        }
    }
}

/// The error surfaced when tearing down a slow consumer.
pub fn overflow_error_frame() -> OutboundFrame {
    OutboundFrame::Error {
        code: Error::saturation("").code().to_string(),
        message: "session buffer overflow; closing".to_string(),
        conversation_id: None,
    }
}
