//! HTTP surface: the `/ws` endpoint and a health probe.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use callsheet_cache::Cache;
use callsheet_graph::GraphStore;

use crate::frames::{InboundFrame, OutboundFrame, SequencedFrame};
use crate::session::{overflow_error_frame, SeqCounter, Session, SessionHandles};

/// Budget for one socket write before the client counts as gone.
const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Application state shared by the handlers.
pub struct AppState {
    pub handles: Arc<SessionHandles>,
    pub cache: Arc<dyn Cache>,
    pub graph: Arc<dyn GraphStore>,
    pub buffer_frames: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache_ok = state.cache.ping().await.is_ok();
    let graph_ok = state.graph.health().await;
    let status = if cache_ok && graph_ok { "healthy" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "cache": cache_ok,
        "graph": graph_ok,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One socket: a reader loop feeding the session and a single writer task
/// owning the sink and the sequence counter.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    state.handles.metrics.incr("websocket_connections");
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(state.buffer_frames);

    let mut session = Session::new(Arc::clone(&state.handles), out_tx);
    let session_cancel = session.session_cancel.clone();

    let writer_metrics = Arc::clone(&state.handles.metrics);
    let writer = tokio::spawn(async move {
        let mut seq = SeqCounter::new();
        loop {
            tokio::select! {
                biased;
                () = session_cancel.cancelled() => {
                    // best effort: tell the client why before closing
                    let frame = SequencedFrame { frame: overflow_error_frame(), seq: seq.assign() };
                    let _ = tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(frame.to_json()))).await;
                    let _ = sink.close().await;
                    return;
                }
                next = out_rx.recv() => {
                    let Some(frame) = next else {
                        let _ = sink.close().await;
                        return;
                    };
                    let sequenced = SequencedFrame { frame, seq: seq.assign() };
                    match tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(sequenced.to_json()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(error = %e, "socket write failed; closing");
                            return;
                        }
                        Err(_) => {
                            writer_metrics.incr("websocket_send_timeouts");
                            warn!("socket write timed out; closing");
                            return;
                        }
                    }
                }
            }
        }
    });

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "socket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => match InboundFrame::parse(&text) {
                Ok(frame) => session.handle_frame(frame).await,
                Err(reason) => {
                    debug!(reason, "rejecting malformed frame");
                    session.reject("validation", reason);
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
        if session.session_cancel.is_cancelled() {
            break;
        }
    }

    session.shutdown().await;
    let _ = writer.await;
    info!("websocket session closed");
}
