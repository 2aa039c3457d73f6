use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use vds_common::{AutonomyLevel, SessionStatus};

use crate::api::SharedState;
use crate::store::Message as SessionMessage;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after an unanswered ping that closes the connection.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    SessionCreated {
        session_id: String,
        title: String,
        autonomy: AutonomyLevel,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    StepStarted {
        session_id: String,
        index: usize,
        step_id: String,
    },
    CheckpointReached {
        session_id: String,
        index: usize,
        step_id: String,
    },
    StepCompleted {
        session_id: String,
        index: usize,
        step_id: String,
        artifacts: usize,
    },
    SessionCompleted {
        session_id: String,
        final_output: serde_json::Value,
    },
    SessionFailed {
        session_id: String,
        step_id: Option<String>,
        reason: String,
        error: String,
    },
    MessagePosted {
        message: SessionMessage,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.orchestrator.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

/// Forward session events to one client until either side goes away.
async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<String>) {
    let (mut outbound, mut inbound) = socket.split();
    let mut liveness = Liveness::new();
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;

    loop {
        let keep_going = tokio::select! {
            _ = ticker.tick() => match liveness.on_tick() {
                Some(ping) => outbound.send(ping).await.is_ok(),
                None => {
                    tracing::debug!("websocket client stopped answering pings");
                    false
                }
            },
            event = events.recv() => match event {
                Ok(json) => outbound.send(Message::Text(json.into())).await.is_ok(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "websocket client lagged behind session events");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => false,
            },
            frame = inbound.next() => match frame {
                Some(Ok(Message::Pong(_))) => {
                    liveness.on_pong();
                    true
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
                Some(Ok(_)) => true,
            },
        };
        if !keep_going {
            break;
        }
    }

    let _ = outbound.send(Message::Close(None)).await;
}

/// Ping bookkeeping for one connection.
struct Liveness {
    last_pong: Instant,
    ping_outstanding: bool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            ping_outstanding: false,
        }
    }

    /// The ping to send on this tick, or `None` once the client has gone
    /// quiet for longer than [`PONG_TIMEOUT`].
    fn on_tick(&mut self) -> Option<Message> {
        if self.ping_outstanding && self.last_pong.elapsed() > PONG_TIMEOUT {
            return None;
        }
        self.ping_outstanding = true;
        Some(Message::Ping(Default::default()))
    }

    fn on_pong(&mut self) {
        self.last_pong = Instant::now();
        self.ping_outstanding = false;
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Publish an event to every subscriber. Having no subscribers is fine.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize WsMessage");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
