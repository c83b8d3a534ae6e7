//! Streaming Channel
//!
//! **Responsibility:**
//! Run executions for a WebSocket client and push their progress as JSON
//! frames while they happen.
//!
//! One connection runs at most one execution at a time. A second
//! `execute` frame while one is running is answered with an `error` frame
//! and the running execution carries on. Bad input never closes the
//! connection.
//!
//! The protocol logic lives in [`ChannelSession`], which knows nothing
//! about sockets; [`run_channel`] only moves text frames in and out.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use polyglot_common::types::{
    ChannelFrame, ChannelRequest, ExecutionEvent, FailureKind, Language,
};
use polyglot_engine::{ClientKey, Coordinator, ExecuteError, ExecutionStream};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ClientIdentity;
use crate::{metrics, AppState};

pub const BUSY_MESSAGE: &str = "an execution is already in progress on this connection";

enum SessionState {
    Idle,
    Executing {
        execution_id: Uuid,
        language: Language,
        stream: ExecutionStream,
    },
}

/// Per-connection protocol state machine
pub struct ChannelSession {
    coordinator: Coordinator,
    client: ClientKey,
    state: SessionState,
}

impl ChannelSession {
    pub fn new(coordinator: Coordinator, client: ClientKey) -> Self {
        Self {
            coordinator,
            client,
            state: SessionState::Idle,
        }
    }

    pub fn is_executing(&self) -> bool {
        matches!(self.state, SessionState::Executing { .. })
    }

    pub fn current_execution(&self) -> Option<Uuid> {
        match &self.state {
            SessionState::Executing { execution_id, .. } => Some(*execution_id),
            SessionState::Idle => None,
        }
    }

    /// Handle one inbound text frame; returns a frame to send back
    /// immediately, if any. Execution progress arrives via
    /// [`ChannelSession::next_frame`].
    pub async fn handle_text(&mut self, text: &str) -> Option<ChannelFrame> {
        let request = match serde_json::from_str::<ChannelRequest>(text) {
            Ok(ChannelRequest::Execute(request)) => request,
            Err(e) => {
                debug!(client = %self.client, error = %e, "Rejected channel frame");
                return Some(ChannelFrame::error(format!("invalid message: {}", e)));
            }
        };

        if self.is_executing() {
            return Some(ChannelFrame::error(BUSY_MESSAGE));
        }

        match self.coordinator.execute_streaming(&self.client, request).await {
            Ok(stream) => {
                self.state = SessionState::Executing {
                    execution_id: stream.execution_id,
                    language: stream.language,
                    stream,
                };
                None
            }
            Err(e) => {
                if matches!(e, ExecuteError::RateLimited { .. }) {
                    metrics::RATE_LIMITED_TOTAL.inc();
                }
                Some(match e {
                    ExecuteError::UnsupportedLanguage { ref supported, .. } => {
                        ChannelFrame::unsupported_language(e.to_string(), supported.clone())
                    }
                    e => ChannelFrame::error(e.to_string()),
                })
            }
        }
    }

    /// Binary frames are not part of the protocol
    pub fn handle_binary(&self) -> ChannelFrame {
        ChannelFrame::error("binary frames are not supported")
    }

    /// Next progress frame of the running execution. Never resolves while
    /// idle. Returns to idle after the terminal frame.
    pub async fn next_frame(&mut self) -> ChannelFrame {
        let SessionState::Executing {
            execution_id,
            language,
            stream,
        } = &mut self.state
        else {
            return std::future::pending().await;
        };
        let (execution_id, language) = (*execution_id, *language);

        let frame = match stream.next().await {
            Some(event) => {
                match &event {
                    ExecutionEvent::Completed {
                        failure_kind,
                        execution_time_ms,
                        ..
                    } => metrics::observe_execution(language, *failure_kind, *execution_time_ms),
                    ExecutionEvent::Failed { .. } => {
                        metrics::observe_execution(language, Some(FailureKind::Spawn), 0)
                    }
                    _ => {}
                }
                ChannelFrame::from(event)
            }
            // Producer vanished without a terminal event
            None => ChannelFrame::Error {
                error: "execution ended unexpectedly".to_string(),
                execution_id: Some(execution_id),
                supported_languages: None,
            },
        };

        if frame.is_terminal() {
            self.state = SessionState::Idle;
        }
        frame
    }
}

/// GET /execute/ws - Upgrade to the streaming channel
pub async fn channel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ClientIdentity(client): ClientIdentity,
) -> Response {
    let coordinator = state.coordinator.clone();
    ws.on_upgrade(move |socket| run_channel(socket, coordinator, client))
}

enum Incoming {
    Client(Option<Result<Message, axum::Error>>),
    Progress(ChannelFrame),
}

async fn run_channel(socket: WebSocket, coordinator: Coordinator, client: ClientKey) {
    metrics::ACTIVE_CHANNELS.inc();
    info!(client = %client, "Channel opened");

    let (mut sender, mut receiver) = socket.split();
    let mut session = ChannelSession::new(coordinator, client.clone());

    loop {
        let incoming = tokio::select! {
            message = receiver.next() => Incoming::Client(message),
            frame = session.next_frame() => Incoming::Progress(frame),
        };

        let reply = match incoming {
            Incoming::Progress(frame) => Some(frame),
            Incoming::Client(Some(Ok(Message::Text(text)))) => session.handle_text(&text).await,
            Incoming::Client(Some(Ok(Message::Binary(_)))) => Some(session.handle_binary()),
            Incoming::Client(Some(Ok(Message::Close(_)))) | Incoming::Client(None) => break,
            // Ping/pong are answered by axum
            Incoming::Client(Some(Ok(_))) => None,
            Incoming::Client(Some(Err(e))) => {
                debug!(client = %client, error = %e, "Channel receive failed");
                break;
            }
        };

        let Some(frame) = reply else {
            continue;
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode channel frame");
                continue;
            }
        };
        if sender.send(Message::Text(text)).await.is_err() {
            break;
        }
    }

    if let Some(execution_id) = session.current_execution() {
        // Runs on to its own timeout; the result still lands in history
        info!(client = %client, %execution_id, "Channel closed during execution");
    }
    metrics::ACTIVE_CHANNELS.dec();
    info!(client = %client, "Channel closed");
}
