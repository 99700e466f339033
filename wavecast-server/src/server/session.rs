use axum::{
    extract::{
        Query, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response as AxumResponse},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{ChatManager, DenyCode, OUTBOUND_QUEUE_CAPACITY, OutboundSender, Verdict};
use crate::protocol::{Envelope, JoinData, MessageData, TypingData};

use super::handlers::AppState;

/// Writer emits a keep-alive ping this often.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(54);

/// Reader gives up when no frame (pong included) arrives within this window.
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Most-recent messages replayed to a joining user.
const JOIN_HISTORY_LIMIT: usize = 100;

/// WebSocket chat endpoint.
/// GET /api/chat?streamKey=STREAM_KEY
pub async fn chat_websocket(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> AxumResponse {
    let stream_id = params.get("streamKey").cloned().unwrap_or_default();
    if stream_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "streamKey query parameter required",
        )
            .into_response();
    }

    info!("chat connection requested for stream {}", stream_id);
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state.manager.clone(), stream_id))
}

/// Drive one chat connection: a writer task draining the bounded outbound
/// queue, and the reader loop dispatching inbound frames until the socket
/// closes, errors or goes silent past the read deadline.
async fn handle_chat_socket(socket: WebSocket, manager: Arc<ChatManager>, stream_id: String) {
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_CAPACITY);

    let writer = tokio::spawn(write_loop(ws_sender, rx));

    let mut session = Session {
        manager,
        stream_id,
        user_id: None,
        username: String::new(),
        outbound: tx,
    };
    session.read_loop(ws_receiver).await;
    session.cleanup();

    // dropping the session closes the outbound queue, which makes the writer
    // emit a close frame and exit
    drop(session);
    let _ = writer.await;
}

/// Drain the outbound queue onto the socket, pinging on the keep-alive timer.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    // the first tick completes immediately
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode outbound frame: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Server-side state for one socket. `stream_id` is bound at upgrade time;
/// `user_id` stays empty until a join is processed.
struct Session {
    manager: Arc<ChatManager>,
    stream_id: String,
    user_id: Option<String>,
    username: String,
    outbound: OutboundSender,
}

impl Session {
    async fn read_loop(&mut self, mut receiver: SplitStream<WebSocket>) {
        loop {
            // any inbound frame, pong included, resets the deadline
            let frame = match tokio::time::timeout(READ_DEADLINE, receiver.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!("socket error on stream {}: {}", self.stream_id, e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        "read deadline expired for user {:?} on stream {}",
                        self.user_id, self.stream_id
                    );
                    break;
                }
            };

            match frame {
                WsMessage::Text(text) => self.dispatch(&text),
                WsMessage::Close(_) => break,
                // ping/pong and binary frames only feed the deadline
                _ => {}
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.send(Envelope::error("Invalid message type"));
                return;
            }
        };

        match envelope.kind.as_str() {
            "join" => self.handle_join(envelope.data),
            "message" => self.handle_message(envelope.data),
            "typing" => self.handle_typing(envelope.data),
            _ => self.send(Envelope::error("Unknown message type")),
        }
    }

    fn handle_join(&mut self, data: Option<Value>) {
        if self.user_id.is_some() {
            self.send(Envelope::error("Already joined to chat"));
            return;
        }
        let join: JoinData = match serde_json::from_value(data.unwrap_or(Value::Null)) {
            Ok(join) => join,
            Err(_) => {
                self.send(Envelope::error("Invalid join data"));
                return;
            }
        };
        if join.user_id.is_empty() || join.username.is_empty() {
            self.send(Envelope::error("Missing userId or username"));
            return;
        }

        if let Err(e) = self
            .manager
            .add_user(&self.stream_id, &join.user_id, &join.username)
        {
            self.send(Envelope::error(e.code()));
            return;
        }

        self.user_id = Some(join.user_id.clone());
        self.username = join.username.clone();
        self.manager.register_session(
            &join.user_id,
            &self.stream_id,
            &join.username,
            self.outbound.clone(),
        );

        let history = self.manager.get_messages(&self.stream_id, JOIN_HISTORY_LIMIT);
        self.send(Envelope::event("history", json!(history)));
        let users = self.manager.get_users(&self.stream_id);
        self.send(Envelope::event("users", json!(users)));
        if let Some(duration) = self.manager.limiter().active_timeout_secs(&join.user_id) {
            self.send(Envelope::event("timeout", json!({ "duration": duration })));
        }

        info!(
            "user {} ({}) joined stream {}",
            join.user_id, join.username, self.stream_id
        );
        self.manager.broadcast_to_room(
            &self.stream_id,
            &Envelope::event(
                "user_joined",
                json!({ "userId": join.user_id, "username": join.username }),
            ),
            Some(&join.user_id),
        );
    }

    fn handle_message(&mut self, data: Option<Value>) {
        let Some(user_id) = self.user_id.clone() else {
            self.send(Envelope::error("Not joined to chat"));
            return;
        };
        let text = match serde_json::from_value::<MessageData>(data.unwrap_or(Value::Null)) {
            Ok(msg) if !msg.message.is_empty() => msg.message,
            _ => {
                self.send(Envelope::error("Invalid message content"));
                return;
            }
        };

        match self.manager.limiter().check(&user_id, &text) {
            Verdict::Allow => {
                self.manager
                    .post_message(&self.stream_id, &user_id, &self.username, &text);
            }
            Verdict::Deny {
                code,
                timeout_until,
                violations,
            } => {
                debug!(
                    "message from {} on {} denied: {}",
                    user_id,
                    self.stream_id,
                    code.as_str()
                );
                self.manager
                    .note_user_penalty(&self.stream_id, &user_id, timeout_until, violations);
                let frame = if code == DenyCode::RateLimit {
                    Envelope::rate_limited(code.as_str())
                } else {
                    Envelope::error(code.as_str())
                };
                self.send(frame);
            }
        }
    }

    fn handle_typing(&mut self, data: Option<Value>) {
        let Some(user_id) = self.user_id.clone() else {
            self.send(Envelope::error("Not joined to chat"));
            return;
        };
        if !self.manager.config().enable_typing_status {
            return;
        }
        let typing: TypingData =
            serde_json::from_value(data.unwrap_or(Value::Null)).unwrap_or(TypingData {
                is_typing: false,
            });
        self.manager.broadcast_to_room(
            &self.stream_id,
            &Envelope::event(
                "typing",
                json!({
                    "userId": user_id,
                    "username": self.username,
                    "isTyping": typing.is_typing,
                }),
            ),
            Some(&user_id),
        );
    }

    /// Enqueue a frame for this session only. Best-effort, like fan-out.
    fn send(&self, envelope: Envelope) {
        if self.outbound.try_send(envelope).is_err() {
            debug!("own outbound queue unavailable on stream {}", self.stream_id);
        }
    }

    /// Reader exit path; safe to run once per session in every exit case.
    fn cleanup(&mut self) {
        let Some(user_id) = self.user_id.take() else {
            return;
        };
        // a session replaced by a re-join must leave its successor's
        // registration and roster entry alone
        let still_registered = self.manager.unregister_session(&user_id, &self.outbound);
        if !still_registered {
            return;
        }
        self.manager.remove_user(&self.stream_id, &user_id);
        info!(
            "user {} ({}) left stream {}",
            user_id, self.username, self.stream_id
        );
        self.manager.broadcast_to_room(
            &self.stream_id,
            &Envelope::event(
                "user_left",
                json!({ "userId": user_id, "username": self.username }),
            ),
            None,
        );
    }
}
