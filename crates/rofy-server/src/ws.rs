//! WebSocket support for live listening and streamed planning.
//!
//! Client messages:
//! - `{"type": "listen", "sessionId": ...}` forwards that session's bus events
//! - `{"type": "getPlan", "chatId": ...}` runs a planning turn, streamed as
//!   `planData` frames
//! - `{"type": "ping"}` is answered with a `pong` frame
//!
//! Every server frame is `{"event": <name>, "data": <payload>}`.

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use rofy_agent::{EventSink, PlanEvent, SessionEvent, Subscription};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::UserId;
use crate::state::AppState;

/// Messages sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Listen {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    GetPlan {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    Ping,
}

/// Frames produced by this connection itself; bus events are forwarded as
/// their own `{event, data}` shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    PlanData(PlanEvent),
    Pong {},
    Error { message: String },
}

impl ServerFrame {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Sink that turns plan events into `planData` frames
struct PlanFrames(mpsc::UnboundedSender<String>);

impl EventSink<PlanEvent> for PlanFrames {
    fn emit(&self, event: PlanEvent) {
        if let Some(frame) = ServerFrame::PlanData(event).to_json() {
            let _ = self.0.send(frame);
        }
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

/// Handle an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Planning turns started here end with the connection
    let connection = CancellationToken::new();
    let _connection_guard = connection.clone().drop_guard();

    let mut listening: Option<Subscription> = None;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + state.heartbeat,
        state.heartbeat,
    );

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Listen { session_id }) => {
                            debug!(session_id = %session_id, "websocket listening");
                            listening = Some(listen(&state, &session_id, out_tx.clone()));
                        }
                        Ok(ClientMessage::GetPlan { chat_id }) => {
                            start_plan(&state, &user, chat_id, out_tx.clone(), connection.child_token()).await;
                        }
                        Ok(ClientMessage::Ping) => {
                            if let Some(frame) = (ServerFrame::Pong {}).to_json() {
                                let _ = out_tx.send(frame);
                            }
                        }
                        Err(e) => {
                            warn!("Invalid client message: {}", e);
                            let error = ServerFrame::Error {
                                message: format!("Invalid message: {e}"),
                            };
                            if let Some(frame) = error.to_json() {
                                let _ = out_tx.send(frame);
                            }
                        }
                    },
                    Ok(Message::Ping(data)) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            Some(frame) = out_rx.recv() => {
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(subscription) = listening.take() {
        subscription.unsubscribe();
    }
    debug!("websocket closed");
}

/// Subscribe to a session, replacing any previous subscription of this
/// connection. The `session` frame goes out first.
fn listen(state: &AppState, session_id: &str, out: mpsc::UnboundedSender<String>) -> Subscription {
    if let Ok(frame) = serde_json::to_string(&SessionEvent::session(session_id)) {
        let _ = out.send(frame);
    }
    state.bus().subscribe(session_id, move |event| {
        if let Ok(frame) = serde_json::to_string(event) {
            let _ = out.send(frame);
        }
    })
}

async fn start_plan(
    state: &AppState,
    user: &UserId,
    chat_id: String,
    out: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let sink = PlanFrames(out);

    // A missing chat is reported by the planner itself
    if let Ok(Some(chat)) = state.store.chat(&chat_id).await {
        if chat.user_id != user.as_str() {
            sink.emit(PlanEvent::Error {
                message: "You do not have access to this chat.".to_string(),
            });
            return;
        }
    }

    let planner = state.planner.clone();
    tokio::spawn(async move {
        if let Err(e) = planner.run(&chat_id, &sink, cancel).await {
            debug!(chat_id = %chat_id, error = %e, "websocket planning turn ended with an error");
        }
    });
}
