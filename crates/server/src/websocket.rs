//! WebSocket handling
//!
//! One connection per UI client. Outbound traffic comes from the client's
//! relay queue; inbound frames are parsed and routed to the supervisor.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use ultra_protocol::{ClientMessage, ServerMessage};

use crate::relay::ClientId;
use crate::state::AppState;

/// Frames written by a connection's send task
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut relay_rx) = state.relay.connect();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = client_id,
        "WebSocket connection opened"
    );

    state.relay.send_to(
        client_id,
        ServerMessage::BackendStatus {
            snapshot: state.supervisor.snapshot().as_ref().clone(),
        },
    );
    if state.setup_pending() {
        state.relay.send_to(client_id, ServerMessage::SetupRequired);
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (pong_tx, mut pong_rx) = mpsc::channel::<Bytes>(8);

    let send_task = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                msg = relay_rx.recv() => match msg {
                    Some(msg) => OutboundMessage::Json(msg),
                    None => break,
                },
                data = pong_rx.recv() => match data {
                    Some(data) => OutboundMessage::Pong(data),
                    None => break,
                },
            };

            let result = match outbound {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = client_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = client_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.send(data).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = client_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = client_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = client_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                state
                    .relay
                    .send_to(client_id, ServerMessage::error("parse_error", e.to_string()));
                continue;
            }
        };

        handle_client_message(client_msg, client_id, &state).await;
    }

    state.relay.disconnect(client_id);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = client_id,
        remaining_clients = state.relay.client_count(),
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    let mut out: String = value.chars().take(max_chars).collect();
    if value.chars().count() > max_chars {
        out.push('…');
    }
    out
}

/// Route one inbound message.
///
/// Failures the supervisor has already broadcast are not repeated; anything
/// else is reported to the sending client only.
async fn handle_client_message(msg: ClientMessage, client_id: ClientId, state: &AppState) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = client_id,
        message = ?msg,
        "Client message"
    );

    let result = match msg {
        ClientMessage::TextInput { content } => {
            state.supervisor.forward_to_backend(content).await
        }
        ClientMessage::ClearConversation => {
            info!(
                component = "websocket",
                event = "conversation.cleared",
                connection_id = client_id,
                "Conversation cleared"
            );
            state.relay.broadcast(ServerMessage::ConversationCleared);
            Ok(())
        }
        ClientMessage::SetupComplete => state.complete_setup().await,
        ClientMessage::StartBackend => state.supervisor.start().await,
        ClientMessage::RestartBackend => state.supervisor.restart().await,
        ClientMessage::StopBackend => state.supervisor.stop().await,
    };

    if let Err(e) = result {
        if !e.is_broadcast() {
            state
                .relay
                .send_to(client_id, ServerMessage::error(e.code(), e.to_string()));
        }
    }
}
