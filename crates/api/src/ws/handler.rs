use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use crackq_core::types::DbId;
use futures::{SinkExt, StreamExt};

use crate::error::AppResult;
use crate::middleware::caller::Caller;
use crate::state::AppState;
use crate::ws::manager::WsManager;
use crate::ws::protocol::{ClientMessage, Severity, SystemMessage};

/// HTTP handler that upgrades the connection to WebSocket.
///
/// The connection is bound to the `x-user-id` caller when present; without
/// it the client may still follow individual jobs and `all_jobs`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let user_id = Caller::from_headers(&headers)?.map(|c| c.user_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state.ws_manager, user_id)))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with `WsManager`.
///   2. Spawns a sender task that forwards messages from the manager channel.
///   3. Processes inbound messages until either side goes away.
///   4. Cleans up on disconnect.
async fn handle_socket(socket: WebSocket, ws_manager: Arc<WsManager>, user_id: Option<DbId>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, user_id, "WebSocket connected");

    let mut rx = ws_manager.add(conn_id.clone(), user_id).await;

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward channel messages to the sink. Ends after a Close
    // frame or when the manager drops the connection.
    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            next = stream.next() => match next {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => {
                    ws_manager.touch(&conn_id).await;
                    tracing::trace!(conn_id = %conn_id, "Pong received");
                }
                Some(Ok(Message::Text(text))) => {
                    ws_manager.touch(&conn_id).await;
                    handle_text(&ws_manager, &conn_id, text.as_str()).await;
                }
                Some(Ok(_)) => ws_manager.touch(&conn_id).await,
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Apply one client frame, acknowledging (un)subscribes with a system
/// message. Malformed frames get a warning and the connection stays open.
async fn handle_text(ws_manager: &WsManager, conn_id: &str, text: &str) {
    let reply = match ClientMessage::parse(text) {
        Ok(ClientMessage::Subscribe(req)) => match req.topic() {
            Ok(topic) => match ws_manager.subscribe(conn_id, topic).await {
                Ok(()) => {
                    tracing::debug!(conn_id, %topic, "Subscribed");
                    SystemMessage::new(Severity::Info, format!("Subscribed to {topic}"))
                }
                Err(e) => SystemMessage::new(Severity::Warning, format!("Cannot subscribe: {e}")),
            },
            Err(reason) => SystemMessage::new(Severity::Warning, reason),
        },
        Ok(ClientMessage::Unsubscribe(req)) => match req.topic() {
            Ok(topic) => match ws_manager.unsubscribe(conn_id, topic).await {
                Ok(()) => {
                    tracing::debug!(conn_id, %topic, "Unsubscribed");
                    SystemMessage::new(Severity::Info, format!("Unsubscribed from {topic}"))
                }
                Err(e) => {
                    SystemMessage::new(Severity::Warning, format!("Cannot unsubscribe: {e}"))
                }
            },
            Err(reason) => SystemMessage::new(Severity::Warning, reason),
        },
        Ok(ClientMessage::Pong { .. }) => return,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "Malformed client message");
            SystemMessage::new(Severity::Warning, format!("Malformed message: {e}"))
        }
    };
    ws_manager.send_to(conn_id, reply.to_message()).await;
}
