use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::AppState;

/// Live notification feed. Each open socket registers with the connection
/// registry; the websocket sender pushes rendered notifications through it.
pub async fn notification_feed(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let connection_id = state.connections.register(&user_id, tx).await;
    tracing::debug!("Websocket opened for user {} ({})", user_id, connection_id);

    loop {
        tokio::select! {
            payload = rx.recv() => {
                match payload {
                    Some(payload) => {
                        if sink.send(Message::Text(payload.to_string())).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped the sender.
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    // Inbound client messages are not part of the protocol.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.connections.unregister(&user_id, &connection_id).await;
    tracing::debug!("Websocket closed for user {} ({})", user_id, connection_id);
}
