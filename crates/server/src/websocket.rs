//! WebSocket status stream
//!
//! Read-only: pushes an initial `SessionsList`, then every persisted session
//! change. Client frames other than ping and close are ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use pairline_protocol::ServerMessage;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::manager::PairingSessionManager;
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

enum Outbound {
    Json(ServerMessage),
    Pong(axum::body::Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                Outbound::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Subscribe before the initial list so no update falls in between.
    let rx = state.manager.subscribe();
    send_sessions_list(&state.manager, &outbound_tx).await;
    let forwarder = spawn_broadcast_forwarder(
        rx,
        state.manager.clone(),
        outbound_tx.clone(),
        conn_id,
    );

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(Outbound::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    forwarder.abort();
    send_task.abort();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
}

async fn send_sessions_list(manager: &PairingSessionManager, outbound_tx: &mpsc::Sender<Outbound>) {
    match manager.list().await {
        Ok(sessions) => {
            let _ = outbound_tx
                .send(Outbound::Json(ServerMessage::SessionsList { sessions }))
                .await;
        }
        Err(e) => warn!(
            component = "websocket",
            event = "ws.list_failed",
            error = %e,
            "Failed to load sessions for status stream"
        ),
    }
}

fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    manager: Arc<PairingSessionManager>,
    outbound_tx: mpsc::Sender<Outbound>,
    conn_id: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(Outbound::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        connection_id = conn_id,
                        skipped = n,
                        "Broadcast subscriber lagged, resending full list"
                    );
                    send_sessions_list(&manager, &outbound_tx).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
