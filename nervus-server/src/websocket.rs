//! `/ws` upgrade endpoint. Each socket becomes one registered connection in
//! the `WebSocketManager`; the distributor pushes matched events to it as
//! binary frames (JSON-encoded) via `WebSocketTransport::send_to_connection`
//! / `send_to_session`.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    session_id: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQueryParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: Option<String>) {
    let connection_id = Uuid::new_v4().to_string();
    info!(connection_id = %connection_id, session_id = ?session_id, "websocket connection established");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.ws.register(connection_id.clone(), session_id, tx);

    let (mut sink, mut stream) = socket.split();

    let send_conn = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if sink.send(Message::Binary(bytes)).await.is_err() {
                warn!(connection_id = %send_conn, "failed writing to websocket, closing");
                break;
            }
        }
    });

    let recv_conn = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                    debug!(connection_id = %recv_conn, "ignoring inbound client frame");
                }
                Err(err) => {
                    warn!(connection_id = %recv_conn, error = %err, "websocket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.ws.unregister(&connection_id);
    info!(connection_id = %connection_id, "websocket connection closed");
}
