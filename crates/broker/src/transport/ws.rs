//! WebSocket terminal endpoint.
//!
//! Text frames carry JSON control messages, binary frames carry raw terminal
//! bytes in both directions. Each connection runs a reader loop that feeds the
//! [`Connection`] and a writer task that drains its outbound queue.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::adapter::Connection;
use super::auth::{Identity, RequireIdentity};
use super::AppState;
use crate::session::{next_transport_id, OutboundFrame};

/// Upgrades an authenticated request to a terminal connection.
pub async fn terminal_handler(
    RequireIdentity(identity): RequireIdentity,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

fn encode(frame: OutboundFrame) -> Option<Message> {
    match frame {
        OutboundFrame::Output(data) => Some(Message::Binary(data)),
        OutboundFrame::Message(envelope) => match envelope.to_json() {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!("Failed to encode server message: {}", e);
                None
            }
        },
    }
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let transport_id = next_transport_id();
    info!(
        transport_id,
        user_id = %identity.user_id,
        "Terminal connection established"
    );

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.outbound_capacity.max(1));

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some(message) = encode(frame) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                debug!(transport_id, "WebSocket send failed, stopping writer");
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut connection = Connection::new(identity, transport_id, state.registry.clone(), tx);

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Binary(data)) => connection.handle_binary(&data).await,
            Ok(Message::Close(_)) => {
                debug!(transport_id, "Client closed connection");
                break;
            }
            // Pings are answered by axum.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(transport_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    connection.disconnect().await;
    drop(connection);
    writer.abort();

    info!(transport_id, "Terminal connection closed");
}
