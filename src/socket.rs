use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Event;
use crate::lobby::Connection;
use crate::messages::{ClientMessage, ServerMessage};
use crate::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump one socket: outbound events are serialized off a per-connection
/// channel, inbound frames are parsed and fed to the engine. The engine
/// never touches the socket itself, only the channel.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    if state
        .events
        .send(Event::Connected {
            conn: Connection {
                id: conn_id,
                tx: tx.clone(),
            },
        })
        .is_err()
    {
        return;
    }
    debug!(conn = %conn_id, "socket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(err) => {
                    warn!(conn = %conn_id, "failed to serialize outbound message: {err}");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let events = state.events.clone();
    let reply = tx;
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(conn = %conn_id, "socket error: {err}");
                    break;
                }
            };
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => {
                        if events.send(Event::Inbound { conn_id, msg }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // Malformed payloads get a generic error reply and
                        // mutate nothing; the connection stays open.
                        debug!(conn = %conn_id, "unparseable message: {err}");
                        let _ = reply.send(ServerMessage::Error {
                            message: "Invalid message".to_string(),
                        });
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    debug!(conn = %conn_id, "socket closed");
    let _ = state.events.send(Event::Disconnected { conn_id });
}
