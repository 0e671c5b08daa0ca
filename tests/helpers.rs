#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn spawn_app() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    tokio::spawn(async move {
        impostor_server::run(addr, None).await.unwrap();
    });
    sleep(Duration::from_millis(100)).await;
    addr
}

pub async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect");
    ws
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Read frames, skipping other kinds, until one with the given type tag
/// arrives.
pub async fn recv_until(ws: &mut WsClient, kind: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == kind {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended while waiting for {}: {:?}", kind, other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

pub async fn join_lobby(
    ws: &mut WsClient,
    player_id: &str,
    name: &str,
    lobby_id: Option<&str>,
) -> Value {
    let mut payload = json!({"type": "joinLobby", "playerId": player_id, "name": name});
    if let Some(id) = lobby_id {
        payload["lobbyId"] = json!(id);
    }
    send_json(ws, payload).await;
    recv_until(ws, "lobbyAssigned").await
}
