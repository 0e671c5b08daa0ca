mod helpers;

use helpers::{join_lobby, spawn_app};
use reqwest::Client;
use serde_json::Value;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_health_endpoint() {
    let addr = spawn_app().await;
    let client = Client::new();

    let response = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
#[serial]
async fn test_lobby_listing_is_empty_initially() {
    let addr = spawn_app().await;
    let client = Client::new();

    let response = client
        .get(format!("http://{}/lobbies", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let lobbies: Vec<Value> = response.json().await.unwrap();
    assert_eq!(lobbies.len(), 0);
}

#[tokio::test]
#[serial]
async fn test_lobby_listing_shows_gathering_lobby() {
    let addr = spawn_app().await;
    let client = Client::new();

    let mut ws = helpers::connect(addr).await;
    let assigned = join_lobby(&mut ws, "host-1", "Hosting Harry", Some("4321")).await;
    assert_eq!(assigned["lobbyId"], "4321");
    assert_eq!(assigned["isOwner"], true);

    let response = client
        .get(format!("http://{}/lobbies", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let lobbies: Vec<Value> = response.json().await.unwrap();
    assert_eq!(lobbies.len(), 1);
    assert_eq!(lobbies[0]["id"], "4321");
    assert_eq!(lobbies[0]["host"], "Hosting Harry");
    assert_eq!(lobbies[0]["playerCount"], 1);
    assert_eq!(lobbies[0]["spectatorCount"], 0);
    assert_eq!(lobbies[0]["maxPlayers"], 15);
    assert_eq!(lobbies[0]["phase"], "lobby");
    assert_eq!(lobbies[0]["impostorGuessOption"], false);
}

#[tokio::test]
#[serial]
async fn test_lobby_disappears_from_listing_when_emptied() {
    let addr = spawn_app().await;
    let client = Client::new();

    let mut ws = helpers::connect(addr).await;
    join_lobby(&mut ws, "host-1", "Harry", Some("7777")).await;

    helpers::send_json(&mut ws, serde_json::json!({"type": "exitLobby"})).await;
    helpers::recv_until(&mut ws, "lobbyExited").await;

    let response = client
        .get(format!("http://{}/lobbies", addr))
        .send()
        .await
        .unwrap();
    let lobbies: Vec<Value> = response.json().await.unwrap();
    assert_eq!(lobbies.len(), 0);
}
