mod helpers;

use helpers::{connect, join_lobby, recv_until, send_json, spawn_app, WsClient};
use serde_json::json;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_server_hello_and_listing_on_connect() {
    let addr = spawn_app().await;
    let mut ws = connect(addr).await;

    let hello = recv_until(&mut ws, "serverHello").await;
    assert!(hello["serverId"].as_str().is_some());

    let listing = recv_until(&mut ws, "lobbyList").await;
    assert_eq!(listing["lobbies"].as_array().unwrap().len(), 0);
}

#[tokio::test]
#[serial]
async fn test_ping_pong() {
    let addr = spawn_app().await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"type": "ping"})).await;
    recv_until(&mut ws, "pong").await;
}

#[tokio::test]
#[serial]
async fn test_malformed_payload_gets_error_and_connection_survives() {
    let addr = spawn_app().await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"type": "noSuchAction", "x": 1})).await;
    recv_until(&mut ws, "error").await;

    // Still usable afterwards.
    send_json(&mut ws, json!({"type": "ping"})).await;
    recv_until(&mut ws, "pong").await;
}

#[tokio::test]
#[serial]
async fn test_join_without_lobby_id_creates_fresh_code() {
    let addr = spawn_app().await;
    let mut ws = connect(addr).await;

    let assigned = join_lobby(&mut ws, "p1", "Alice", None).await;
    let lobby_id = assigned["lobbyId"].as_str().unwrap();
    assert_eq!(lobby_id.len(), 4);
    assert!(lobby_id.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(assigned["isOwner"], true);
    assert_eq!(assigned["isSpectator"], false);
    assert_eq!(assigned["playerName"], "Alice");
}

#[tokio::test]
#[serial]
async fn test_duplicate_names_are_suffixed() {
    let addr = spawn_app().await;
    let mut ws_a = connect(addr).await;
    let mut ws_b = connect(addr).await;

    join_lobby(&mut ws_a, "p1", "Alice", Some("2020")).await;
    let assigned = join_lobby(&mut ws_b, "p2", "alice", Some("2020")).await;
    assert_eq!(assigned["playerName"], "alice (2)");
    assert_eq!(assigned["isOwner"], false);

    // Both see the two-player roster.
    drain_update(&mut ws_a, 2).await;
}

#[tokio::test]
#[serial]
async fn test_spectating_unknown_lobby_is_an_error() {
    let addr = spawn_app().await;
    let mut ws = connect(addr).await;

    send_json(
        &mut ws,
        json!({"type": "joinSpectator", "playerId": "s1", "name": "Watcher", "lobbyId": "9999"}),
    )
    .await;
    let err = recv_until(&mut ws, "error").await;
    assert_eq!(err["message"], "Lobby not found");
}

#[tokio::test]
#[serial]
async fn test_exit_lobby_updates_remaining_players() {
    let addr = spawn_app().await;
    let mut ws_a = connect(addr).await;
    let mut ws_b = connect(addr).await;

    join_lobby(&mut ws_a, "p1", "Alice", Some("3030")).await;
    join_lobby(&mut ws_b, "p2", "Bob", Some("3030")).await;
    drain_update(&mut ws_a, 2).await;

    send_json(&mut ws_b, json!({"type": "exitLobby"})).await;
    recv_until(&mut ws_b, "lobbyExited").await;

    // Alice sees a single-player roster again.
    drain_update(&mut ws_a, 1).await;
}

#[tokio::test]
#[serial]
async fn test_start_game_requires_three_connected_players() {
    let addr = spawn_app().await;
    let mut ws_a = connect(addr).await;
    let mut ws_b = connect(addr).await;

    join_lobby(&mut ws_a, "p1", "Alice", Some("4040")).await;
    join_lobby(&mut ws_b, "p2", "Bob", Some("4040")).await;

    send_json(&mut ws_a, json!({"type": "startGame"})).await;
    let err = recv_until(&mut ws_a, "error").await;
    assert_eq!(err["message"], "Not enough players to start");
}

/// The end-to-end scenario: three players, two full rounds, a 1-1-1 vote
/// tie, no ejection, and the impostor wins by default.
#[tokio::test]
#[serial]
async fn test_full_game_with_tie_vote() {
    let addr = spawn_app().await;
    let mut ws_a = connect(addr).await;
    let mut ws_b = connect(addr).await;
    let mut ws_c = connect(addr).await;

    join_lobby(&mut ws_a, "p1", "Alice", Some("1234")).await;
    join_lobby(&mut ws_b, "p2", "Bob", Some("1234")).await;
    join_lobby(&mut ws_c, "p3", "Carol", Some("1234")).await;

    send_json(&mut ws_a, json!({"type": "startGame"})).await;

    // Exactly one impostor among the three views; the impostor sees the
    // hint, the civilians see the word.
    let mut impostors = 0;
    for ws in [&mut ws_a, &mut ws_b, &mut ws_c] {
        let start = recv_until(ws, "gameStart").await;
        if start["role"] == "impostor" {
            impostors += 1;
            assert!(start["hint"].as_str().is_some());
            assert!(start["word"].is_null());
        } else {
            assert_eq!(start["role"], "civilian");
            assert!(start["word"].as_str().is_some());
        }
    }
    assert_eq!(impostors, 1);

    let sockets: [(&str, &str); 3] = [("Alice", "p1"), ("Bob", "p2"), ("Carol", "p3")];
    let submit = |name: String| {
        sockets
            .iter()
            .position(|(n, _)| *n == name)
            .expect("unknown current player")
    };

    // Drive both rounds in lockstep with the turn updates seen by Alice.
    let first = recv_until(&mut ws_a, "turnUpdate").await;
    assert_eq!(first["phase"], "round1");
    assert!(first["turnEndsAt"].as_i64().is_some());
    let mut current = first["currentPlayer"].as_str().unwrap().to_string();
    for _ in 0..6 {
        let idx = submit(current.clone());
        let word = format!("word-from-{}", current);
        let payload = json!({"type": "submitWord", "word": word});
        match idx {
            0 => send_json(&mut ws_a, payload).await,
            1 => send_json(&mut ws_b, payload).await,
            _ => send_json(&mut ws_c, payload).await,
        }
        let update = recv_until(&mut ws_a, "turnUpdate").await;
        if update["phase"] == "voting" {
            assert_eq!(update["round1"].as_array().unwrap().len(), 3);
            assert_eq!(update["round2"].as_array().unwrap().len(), 3);
            current = String::new();
        } else {
            current = update["currentPlayer"].as_str().unwrap().to_string();
        }
    }
    assert!(current.is_empty(), "expected the voting phase after 6 turns");

    // 1-1-1 tie: nobody is ejected, civilians lose.
    send_json(&mut ws_a, json!({"type": "vote", "vote": "Bob"})).await;
    send_json(&mut ws_b, json!({"type": "vote", "vote": "Carol"})).await;
    send_json(&mut ws_c, json!({"type": "vote", "vote": "Alice"})).await;

    for ws in [&mut ws_a, &mut ws_b, &mut ws_c] {
        let end = recv_until(ws, "gameEnd").await;
        assert_eq!(end["winner"], "Impostor");
        assert!(end["secretWord"].as_str().is_some());
        assert_eq!(end["votes"].as_object().unwrap().len(), 3);
        assert_eq!(end["roles"].as_array().unwrap().len(), 3);
    }
}

#[tokio::test]
#[serial]
async fn test_unknown_player_joining_mid_game_becomes_spectator() {
    let addr = spawn_app().await;
    let mut ws_a = connect(addr).await;
    let mut ws_b = connect(addr).await;
    let mut ws_c = connect(addr).await;

    join_lobby(&mut ws_a, "p1", "Alice", Some("5050")).await;
    join_lobby(&mut ws_b, "p2", "Bob", Some("5050")).await;
    join_lobby(&mut ws_c, "p3", "Carol", Some("5050")).await;
    send_json(&mut ws_a, json!({"type": "startGame"})).await;
    recv_until(&mut ws_a, "gameStart").await;

    let mut ws_d = connect(addr).await;
    let assigned = join_lobby(&mut ws_d, "p4", "Dave", Some("5050")).await;
    assert_eq!(assigned["isSpectator"], true);
    // Spectators receive the civilian view so they can follow along.
    let start = recv_until(&mut ws_d, "gameStart").await;
    assert!(start["role"].is_null());
    assert!(start["word"].as_str().is_some());
}

async fn drain_update(ws: &mut WsClient, wanted_players: usize) {
    loop {
        let update = recv_until(ws, "lobbyUpdate").await;
        if update["players"].as_array().unwrap().len() == wanted_players {
            return;
        }
    }
}

#[tokio::test]
#[serial]
async fn test_single_lobby_membership_is_enforced() {
    let addr = spawn_app().await;
    let mut ws_a = connect(addr).await;
    let mut ws_b = connect(addr).await;

    join_lobby(&mut ws_a, "p1", "Alice", Some("6060")).await;
    join_lobby(&mut ws_b, "p2", "Bob", Some("6060")).await;
    drain_update(&mut ws_a, 2).await;

    // Bob hops to another lobby; the old one sheds him.
    let assigned = join_lobby(&mut ws_b, "p2", "Bob", Some("6061")).await;
    assert_eq!(assigned["lobbyId"], "6061");
    drain_update(&mut ws_a, 1).await;
}
