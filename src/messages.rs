use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::lobby::{Phase, Role, TurnEntry};

/// Everything a client may send over its connection. Unrecognized kinds
/// fail deserialization at the boundary and never reach the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinLobby {
        player_id: String,
        name: String,
        #[serde(default)]
        lobby_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinSpectator {
        player_id: String,
        name: String,
        lobby_id: String,
    },
    ExitLobby,
    ToggleImpostorGuess {
        enabled: bool,
    },
    StartGame,
    SubmitWord {
        word: String,
    },
    Vote {
        vote: String,
    },
    ImpostorGuess {
        guess: String,
    },
    Restart,
    GetLobbyList,
    Ping,
}

/// One row of the public lobby directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LobbyInfo {
    pub id: String,
    pub host: Option<String>,
    pub player_count: usize,
    pub spectator_count: usize,
    pub max_players: usize,
    pub phase: Phase,
    pub created_at: i64,
    pub impostor_guess_option: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleReveal {
    pub name: String,
    pub role: Option<Role>,
}

/// Everything the server may push to a connection. Timestamps are absolute
/// epoch milliseconds so clients can compute remaining time themselves.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ServerHello { server_id: Uuid },
    LobbyList {
        lobbies: Vec<LobbyInfo>,
    },
    #[serde(rename_all = "camelCase")]
    LobbyAssigned {
        lobby_id: String,
        is_spectator: bool,
        player_name: String,
        is_owner: bool,
        impostor_guess_option: bool,
    },
    #[serde(rename_all = "camelCase")]
    LobbyUpdate {
        players: Vec<PlayerInfo>,
        spectators: Vec<PlayerInfo>,
        owner: Option<String>,
        phase: Phase,
        impostor_guess_option: bool,
    },
    #[serde(rename_all = "camelCase")]
    GameStart {
        role: Option<Role>,
        #[serde(skip_serializing_if = "Option::is_none")]
        word: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
        player_name: String,
    },
    #[serde(rename_all = "camelCase")]
    TurnUpdate {
        phase: Phase,
        round1: Vec<TurnEntry>,
        round2: Vec<TurnEntry>,
        current_player: Option<String>,
        turn_ends_at: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_occurred: Option<bool>,
    },
    StartVoting {
        players: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ImpostorGuessPhase {
        ejected: Option<String>,
        is_impostor: bool,
        guess_ends_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    GameEnd {
        roles: Vec<RoleReveal>,
        votes: HashMap<String, String>,
        secret_word: String,
        hint: String,
        winner: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        impostor_guess: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        impostor_guess_correct: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    GameEndEarly {
        roles: Vec<RoleReveal>,
        secret_word: String,
        hint: String,
        winner: Option<String>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    RestartUpdate {
        ready_count: usize,
        total_players: usize,
        spectators_wanting_to_join: usize,
    },
    LobbyExited,
    LobbyClosed {
        message: String,
    },
    Error {
        message: String,
    },
    Pong,
}
