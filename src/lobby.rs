use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::messages::{PlayerInfo, RoleReveal, ServerMessage};
use crate::timer::Timers;
use crate::words::WordPool;

pub type PlayerId = String;
pub type ConnId = Uuid;

pub const MAX_PLAYERS: usize = 15;
pub const MAX_NAME_LEN: usize = 20;
pub const MAX_WORD_LEN: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Lobby,
    Round1,
    Round2,
    Voting,
    ImpostorGuess,
    Results,
}

impl Phase {
    /// True while a game is actually running (the phases with turn/vote
    /// semantics and abandonment grace windows).
    pub fn is_playing(self) -> bool {
        matches!(
            self,
            Phase::Round1 | Phase::Round2 | Phase::Voting | Phase::ImpostorGuess
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Impostor,
    Civilian,
}

/// One word submitted (or force-skipped as empty) during a round.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnEntry {
    pub player_name: String,
    pub word: String,
}

/// The live end of one socket: fire-and-forget sends, errors swallowed.
/// A failed send just means the socket will report its own disconnect.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnId,
    pub tx: UnboundedSender<ServerMessage>,
}

impl Connection {
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }
}

pub struct Participant {
    pub id: PlayerId,
    pub name: String,
    pub conn: Option<Connection>,
    /// Bumped on every successful (re)attachment; inbound messages tagged
    /// with an older epoch come from a superseded socket and are dropped.
    pub epoch: u64,
    pub role: Option<Role>,
    pub last_disconnect: Option<DateTime<Utc>>,
    pub vote: Option<String>,
    pub wants_to_join_next_game: bool,
    pub is_spectator: bool,
}

impl Participant {
    pub fn new(id: PlayerId, name: String, conn: Connection, is_spectator: bool) -> Self {
        Self {
            id,
            name,
            conn: Some(conn),
            epoch: 1,
            role: None,
            last_disconnect: None,
            vote: None,
            wants_to_join_next_game: false,
            is_spectator,
        }
    }

    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Attach a fresh socket, superseding whatever was attached before.
    /// Returns the replaced connection, if any, so the caller can notify
    /// the stale socket.
    pub fn attach(&mut self, conn: Connection) -> Option<Connection> {
        let old = self.conn.replace(conn);
        self.epoch += 1;
        self.last_disconnect = None;
        old
    }

    pub fn detach(&mut self, now: DateTime<Utc>) {
        self.conn = None;
        self.last_disconnect = Some(now);
    }

    pub fn send(&self, msg: ServerMessage) {
        if let Some(conn) = &self.conn {
            conn.send(msg);
        }
    }
}

pub struct Lobby {
    pub id: String,
    pub phase: Phase,
    /// Turn rotation order; insertion order is preserved across reconnects.
    pub players: Vec<Participant>,
    pub spectators: Vec<Participant>,
    pub owner: Option<PlayerId>,
    /// Index into `players` whose action is currently awaited.
    pub turn: usize,
    pub word: Option<String>,
    pub hint: Option<String>,
    pub round1: Vec<TurnEntry>,
    pub round2: Vec<TurnEntry>,
    pub restart_ready: HashSet<PlayerId>,
    pub pool: WordPool,
    pub impostor_guess_option: bool,
    pub created_at: DateTime<Utc>,
    pub timers: Timers,
    /// Name of the ejected participant while in the impostor-guess phase.
    pub ejected: Option<String>,
    /// Grace windows: when the condition was first observed, or None.
    pub impostor_missing_since: Option<DateTime<Utc>>,
    pub low_players_since: Option<DateTime<Utc>>,
}

impl Lobby {
    pub fn new(id: String, pool: WordPool) -> Self {
        Self {
            id,
            phase: Phase::Lobby,
            players: Vec::new(),
            spectators: Vec::new(),
            owner: None,
            turn: 0,
            word: None,
            hint: None,
            round1: Vec::new(),
            round2: Vec::new(),
            restart_ready: HashSet::new(),
            pool,
            impostor_guess_option: false,
            created_at: Utc::now(),
            timers: Timers::default(),
            ejected: None,
            impostor_missing_since: None,
            low_players_since: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.spectators.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.players.iter().chain(self.spectators.iter())
    }

    pub fn participant(&self, player_id: &str) -> Option<&Participant> {
        self.participants().find(|p| p.id == player_id)
    }

    pub fn participant_mut(&mut self, player_id: &str) -> Option<&mut Participant> {
        self.players
            .iter_mut()
            .chain(self.spectators.iter_mut())
            .find(|p| p.id == player_id)
    }

    pub fn connected_players(&self) -> usize {
        self.players.iter().filter(|p| p.connected()).count()
    }

    pub fn impostor(&self) -> Option<&Participant> {
        self.participants().find(|p| p.role == Some(Role::Impostor))
    }

    pub fn is_owner(&self, player_id: &str) -> bool {
        self.owner.as_deref() == Some(player_id)
    }

    /// The first connected remaining player becomes the new owner.
    pub fn reassign_owner(&mut self) {
        self.owner = self
            .players
            .iter()
            .find(|p| p.connected())
            .or_else(|| self.players.first())
            .map(|p| p.id.clone());
    }

    /// Circular scan for the next connected player starting at `start`.
    /// Returns None if no player is connected at all.
    pub fn next_connected_from(&self, start: usize) -> Option<usize> {
        if self.players.is_empty() {
            return None;
        }
        let len = self.players.len();
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| self.players[i].connected())
    }

    pub fn current_round(&self) -> &Vec<TurnEntry> {
        match self.phase {
            Phase::Round2 => &self.round2,
            _ => &self.round1,
        }
    }

    pub fn current_round_mut(&mut self) -> &mut Vec<TurnEntry> {
        match self.phase {
            Phase::Round2 => &mut self.round2,
            _ => &mut self.round1,
        }
    }

    /// A unique display name for `wanted` within this lobby, compared
    /// case-insensitively, suffixed with the smallest free `" (n)"`.
    pub fn dedup_name(&self, wanted: &str) -> String {
        let base = sanitize_name(wanted);
        if !self.name_taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{} ({})", base, n);
            if !self.name_taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.participants().any(|p| p.name.to_lowercase() == lowered)
    }

    pub fn player_infos(&self) -> Vec<PlayerInfo> {
        self.players
            .iter()
            .map(|p| PlayerInfo {
                name: p.name.clone(),
                connected: p.connected(),
            })
            .collect()
    }

    pub fn spectator_infos(&self) -> Vec<PlayerInfo> {
        self.spectators
            .iter()
            .map(|p| PlayerInfo {
                name: p.name.clone(),
                connected: p.connected(),
            })
            .collect()
    }

    pub fn role_reveals(&self) -> Vec<RoleReveal> {
        self.players
            .iter()
            .map(|p| RoleReveal {
                name: p.name.clone(),
                role: p.role,
            })
            .collect()
    }

    /// True once every currently-connected player has a vote recorded.
    pub fn all_connected_voted(&self) -> bool {
        self.connected_players() > 0
            && self
                .players
                .iter()
                .filter(|p| p.connected())
                .all(|p| p.vote.is_some())
    }

    /// Clear per-game state and return to the lobby phase.
    pub fn reset_game(&mut self) {
        self.phase = Phase::Lobby;
        self.word = None;
        self.hint = None;
        self.round1.clear();
        self.round2.clear();
        self.restart_ready.clear();
        self.turn = 0;
        self.ejected = None;
        self.impostor_missing_since = None;
        self.low_players_since = None;
        for p in self.players.iter_mut().chain(self.spectators.iter_mut()) {
            p.role = None;
            p.vote = None;
        }
        self.timers.cancel_all();
    }
}

/// Strip HTML-significant characters, trim, cap the length. An empty
/// result falls back to a generic name.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| *c != '<' && *c != '>').collect();
    let capped: String = cleaned.trim().chars().take(MAX_NAME_LEN).collect();
    let capped = capped.trim();
    if capped.is_empty() {
        "Player".to_string()
    } else {
        capped.to_string()
    }
}

/// Sanitize a submitted word. Returns None when nothing is left, which
/// the caller treats as a silent no-op.
pub fn sanitize_word(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| *c != '<' && *c != '>').collect();
    let capped: String = cleaned.trim().chars().take(MAX_WORD_LEN).collect();
    let trimmed = capped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Tally votes by voted-for name. The strict plurality winner is ejected;
/// any tie at the maximum count nullifies the ejection.
pub fn resolve_votes<'a>(votes: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for vote in votes {
        match counts.iter_mut().find(|(name, _)| name == vote) {
            Some((_, count)) => *count += 1,
            None => counts.push((vote.to_string(), 1)),
        }
    }
    let max = counts.iter().map(|(_, count)| *count).max()?;
    let mut leaders = counts.into_iter().filter(|(_, count)| *count == max);
    let leader = leaders.next()?;
    if leaders.next().is_some() {
        None
    } else {
        Some(leader.0)
    }
}
