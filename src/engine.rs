use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::lobby::{
    resolve_votes, sanitize_word, ConnId, Connection, Lobby, Participant, Phase, Role,
    TurnEntry, MAX_PLAYERS,
};
use crate::messages::{ClientMessage, LobbyInfo, ServerMessage};
use crate::registry::LobbyRegistry;
use crate::timer::TimerFamily;
use crate::words::WordEntry;

pub const WINNER_IMPOSTOR: &str = "Impostor";
pub const WINNER_CIVILIANS: &str = "Civilians";
pub const REASON_IMPOSTOR_LEFT: &str = "impostor_left";
pub const REASON_NOT_ENOUGH_PLAYERS: &str = "not_enough_players";

/// Everything that can wake the engine. Inbound actions, transport
/// lifecycle, timer firings and the background sweep all funnel through
/// one channel, so lobby state is only ever touched from one task.
pub enum Event {
    Connected {
        conn: Connection,
    },
    Inbound {
        conn_id: ConnId,
        msg: ClientMessage,
    },
    Disconnected {
        conn_id: ConnId,
    },
    TimerFired {
        lobby_id: String,
        family: TimerFamily,
        generation: u64,
    },
    Sweep,
    LobbyListQuery {
        reply: oneshot::Sender<Vec<LobbyInfo>>,
    },
}

/// Timing knobs. Production uses the defaults; tests shrink them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub turn_timeout: Duration,
    pub guess_timeout: Duration,
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    pub eviction_after: Duration,
    pub voting_delay: Duration,
    pub min_players: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(30),
            guess_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            eviction_after: Duration::from_secs(60),
            voting_delay: Duration::from_millis(1500),
            min_players: 3,
        }
    }
}

/// Failures that are reported back to the acting client as an `error`
/// event. Authorization and staleness problems are deliberately not
/// here: those are silently dropped.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Lobby not found")]
    LobbyNotFound,
    #[error("Lobby is full")]
    LobbyFull,
    #[error("Not enough players to start")]
    NotEnoughPlayers,
    #[error("No words available")]
    NoWordsAvailable,
}

#[derive(Debug, Clone)]
struct Binding {
    lobby_id: String,
    player_id: String,
    epoch: u64,
}

enum RemovalNotice {
    Exited,
    Closed(&'static str),
    Silent,
}

/// Spawn the engine task plus its sweep ticker; returns the event sender
/// the transport layer feeds.
pub fn spawn(cfg: EngineConfig, words: Arc<Vec<WordEntry>>) -> mpsc::UnboundedSender<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sweep_interval = cfg.sweep_interval;
    let engine = Engine::new(cfg, words, tx.clone());
    tokio::spawn(engine.run(rx));

    let sweep_tx = tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sweep_tx.send(Event::Sweep).is_err() {
                break;
            }
        }
    });
    tx
}

pub struct Engine {
    cfg: EngineConfig,
    registry: LobbyRegistry,
    /// Every open connection, in a lobby or not.
    conns: HashMap<ConnId, Connection>,
    /// Connections currently attached to a participant, with the epoch
    /// they attached under.
    bindings: HashMap<ConnId, Binding>,
    events: mpsc::UnboundedSender<Event>,
    server_id: Uuid,
    last_listing: Option<Vec<LobbyInfo>>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        words: Arc<Vec<WordEntry>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            cfg,
            registry: LobbyRegistry::new(words),
            conns: HashMap::new(),
            bindings: HashMap::new(),
            events,
            server_id: Uuid::new_v4(),
            last_listing: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!(server_id = %self.server_id, "session engine started");
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Connected { conn } => self.on_connected(conn),
            Event::Inbound { conn_id, msg } => self.on_inbound(conn_id, msg),
            Event::Disconnected { conn_id } => self.on_disconnected(conn_id),
            Event::TimerFired {
                lobby_id,
                family,
                generation,
            } => self.on_timer(&lobby_id, family, generation),
            Event::Sweep => self.sweep(),
            Event::LobbyListQuery { reply } => {
                let _ = reply.send(self.registry.list_public());
            }
        }
    }

    fn on_connected(&mut self, conn: Connection) {
        conn.send(ServerMessage::ServerHello {
            server_id: self.server_id,
        });
        conn.send(ServerMessage::LobbyList {
            lobbies: self.registry.list_public(),
        });
        self.conns.insert(conn.id, conn);
    }

    fn on_inbound(&mut self, conn_id: ConnId, msg: ClientMessage) {
        match msg {
            ClientMessage::Ping => self.send_to_conn(conn_id, ServerMessage::Pong),
            ClientMessage::GetLobbyList => {
                let lobbies = self.registry.list_public();
                self.send_to_conn(conn_id, ServerMessage::LobbyList { lobbies });
            }
            ClientMessage::JoinLobby {
                player_id,
                name,
                lobby_id,
            } => {
                if let Err(err) = self.join(conn_id, player_id, name, lobby_id, false) {
                    self.send_to_conn(
                        conn_id,
                        ServerMessage::Error {
                            message: err.to_string(),
                        },
                    );
                }
            }
            ClientMessage::JoinSpectator {
                player_id,
                name,
                lobby_id,
            } => {
                if let Err(err) = self.join(conn_id, player_id, name, Some(lobby_id), true) {
                    self.send_to_conn(
                        conn_id,
                        ServerMessage::Error {
                            message: err.to_string(),
                        },
                    );
                }
            }
            other => self.on_lobby_action(conn_id, other),
        }
    }

    /// Actions that require an attached, current-epoch participant.
    /// A missing binding or an epoch mismatch means the socket was
    /// superseded; its messages are dropped without a reply.
    fn on_lobby_action(&mut self, conn_id: ConnId, msg: ClientMessage) {
        let Some(binding) = self.bindings.get(&conn_id).cloned() else {
            return;
        };
        let current_epoch = self
            .registry
            .get(&binding.lobby_id)
            .and_then(|lobby| lobby.participant(&binding.player_id))
            .map(|p| p.epoch);
        if current_epoch != Some(binding.epoch) {
            debug!(
                lobby = %binding.lobby_id,
                player = %binding.player_id,
                "dropping message from superseded socket"
            );
            return;
        }
        match msg {
            ClientMessage::ExitLobby => {
                self.remove_participant(
                    &binding.lobby_id,
                    &binding.player_id,
                    RemovalNotice::Exited,
                );
            }
            ClientMessage::ToggleImpostorGuess { enabled } => {
                self.toggle_impostor_guess(&binding, enabled)
            }
            ClientMessage::StartGame => self.start_requested(conn_id, &binding),
            ClientMessage::SubmitWord { word } => self.submit_word(&binding, word),
            ClientMessage::Vote { vote } => self.vote(&binding, vote),
            ClientMessage::ImpostorGuess { guess } => self.impostor_guess(&binding, guess),
            ClientMessage::Restart => self.restart(&binding),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Identity & presence reconciliation
    // ------------------------------------------------------------------

    fn join(
        &mut self,
        conn_id: ConnId,
        player_id: String,
        name: String,
        lobby_id: Option<String>,
        spectator: bool,
    ) -> Result<(), ActionError> {
        let Some(conn) = self.conns.get(&conn_id).cloned() else {
            return Ok(());
        };
        let lobby_id = lobby_id
            .map(|id| normalize_lobby_id(&id))
            .filter(|id| !id.is_empty());
        let lobby_id = match lobby_id {
            Some(id) => {
                if spectator && !self.registry.contains(&id) {
                    return Err(ActionError::LobbyNotFound);
                }
                id
            }
            None if spectator => return Err(ActionError::LobbyNotFound),
            None => self.registry.fresh_code(),
        };

        // A client may belong to only one lobby at a time.
        self.remove_from_other_lobbies(&player_id, &lobby_id);

        if !spectator {
            self.registry.create(&lobby_id);
        }

        let (player_name, epoch) = {
            let lobby = self
                .registry
                .get_mut(&lobby_id)
                .ok_or(ActionError::LobbyNotFound)?;
            let gathering = matches!(lobby.phase, Phase::Lobby | Phase::Results);
            let exists = lobby.participant(&player_id).is_some();

            if exists {
                // Between games the seat kind may change; mid-game this is
                // purely a reconnect.
                if gathering {
                    if spectator {
                        demote_to_spectator(lobby, &player_id);
                    } else {
                        if lobby.spectators.iter().any(|p| p.id == player_id)
                            && lobby.players.len() >= MAX_PLAYERS
                        {
                            return Err(ActionError::LobbyFull);
                        }
                        promote_to_player(lobby, &player_id);
                    }
                }
                let participant = lobby
                    .participant_mut(&player_id)
                    .ok_or(ActionError::LobbyNotFound)?;
                if let Some(old) = participant.attach(conn.clone()) {
                    if old.id != conn_id {
                        old.send(ServerMessage::LobbyClosed {
                            message: "A newer session took over this seat".to_string(),
                        });
                        self.bindings.remove(&old.id);
                    }
                }
                let name = participant.name.clone();
                let epoch = participant.epoch;
                (name, epoch)
            } else {
                // During a running game an unknown player id is admitted
                // as a spectator instead.
                let as_spectator = spectator || !gathering;
                if !as_spectator && lobby.players.len() >= MAX_PLAYERS {
                    return Err(ActionError::LobbyFull);
                }
                let deduped = lobby.dedup_name(&name);
                let participant =
                    Participant::new(player_id.clone(), deduped.clone(), conn.clone(), as_spectator);
                if as_spectator {
                    lobby.spectators.push(participant);
                } else {
                    lobby.players.push(participant);
                    if lobby.owner.is_none() {
                        lobby.owner = Some(player_id.clone());
                    }
                }
                (deduped, 1)
            }
        };

        self.bindings.insert(
            conn_id,
            Binding {
                lobby_id: lobby_id.clone(),
                player_id: player_id.clone(),
                epoch,
            },
        );

        let (is_spectator, is_owner, option) = {
            let lobby = self
                .registry
                .get(&lobby_id)
                .ok_or(ActionError::LobbyNotFound)?;
            let participant = lobby
                .participant(&player_id)
                .ok_or(ActionError::LobbyNotFound)?;
            (
                participant.is_spectator,
                lobby.is_owner(&player_id),
                lobby.impostor_guess_option,
            )
        };
        conn.send(ServerMessage::LobbyAssigned {
            lobby_id: lobby_id.clone(),
            is_spectator,
            player_name: player_name.clone(),
            is_owner,
            impostor_guess_option: option,
        });

        info!(lobby = %lobby_id, player = %player_name, spectator = is_spectator, "participant joined");

        self.broadcast_lobby_update(&lobby_id);
        self.recover_state(&lobby_id, &player_id);
        self.refresh_grace(&lobby_id);
        self.ensure_turn(&lobby_id);
        self.publish_listing();
        Ok(())
    }

    fn remove_from_other_lobbies(&mut self, player_id: &str, except: &str) {
        for id in self.registry.ids() {
            if id == except {
                continue;
            }
            let member = self
                .registry
                .get(&id)
                .map_or(false, |lobby| lobby.participant(player_id).is_some());
            if member {
                self.remove_participant(
                    &id,
                    player_id,
                    RemovalNotice::Closed("You joined another lobby"),
                );
            }
        }
    }

    /// Replay the running game to a freshly (re)attached participant so a
    /// reloaded client can render the full state.
    fn recover_state(&self, lobby_id: &str, player_id: &str) {
        let Some(lobby) = self.registry.get(lobby_id) else {
            return;
        };
        let Some(participant) = lobby.participant(player_id) else {
            return;
        };
        let Some(conn) = participant.conn.clone() else {
            return;
        };
        if let (Some(word), Some(hint)) = (&lobby.word, &lobby.hint) {
            conn.send(game_start_view(participant, word, hint));
        }
        match lobby.phase {
            Phase::Round1 | Phase::Round2 => conn.send(turn_update_msg(lobby, false)),
            Phase::Voting => {
                conn.send(turn_update_msg(lobby, false));
                conn.send(ServerMessage::StartVoting {
                    players: connected_player_names(lobby),
                });
            }
            Phase::ImpostorGuess => {
                if let Some(deadline) = lobby.timers.deadline(TimerFamily::Guess) {
                    conn.send(ServerMessage::ImpostorGuessPhase {
                        ejected: lobby.ejected.clone(),
                        is_impostor: true,
                        guess_ends_at: deadline.timestamp_millis(),
                    });
                }
            }
            Phase::Results => conn.send(restart_update_msg(lobby)),
            Phase::Lobby => {}
        }
    }

    /// The shared removal path: explicit exit, eviction, and single-lobby
    /// enforcement all go through here.
    fn remove_participant(&mut self, lobby_id: &str, player_id: &str, notice: RemovalNotice) {
        let (phase, was_impostor, empty, name) = {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            let phase = lobby.phase;
            let turn_holder = if phase.is_playing() && lobby.turn < lobby.players.len() {
                Some(lobby.players[lobby.turn].id.clone())
            } else {
                None
            };

            let removed = if let Some(pos) = lobby.players.iter().position(|p| p.id == player_id)
            {
                Some(lobby.players.remove(pos))
            } else {
                lobby
                    .spectators
                    .iter()
                    .position(|p| p.id == player_id)
                    .map(|pos| lobby.spectators.remove(pos))
            };
            let Some(removed) = removed else {
                return;
            };
            lobby.restart_ready.remove(player_id);

            if let Some(conn) = &removed.conn {
                match notice {
                    RemovalNotice::Exited => conn.send(ServerMessage::LobbyExited),
                    RemovalNotice::Closed(message) => conn.send(ServerMessage::LobbyClosed {
                        message: message.to_string(),
                    }),
                    RemovalNotice::Silent => {}
                }
                self.bindings.remove(&conn.id);
            }

            if lobby.owner.as_deref() == Some(player_id) {
                lobby.reassign_owner();
            }

            // Re-point the turn index at the same seat holder, or at the
            // successor seat when the holder itself left.
            if let Some(holder) = turn_holder {
                if holder == player_id {
                    lobby.timers.cancel(TimerFamily::Turn);
                    if lobby.turn >= lobby.players.len() {
                        lobby.turn = 0;
                    }
                } else if let Some(pos) = lobby.players.iter().position(|p| p.id == holder) {
                    lobby.turn = pos;
                }
            }

            (
                phase,
                removed.role == Some(Role::Impostor),
                lobby.is_empty(),
                removed.name,
            )
        };

        info!(lobby = %lobby_id, player = %name, "participant removed");

        if empty {
            if let Some(mut lobby) = self.registry.delete(lobby_id) {
                lobby.timers.cancel_all();
            }
            info!(lobby = %lobby_id, "lobby deleted");
            self.publish_listing();
            return;
        }

        if phase.is_playing() {
            if was_impostor {
                // A removed impostor can never come back; no grace window.
                self.end_early(lobby_id, REASON_IMPOSTOR_LEFT);
            } else {
                if !self.check_round_completion(lobby_id, false) {
                    self.ensure_turn(lobby_id);
                }
                self.check_vote_resolution(lobby_id);
                self.refresh_grace(lobby_id);
            }
        }
        if phase == Phase::Results {
            self.check_restart(lobby_id);
        }

        self.broadcast_lobby_update(lobby_id);
        self.publish_listing();
    }

    fn on_disconnected(&mut self, conn_id: ConnId) {
        self.conns.remove(&conn_id);
        let Some(binding) = self.bindings.remove(&conn_id) else {
            return;
        };
        let now = Utc::now();
        let phase = {
            let Some(lobby) = self.registry.get_mut(&binding.lobby_id) else {
                return;
            };
            let phase = lobby.phase;
            let Some(participant) = lobby.participant_mut(&binding.player_id) else {
                return;
            };
            // Only the authoritative socket marks the participant offline.
            let is_current = participant.epoch == binding.epoch
                && participant.conn.as_ref().map(|c| c.id) == Some(conn_id);
            if !is_current {
                return;
            }
            participant.detach(now);
            info!(
                lobby = %binding.lobby_id,
                player = %participant.name,
                "participant disconnected"
            );
            phase
        };

        if phase.is_playing() {
            self.refresh_grace(&binding.lobby_id);
            if !self.check_round_completion(&binding.lobby_id, false) {
                self.ensure_turn(&binding.lobby_id);
            }
            self.check_vote_resolution(&binding.lobby_id);
        }
        if phase == Phase::Results {
            self.check_restart(&binding.lobby_id);
        }
        self.broadcast_lobby_update(&binding.lobby_id);
        self.publish_listing();
    }

    // ------------------------------------------------------------------
    // Phase state machine
    // ------------------------------------------------------------------

    fn toggle_impostor_guess(&mut self, binding: &Binding, enabled: bool) {
        {
            let Some(lobby) = self.registry.get_mut(&binding.lobby_id) else {
                return;
            };
            if lobby.phase != Phase::Lobby || !lobby.is_owner(&binding.player_id) {
                return;
            }
            lobby.impostor_guess_option = enabled;
        }
        self.broadcast_lobby_update(&binding.lobby_id);
        self.publish_listing();
    }

    fn start_requested(&mut self, conn_id: ConnId, binding: &Binding) {
        let allowed = self.registry.get(&binding.lobby_id).map_or(false, |lobby| {
            lobby.phase == Phase::Lobby && lobby.is_owner(&binding.player_id)
        });
        if !allowed {
            return;
        }
        if let Err(err) = self.start_game(&binding.lobby_id) {
            self.send_to_conn(
                conn_id,
                ServerMessage::Error {
                    message: err.to_string(),
                },
            );
        }
    }

    fn start_game(&mut self, lobby_id: &str) -> Result<(), ActionError> {
        let turn_deadline = self.after(self.cfg.turn_timeout);
        let events = self.events.clone();
        {
            let lobby = self
                .registry
                .get_mut(lobby_id)
                .ok_or(ActionError::LobbyNotFound)?;
            let connected: Vec<usize> = lobby
                .players
                .iter()
                .enumerate()
                .filter(|(_, p)| p.connected())
                .map(|(i, _)| i)
                .collect();
            if connected.len() < self.cfg.min_players {
                return Err(ActionError::NotEnoughPlayers);
            }
            let entry = lobby.pool.draw().ok_or(ActionError::NoWordsAvailable)?;

            lobby.round1.clear();
            lobby.round2.clear();
            lobby.restart_ready.clear();
            lobby.ejected = None;
            lobby.impostor_missing_since = None;
            lobby.low_players_since = None;
            for p in lobby
                .players
                .iter_mut()
                .chain(lobby.spectators.iter_mut())
            {
                p.role = None;
                p.vote = None;
            }

            let impostor = connected[thread_rng().gen_range(0..connected.len())];
            for (i, p) in lobby.players.iter_mut().enumerate() {
                p.role = Some(if i == impostor {
                    Role::Impostor
                } else {
                    Role::Civilian
                });
            }

            lobby.word = Some(entry.word.clone());
            lobby.hint = Some(entry.hint.clone());
            lobby.turn = lobby.next_connected_from(0).unwrap_or(0);
            lobby.phase = Phase::Round1;

            for p in lobby.players.iter().chain(lobby.spectators.iter()) {
                p.send(game_start_view(p, &entry.word, &entry.hint));
            }
            lobby
                .timers
                .arm(TimerFamily::Turn, turn_deadline, lobby.id.clone(), events);
            info!(lobby = %lobby_id, word = %entry.word, "game started");
        }
        self.broadcast_turn_update(lobby_id, false);
        self.publish_listing();
        Ok(())
    }

    fn submit_word(&mut self, binding: &Binding, raw: String) {
        {
            let Some(lobby) = self.registry.get_mut(&binding.lobby_id) else {
                return;
            };
            if !matches!(lobby.phase, Phase::Round1 | Phase::Round2) {
                return;
            }
            let Some(current) = lobby.players.get(lobby.turn) else {
                return;
            };
            if current.id != binding.player_id {
                return;
            }
            let Some(word) = sanitize_word(&raw) else {
                return;
            };
            let player_name = current.name.clone();
            lobby.current_round_mut().push(TurnEntry { player_name, word });
        }
        if !self.check_round_completion(&binding.lobby_id, false) {
            self.rotate_turn(&binding.lobby_id, false);
        }
    }

    /// A round is complete once the submissions recorded this round reach
    /// the number of currently connected players; the threshold shrinks
    /// and grows with the roster.
    fn check_round_completion(&mut self, lobby_id: &str, timeout: bool) -> bool {
        let turn_deadline = self.after(self.cfg.turn_timeout);
        let voting_deadline = self.after(self.cfg.voting_delay);
        let events = self.events.clone();
        let advanced = {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return false;
            };
            if !matches!(lobby.phase, Phase::Round1 | Phase::Round2) {
                return false;
            }
            let connected = lobby.connected_players();
            if connected == 0 || lobby.current_round().len() < connected {
                return false;
            }
            match lobby.phase {
                Phase::Round1 => {
                    lobby.phase = Phase::Round2;
                    lobby.turn = lobby.next_connected_from(0).unwrap_or(0);
                    lobby
                        .timers
                        .arm(TimerFamily::Turn, turn_deadline, lobby.id.clone(), events);
                }
                Phase::Round2 => {
                    lobby.phase = Phase::Voting;
                    lobby.timers.cancel(TimerFamily::Turn);
                    lobby.timers.arm(
                        TimerFamily::VotingDelay,
                        voting_deadline,
                        lobby.id.clone(),
                        events,
                    );
                }
                _ => unreachable!(),
            }
            lobby.phase
        };
        info!(lobby = %lobby_id, phase = ?advanced, "round complete");
        self.broadcast_turn_update(lobby_id, timeout);
        true
    }

    fn rotate_turn(&mut self, lobby_id: &str, timeout: bool) {
        let turn_deadline = self.after(self.cfg.turn_timeout);
        let events = self.events.clone();
        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            if !matches!(lobby.phase, Phase::Round1 | Phase::Round2) {
                return;
            }
            match lobby.next_connected_from(lobby.turn + 1) {
                Some(next) => {
                    lobby.turn = next;
                    lobby
                        .timers
                        .arm(TimerFamily::Turn, turn_deadline, lobby.id.clone(), events);
                }
                None => {
                    // Nobody is connected; abandon the scan until a
                    // reconnect or the grace period resolves it.
                    lobby.timers.cancel(TimerFamily::Turn);
                }
            }
        }
        self.broadcast_turn_update(lobby_id, timeout);
    }

    /// Re-establish a valid turn after a reconnect or roster change:
    /// point the turn at a connected player and make sure a deadline is
    /// armed.
    fn ensure_turn(&mut self, lobby_id: &str) {
        let turn_deadline = self.after(self.cfg.turn_timeout);
        let events = self.events.clone();
        let mut changed = false;
        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            if !matches!(lobby.phase, Phase::Round1 | Phase::Round2) || lobby.players.is_empty() {
                return;
            }
            if lobby.turn >= lobby.players.len() {
                lobby.turn = 0;
            }
            if !lobby.players[lobby.turn].connected() {
                match lobby.next_connected_from(lobby.turn) {
                    Some(next) => {
                        lobby.turn = next;
                        changed = true;
                    }
                    None => {
                        lobby.timers.cancel(TimerFamily::Turn);
                        return;
                    }
                }
            }
            if lobby.timers.deadline(TimerFamily::Turn).is_none() {
                lobby
                    .timers
                    .arm(TimerFamily::Turn, turn_deadline, lobby.id.clone(), events);
                changed = true;
            }
        }
        if changed {
            self.broadcast_turn_update(lobby_id, false);
        }
    }

    fn vote(&mut self, binding: &Binding, target: String) {
        {
            let Some(lobby) = self.registry.get_mut(&binding.lobby_id) else {
                return;
            };
            if lobby.phase != Phase::Voting {
                return;
            }
            let Some(voter) = lobby.players.iter().find(|p| p.id == binding.player_id) else {
                return;
            };
            if voter.role.is_none() || voter.name == target {
                return;
            }
            if !lobby.players.iter().any(|p| p.name == target) {
                return;
            }
            let voter_name = voter.name.clone();
            if let Some(voter) = lobby.participant_mut(&binding.player_id) {
                voter.vote = Some(target.clone());
            }
            debug!(lobby = %binding.lobby_id, voter = %voter_name, "vote recorded");
        }
        self.check_vote_resolution(&binding.lobby_id);
    }

    /// Resolves at most once per round, the instant every currently
    /// connected player has a vote recorded.
    fn check_vote_resolution(&mut self, lobby_id: &str) {
        let (ejected, ejected_is_impostor, guess_option) = {
            let Some(lobby) = self.registry.get(lobby_id) else {
                return;
            };
            if lobby.phase != Phase::Voting || !lobby.all_connected_voted() {
                return;
            }
            let ejected = resolve_votes(lobby.players.iter().filter_map(|p| p.vote.as_deref()));
            let is_impostor = match (&ejected, lobby.impostor()) {
                (Some(name), Some(impostor)) => *name == impostor.name,
                _ => false,
            };
            (ejected, is_impostor, lobby.impostor_guess_option)
        };

        if ejected_is_impostor && guess_option {
            self.enter_impostor_guess(lobby_id, ejected.unwrap_or_default());
        } else if ejected_is_impostor {
            self.finish_game(lobby_id, WINNER_CIVILIANS, None);
        } else {
            // No ejection (tie) or a civilian ejected: the impostor wins.
            self.finish_game(lobby_id, WINNER_IMPOSTOR, None);
        }
    }

    fn enter_impostor_guess(&mut self, lobby_id: &str, ejected: String) {
        let deadline = self.after(self.cfg.guess_timeout);
        let events = self.events.clone();
        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            lobby.phase = Phase::ImpostorGuess;
            lobby.ejected = Some(ejected.clone());
            lobby.timers.cancel(TimerFamily::Turn);
            lobby.timers.cancel(TimerFamily::VotingDelay);
            lobby
                .timers
                .arm(TimerFamily::Guess, deadline, lobby.id.clone(), events);
        }
        info!(lobby = %lobby_id, ejected = %ejected, "impostor may guess the word");
        self.broadcast(
            lobby_id,
            ServerMessage::ImpostorGuessPhase {
                ejected: Some(ejected),
                is_impostor: true,
                guess_ends_at: deadline.timestamp_millis(),
            },
        );
    }

    fn impostor_guess(&mut self, binding: &Binding, guess: String) {
        let correct = {
            let Some(lobby) = self.registry.get(&binding.lobby_id) else {
                return;
            };
            if lobby.phase != Phase::ImpostorGuess {
                return;
            }
            let Some(participant) = lobby.participant(&binding.player_id) else {
                return;
            };
            if participant.role != Some(Role::Impostor) {
                return;
            }
            match &lobby.word {
                Some(word) => word.trim().to_lowercase() == guess.trim().to_lowercase(),
                None => false,
            }
        };
        let winner = if correct {
            WINNER_IMPOSTOR
        } else {
            WINNER_CIVILIANS
        };
        self.finish_game(&binding.lobby_id, winner, Some((guess, correct)));
    }

    fn finish_game(&mut self, lobby_id: &str, winner: &str, guess: Option<(String, bool)>) {
        let Some(lobby) = self.registry.get_mut(lobby_id) else {
            return;
        };
        lobby.timers.cancel_all();
        lobby.phase = Phase::Results;
        lobby.ejected = None;
        lobby.impostor_missing_since = None;
        lobby.low_players_since = None;
        lobby.restart_ready.clear();

        let votes: HashMap<String, String> = lobby
            .players
            .iter()
            .filter_map(|p| p.vote.clone().map(|v| (p.name.clone(), v)))
            .collect();
        let msg = ServerMessage::GameEnd {
            roles: lobby.role_reveals(),
            votes,
            secret_word: lobby.word.clone().unwrap_or_default(),
            hint: lobby.hint.clone().unwrap_or_default(),
            winner: winner.to_string(),
            impostor_guess: guess.as_ref().map(|(g, _)| g.clone()),
            impostor_guess_correct: guess.as_ref().map(|(_, c)| *c),
        };
        for p in lobby.participants() {
            p.send(msg.clone());
        }
        info!(lobby = %lobby_id, winner = %winner, "game finished");
    }

    fn end_early(&mut self, lobby_id: &str, reason: &str) {
        let Some(lobby) = self.registry.get_mut(lobby_id) else {
            return;
        };
        if !lobby.phase.is_playing() {
            return;
        }
        lobby.timers.cancel_all();
        lobby.phase = Phase::Results;
        lobby.ejected = None;
        lobby.impostor_missing_since = None;
        lobby.low_players_since = None;
        lobby.restart_ready.clear();

        let msg = ServerMessage::GameEndEarly {
            roles: lobby.role_reveals(),
            secret_word: lobby.word.clone().unwrap_or_default(),
            hint: lobby.hint.clone().unwrap_or_default(),
            winner: None,
            reason: reason.to_string(),
        };
        for p in lobby.participants() {
            p.send(msg.clone());
        }
        warn!(lobby = %lobby_id, reason = %reason, "game ended early");
    }

    // ------------------------------------------------------------------
    // Restart
    // ------------------------------------------------------------------

    fn restart(&mut self, binding: &Binding) {
        {
            let Some(lobby) = self.registry.get_mut(&binding.lobby_id) else {
                return;
            };
            if lobby.phase != Phase::Results {
                return;
            }
            let Some(participant) = lobby.participant(&binding.player_id) else {
                return;
            };
            if participant.is_spectator {
                if let Some(p) = lobby.participant_mut(&binding.player_id) {
                    p.wants_to_join_next_game = true;
                }
            } else if participant.role.is_some() && participant.connected() {
                lobby.restart_ready.insert(binding.player_id.clone());
            } else {
                return;
            }
        }
        self.broadcast_restart_update(&binding.lobby_id);
        self.check_restart(&binding.lobby_id);
    }

    fn check_restart(&mut self, lobby_id: &str) {
        let (orphaned, ready) = {
            let Some(lobby) = self.registry.get(lobby_id) else {
                return;
            };
            if lobby.phase != Phase::Results {
                return;
            }
            let orphaned = lobby.players.iter().all(|p| p.role.is_none());
            let (ready, total) = restart_counts(lobby);
            (orphaned, total > 0 && ready >= total)
        };
        if orphaned {
            // Nobody from the finished game is left at all: regroup in the
            // lobby phase so the newcomers can start fresh.
            if let Some(lobby) = self.registry.get_mut(lobby_id) {
                lobby.reset_game();
            }
            self.broadcast_lobby_update(lobby_id);
            self.publish_listing();
            return;
        }
        if !ready {
            return;
        }

        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            // Promote waiting spectators before the next game begins.
            while let Some(pos) = lobby
                .spectators
                .iter()
                .position(|p| p.wants_to_join_next_game)
            {
                if lobby.players.len() >= MAX_PLAYERS {
                    break;
                }
                promote_at(lobby, pos);
            }
        }
        self.broadcast_lobby_update(lobby_id);

        if self.start_game(lobby_id).is_err() {
            // Not enough players left for another game; regroup in the
            // lobby phase instead.
            if let Some(lobby) = self.registry.get_mut(lobby_id) {
                lobby.reset_game();
            }
            self.broadcast_lobby_update(lobby_id);
            self.publish_listing();
        }
    }

    // ------------------------------------------------------------------
    // Timers, grace periods, sweep
    // ------------------------------------------------------------------

    fn on_timer(&mut self, lobby_id: &str, family: TimerFamily, generation: u64) {
        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            if !lobby.timers.matches(family, generation) {
                return;
            }
            lobby.timers.clear(family);
        }
        match family {
            TimerFamily::Turn => self.on_turn_timeout(lobby_id),
            TimerFamily::Guess => {
                let playing = self
                    .registry
                    .get(lobby_id)
                    .map_or(false, |l| l.phase == Phase::ImpostorGuess);
                if playing {
                    // No guess given: the civilians win.
                    self.finish_game(lobby_id, WINNER_CIVILIANS, None);
                }
            }
            TimerFamily::VotingDelay => {
                let players = match self.registry.get(lobby_id) {
                    Some(lobby) if lobby.phase == Phase::Voting => connected_player_names(lobby),
                    _ => return,
                };
                self.broadcast(lobby_id, ServerMessage::StartVoting { players });
            }
        }
    }

    fn on_turn_timeout(&mut self, lobby_id: &str) {
        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            if !matches!(lobby.phase, Phase::Round1 | Phase::Round2) {
                return;
            }
            let Some(current) = lobby.players.get(lobby.turn) else {
                return;
            };
            let player_name = current.name.clone();
            info!(lobby = %lobby_id, player = %player_name, "turn timed out, skipping");
            lobby.current_round_mut().push(TurnEntry {
                player_name,
                word: String::new(),
            });
        }
        if !self.check_round_completion(lobby_id, true) {
            self.rotate_turn(lobby_id, true);
        }
    }

    /// Evaluate the abandonment grace windows. Called on every disconnect
    /// event and on the sweep cadence; a window that has cleared resets,
    /// one that has persisted past the grace period ends the game.
    fn refresh_grace(&mut self, lobby_id: &str) {
        let now = Utc::now();
        let grace = ChronoDuration::milliseconds(self.cfg.grace_period.as_millis() as i64);
        let min_players = self.cfg.min_players;
        let mut reason = None;
        {
            let Some(lobby) = self.registry.get_mut(lobby_id) else {
                return;
            };
            if !lobby.phase.is_playing() {
                lobby.impostor_missing_since = None;
                lobby.low_players_since = None;
                return;
            }

            let impostor_gone = lobby.impostor().map_or(false, |p| !p.connected());
            if impostor_gone {
                match lobby.impostor_missing_since {
                    None => lobby.impostor_missing_since = Some(now),
                    Some(since) if now - since >= grace => reason = Some(REASON_IMPOSTOR_LEFT),
                    Some(_) => {}
                }
            } else {
                lobby.impostor_missing_since = None;
            }

            let low = lobby.connected_players() < min_players;
            if low {
                match lobby.low_players_since {
                    None => lobby.low_players_since = Some(now),
                    Some(since) if now - since >= grace => {
                        reason = reason.or(Some(REASON_NOT_ENOUGH_PLAYERS));
                    }
                    Some(_) => {}
                }
            } else {
                lobby.low_players_since = None;
            }
        }
        if let Some(reason) = reason {
            self.end_early(lobby_id, reason);
        }
    }

    /// The 15-second background duty cycle: permanently evict anyone
    /// disconnected past the retention window, then run the abandonment
    /// checks for every mid-game lobby.
    fn sweep(&mut self) {
        let now = Utc::now();
        let retention = ChronoDuration::milliseconds(self.cfg.eviction_after.as_millis() as i64);
        for lobby_id in self.registry.ids() {
            let stale: Vec<String> = self
                .registry
                .get(&lobby_id)
                .map(|lobby| {
                    lobby
                        .participants()
                        .filter(|p| {
                            p.last_disconnect
                                .map_or(false, |since| now - since >= retention)
                        })
                        .map(|p| p.id.clone())
                        .collect()
                })
                .unwrap_or_default();
            for player_id in stale {
                info!(lobby = %lobby_id, player = %player_id, "evicting disconnected participant");
                self.remove_participant(&lobby_id, &player_id, RemovalNotice::Silent);
            }
            self.refresh_grace(&lobby_id);
        }
        self.publish_listing();
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    fn send_to_conn(&self, conn_id: ConnId, msg: ServerMessage) {
        if let Some(conn) = self.conns.get(&conn_id) {
            conn.send(msg);
        }
    }

    fn broadcast(&self, lobby_id: &str, msg: ServerMessage) {
        if let Some(lobby) = self.registry.get(lobby_id) {
            for p in lobby.participants() {
                p.send(msg.clone());
            }
        }
    }

    fn broadcast_lobby_update(&self, lobby_id: &str) {
        let Some(lobby) = self.registry.get(lobby_id) else {
            return;
        };
        let owner = lobby
            .owner
            .as_deref()
            .and_then(|id| lobby.participant(id))
            .map(|p| p.name.clone());
        let msg = ServerMessage::LobbyUpdate {
            players: lobby.player_infos(),
            spectators: lobby.spectator_infos(),
            owner,
            phase: lobby.phase,
            impostor_guess_option: lobby.impostor_guess_option,
        };
        for p in lobby.participants() {
            p.send(msg.clone());
        }
    }

    fn broadcast_turn_update(&self, lobby_id: &str, timeout: bool) {
        let Some(lobby) = self.registry.get(lobby_id) else {
            return;
        };
        let msg = turn_update_msg(lobby, timeout);
        for p in lobby.participants() {
            p.send(msg.clone());
        }
    }

    fn broadcast_restart_update(&self, lobby_id: &str) {
        let Some(lobby) = self.registry.get(lobby_id) else {
            return;
        };
        let msg = restart_update_msg(lobby);
        for p in lobby.participants() {
            p.send(msg.clone());
        }
    }

    /// Republish the public directory to every connected client, but only
    /// when it actually changed.
    fn publish_listing(&mut self) {
        let listing = self.registry.list_public();
        if self.last_listing.as_ref() == Some(&listing) {
            return;
        }
        let msg = ServerMessage::LobbyList {
            lobbies: listing.clone(),
        };
        for conn in self.conns.values() {
            conn.send(msg.clone());
        }
        self.last_listing = Some(listing);
    }

    fn after(&self, duration: Duration) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(duration.as_millis() as i64)
    }
}

fn normalize_lobby_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '<' && *c != '>')
        .take(12)
        .collect::<String>()
        .trim()
        .to_string()
}

fn connected_player_names(lobby: &Lobby) -> Vec<String> {
    lobby
        .players
        .iter()
        .filter(|p| p.connected())
        .map(|p| p.name.clone())
        .collect()
}

/// (ready, total) over the connected players that hold a role.
fn restart_counts(lobby: &Lobby) -> (usize, usize) {
    let eligible: Vec<&Participant> = lobby
        .players
        .iter()
        .filter(|p| p.connected() && p.role.is_some())
        .collect();
    let ready = eligible
        .iter()
        .filter(|p| lobby.restart_ready.contains(&p.id))
        .count();
    (ready, eligible.len())
}

fn restart_update_msg(lobby: &Lobby) -> ServerMessage {
    let (ready_count, total_players) = restart_counts(lobby);
    ServerMessage::RestartUpdate {
        ready_count,
        total_players,
        spectators_wanting_to_join: lobby
            .spectators
            .iter()
            .filter(|p| p.wants_to_join_next_game)
            .count(),
    }
}

fn turn_update_msg(lobby: &Lobby, timeout: bool) -> ServerMessage {
    let current_player = match lobby.phase {
        Phase::Round1 | Phase::Round2 => lobby
            .players
            .get(lobby.turn)
            .filter(|p| p.connected())
            .map(|p| p.name.clone()),
        _ => None,
    };
    ServerMessage::TurnUpdate {
        phase: lobby.phase,
        round1: lobby.round1.clone(),
        round2: lobby.round2.clone(),
        current_player,
        turn_ends_at: lobby
            .timers
            .deadline(TimerFamily::Turn)
            .map(|d| d.timestamp_millis()),
        timeout_occurred: timeout.then_some(true),
    }
}

/// The per-participant view of a game start: the impostor sees only the
/// hint, everyone else (spectators included) sees the word.
fn game_start_view(participant: &Participant, word: &str, hint: &str) -> ServerMessage {
    match participant.role {
        Some(Role::Impostor) => ServerMessage::GameStart {
            role: participant.role,
            word: None,
            hint: Some(hint.to_string()),
            player_name: participant.name.clone(),
        },
        _ => ServerMessage::GameStart {
            role: participant.role,
            word: Some(word.to_string()),
            hint: None,
            player_name: participant.name.clone(),
        },
    }
}

fn promote_to_player(lobby: &mut Lobby, player_id: &str) {
    if let Some(pos) = lobby.spectators.iter().position(|p| p.id == player_id) {
        promote_at(lobby, pos);
    }
}

fn promote_at(lobby: &mut Lobby, pos: usize) {
    let mut p = lobby.spectators.remove(pos);
    p.is_spectator = false;
    p.wants_to_join_next_game = false;
    p.role = None;
    lobby.players.push(p);
}

fn demote_to_spectator(lobby: &mut Lobby, player_id: &str) {
    if let Some(pos) = lobby.players.iter().position(|p| p.id == player_id) {
        let mut p = lobby.players.remove(pos);
        p.is_spectator = true;
        p.role = None;
        if lobby.owner.as_deref() == Some(player_id) {
            lobby.reassign_owner();
        }
        lobby.spectators.push(p);
    }
}
