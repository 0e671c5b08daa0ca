use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::sync::Arc;

use crate::lobby::{Lobby, Phase, MAX_PLAYERS};
use crate::messages::LobbyInfo;
use crate::words::{WordEntry, WordPool};

/// Process-wide mapping from lobby id to lobby state. Owns creation and
/// deletion; the engine drives everything else.
pub struct LobbyRegistry {
    lobbies: HashMap<String, Lobby>,
    words: Arc<Vec<WordEntry>>,
}

impl LobbyRegistry {
    pub fn new(words: Arc<Vec<WordEntry>>) -> Self {
        Self {
            lobbies: HashMap::new(),
            words,
        }
    }

    /// Idempotent: returns the existing lobby when the id is already live.
    pub fn create(&mut self, id: &str) -> &mut Lobby {
        let words = self.words.clone();
        self.lobbies
            .entry(id.to_string())
            .or_insert_with(|| Lobby::new(id.to_string(), WordPool::new(words)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lobbies.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Lobby> {
        self.lobbies.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Lobby> {
        self.lobbies.get_mut(id)
    }

    pub fn delete(&mut self, id: &str) -> Option<Lobby> {
        self.lobbies.remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lobbies.keys().cloned().collect()
    }

    /// A short human-typable code not currently in use.
    pub fn fresh_code(&self) -> String {
        let mut rng = thread_rng();
        loop {
            let code = format!("{:04}", rng.gen_range(0..10_000));
            if !self.lobbies.contains_key(&code) {
                return code;
            }
        }
    }

    /// The public directory: only lobbies still gathering players, with
    /// live (connected) counts.
    pub fn list_public(&self) -> Vec<LobbyInfo> {
        let mut listing: Vec<LobbyInfo> = self
            .lobbies
            .values()
            .filter(|lobby| lobby.phase == Phase::Lobby)
            .map(|lobby| {
                let host = lobby
                    .owner
                    .as_deref()
                    .and_then(|id| lobby.participant(id))
                    .map(|p| p.name.clone());
                LobbyInfo {
                    id: lobby.id.clone(),
                    host,
                    player_count: lobby.players.iter().filter(|p| p.connected()).count(),
                    spectator_count: lobby.spectators.iter().filter(|p| p.connected()).count(),
                    max_players: MAX_PLAYERS,
                    phase: lobby.phase,
                    created_at: lobby.created_at.timestamp_millis(),
                    impostor_guess_option: lobby.impostor_guess_option,
                }
            })
            .collect();
        listing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::words::default_words;

    fn registry() -> LobbyRegistry {
        LobbyRegistry::new(Arc::new(default_words()))
    }

    #[test]
    fn create_is_idempotent() {
        let mut reg = registry();
        reg.create("1234").impostor_guess_option = true;
        let again = reg.create("1234");
        assert!(again.impostor_guess_option);
        assert_eq!(reg.ids().len(), 1);
    }

    #[test]
    fn delete_removes_the_lobby() {
        let mut reg = registry();
        reg.create("1234");
        assert!(reg.delete("1234").is_some());
        assert!(reg.get("1234").is_none());
        assert!(reg.delete("1234").is_none());
    }

    #[test]
    fn fresh_code_is_four_digits_and_unused() {
        let mut reg = registry();
        reg.create("0000");
        for _ in 0..50 {
            let code = reg.fresh_code();
            assert_eq!(code.len(), 4);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
            assert_ne!(code, "0000");
        }
    }

    #[test]
    fn listing_only_shows_gathering_lobbies() {
        let mut reg = registry();
        reg.create("1111");
        reg.create("2222").phase = Phase::Round1;

        let listing = reg.list_public();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, "1111");
        assert_eq!(listing[0].max_players, MAX_PLAYERS);
    }
}
