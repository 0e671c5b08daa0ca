use anyhow::{bail, Context, Result};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One secret word together with the hint shown to the impostor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WordEntry {
    pub word: String,
    pub hint: String,
}

impl WordEntry {
    fn new(word: &str, hint: &str) -> Self {
        Self {
            word: word.to_string(),
            hint: hint.to_string(),
        }
    }
}

/// Load the static word list, either from a JSON file
/// (`[{"word": ..., "hint": ...}, ...]`) or from the built-in list.
pub fn load_words(path: Option<&Path>) -> Result<Arc<Vec<WordEntry>>> {
    let words = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read word list {}", path.display()))?;
            serde_json::from_str::<Vec<WordEntry>>(&raw)
                .with_context(|| format!("failed to parse word list {}", path.display()))?
        }
        None => default_words(),
    };
    if words.is_empty() {
        bail!("word list is empty");
    }
    Ok(Arc::new(words))
}

pub fn default_words() -> Vec<WordEntry> {
    vec![
        WordEntry::new("apple", "A fruit"),
        WordEntry::new("pizza", "Italian food"),
        WordEntry::new("guitar", "A musical instrument"),
        WordEntry::new("penguin", "An animal that cannot fly"),
        WordEntry::new("submarine", "Travels underwater"),
        WordEntry::new("library", "A quiet public place"),
        WordEntry::new("volcano", "A mountain with a secret"),
        WordEntry::new("chess", "A board game"),
        WordEntry::new("lighthouse", "Found on a coast"),
        WordEntry::new("honey", "Made by insects"),
        WordEntry::new("parachute", "Used while falling"),
        WordEntry::new("telescope", "Used to look far away"),
        WordEntry::new("waterfall", "Found in nature"),
        WordEntry::new("campfire", "Warm at night"),
        WordEntry::new("snowman", "Built in winter"),
        WordEntry::new("carousel", "Found at a fair"),
        WordEntry::new("anchor", "Part of a ship"),
        WordEntry::new("cactus", "A desert plant"),
        WordEntry::new("tornado", "Extreme weather"),
        WordEntry::new("violin", "A musical instrument"),
        WordEntry::new("astronaut", "A job few people have"),
        WordEntry::new("dentist", "A job many people fear"),
        WordEntry::new("origami", "A paper craft"),
        WordEntry::new("marathon", "A sporting event"),
        WordEntry::new("aquarium", "Full of water"),
        WordEntry::new("compass", "Helps with directions"),
        WordEntry::new("umbrella", "Used in bad weather"),
        WordEntry::new("skateboard", "Has wheels"),
        WordEntry::new("pyramid", "An ancient structure"),
        WordEntry::new("jellyfish", "Lives in the sea"),
        WordEntry::new("hammock", "Used for resting"),
        WordEntry::new("fireworks", "Seen at celebrations"),
        WordEntry::new("glacier", "Very cold"),
        WordEntry::new("keyboard", "Has many buttons"),
        WordEntry::new("passport", "Needed for travel"),
        WordEntry::new("scarecrow", "Found on a farm"),
        WordEntry::new("trampoline", "Makes you go up"),
        WordEntry::new("windmill", "Turns in the wind"),
        WordEntry::new("treasure", "Something pirates want"),
        WordEntry::new("labyrinth", "Easy to get lost in"),
    ]
}

/// Per-lobby word dispenser. Words are drawn without repeats until the
/// pool is exhausted, then the full list is reshuffled and reused.
pub struct WordPool {
    source: Arc<Vec<WordEntry>>,
    available: Vec<WordEntry>,
    used: Vec<WordEntry>,
}

impl WordPool {
    pub fn new(source: Arc<Vec<WordEntry>>) -> Self {
        Self {
            source,
            available: Vec::new(),
            used: Vec::new(),
        }
    }

    /// Draw one uniformly-random entry. Returns `None` only if the source
    /// list itself is empty.
    pub fn draw(&mut self) -> Option<WordEntry> {
        if self.available.is_empty() {
            self.reseed();
        }
        if self.available.is_empty() {
            return None;
        }
        let index = thread_rng().gen_range(0..self.available.len());
        let entry = self.available.swap_remove(index);
        self.used.push(entry.clone());
        Some(entry)
    }

    pub fn remaining(&self) -> usize {
        self.available.len()
    }

    fn reseed(&mut self) {
        self.available = self.source.as_ref().clone();
        self.used.clear();
        shuffle(&mut self.available);
    }
}

/// Unbiased shuffle: sweep from the last index down to 1, swapping each
/// position with a uniformly chosen earlier-or-equal index.
fn shuffle(entries: &mut [WordEntry]) {
    let mut rng = thread_rng();
    for i in (1..entries.len()).rev() {
        let j = rng.gen_range(0..=i);
        entries.swap(i, j);
    }
}
