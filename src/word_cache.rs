use std::collections::{HashMap, VecDeque};

pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Remembers dictionary verdicts so repeated words skip the network.
///
/// Keys are case-insensitive. Eviction is by insertion order: once the cache
/// is full, the oldest tenth is dropped before a new word is stored.
#[derive(Debug)]
pub struct WordCache {
    entries: HashMap<String, bool>,
    order: VecDeque<String>,
    max_size: usize,
}

impl Default for WordCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl WordCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    fn key(word: &str) -> String {
        word.trim().to_lowercase()
    }

    /// `None` means the word has not been checked yet.
    pub fn get(&self, word: &str) -> Option<bool> {
        self.entries.get(&Self::key(word)).copied()
    }

    pub fn set(&mut self, word: &str, is_valid: bool) {
        let key = Self::key(word);
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = is_valid;
            return;
        }

        if self.entries.len() >= self.max_size {
            self.evict();
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, is_valid);
    }

    fn evict(&mut self) {
        let count = (self.max_size / 10).max(1);
        for _ in 0..count {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
        tracing::debug!("Evicted {} words from cache", count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
