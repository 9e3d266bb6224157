use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::protocol::Envelope;

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Token returned when registering a handler; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Multicast registry: every handler under a key sees every message for it.
pub struct Listeners<K> {
    next_id: AtomicU64,
    by_key: DashMap<K, Vec<(ListenerId, Handler)>>,
    keys: DashMap<ListenerId, K>,
}

impl<K: Eq + Hash + Clone> Default for Listeners<K> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_key: DashMap::new(),
            keys: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> Listeners<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, key: K, handler: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_key
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        self.keys.insert(id, key);
        id
    }

    /// Returns false if the id was unknown or already removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let Some((_, key)) = self.keys.remove(&id) else {
            return false;
        };
        let mut now_empty = false;
        if let Some(mut handlers) = self.by_key.get_mut(&key) {
            handlers.retain(|(hid, _)| *hid != id);
            now_empty = handlers.is_empty();
        }
        if now_empty {
            self.by_key.remove_if(&key, |_, handlers| handlers.is_empty());
        }
        true
    }

    /// Call every handler registered under `key`. Returns how many ran.
    pub fn emit(&self, key: &K, envelope: &Envelope) -> usize {
        // Handlers run outside the map lock so they may (un)register freely.
        let handlers: Vec<Handler> = self
            .by_key
            .get(key)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(envelope);
        }
        handlers.len()
    }

    pub fn count(&self, key: &K) -> usize {
        self.by_key.get(key).map(|hs| hs.len()).unwrap_or(0)
    }
}
