use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::listeners::{ListenerId, Listeners};
use super::service::{ConnectionState, WebSocketService};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{Envelope, MessageType};
use crate::retry::RetryPolicy;

/// `gameId` or `gameId-playerId`.
pub fn connection_key(game_id: &str, player_id: Option<&str>) -> String {
    match player_id {
        Some(player_id) => format!("{game_id}-{player_id}"),
        None => game_id.to_string(),
    }
}

/// Keeps one live relay socket per connection key and fans each socket's
/// messages out to per-game listeners.
pub struct ConnectionManager {
    config: ClientConfig,
    connections: DashMap<String, Arc<WebSocketService>>,
    listeners: Arc<Listeners<(String, MessageType)>>,
    watchers: DashMap<String, JoinHandle<()>>,
    reconnects: Arc<DashMap<String, JoinHandle<()>>>,
    /// Serializes creation per connection key.
    create_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            listeners: Arc::new(Listeners::new()),
            watchers: DashMap::new(),
            reconnects: Arc::new(DashMap::new()),
            create_locks: DashMap::new(),
        }
    }

    /// Return the live connection for the key, or replace whatever is there
    /// with a freshly connected one.
    pub async fn get_or_create(
        &self,
        game_id: &str,
        player_id: Option<&str>,
    ) -> Result<Arc<WebSocketService>> {
        let key = connection_key(game_id, player_id);
        let lock = self.create_locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;

        let existing = self.connections.get(&key).map(|c| c.value().clone());
        if let Some(existing) = existing {
            if existing.is_connected() {
                return Ok(existing);
            }
            tracing::info!("Replacing stale connection {} ({})", key, existing.connection_state());
            self.teardown(&key);
        }

        let service = WebSocketService::new(&self.config, game_id, player_id)?;
        for kind in MessageType::ALL {
            let listeners = self.listeners.clone();
            let route = (game_id.to_string(), kind);
            service.on(kind, move |envelope| {
                listeners.emit(&route, envelope);
            });
        }

        service.connect(&self.config.connect_policy()).await?;
        self.watch(&key, &service);
        self.connections.insert(key, service.clone());
        Ok(service)
    }

    /// Schedule a single reconnect whenever the socket reports a disconnect.
    fn watch(&self, key: &str, service: &Arc<WebSocketService>) {
        let mut state = service.state();
        let weak = Arc::downgrade(service);
        let reconnects = self.reconnects.clone();
        let delay = self.config.reconnect_delay();
        let policy = self.config.reconnect_policy();
        let key_owned = key.to_string();

        let watcher = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                if current != ConnectionState::Disconnected {
                    continue;
                }
                let Some(service) = weak.upgrade() else { break };
                tracing::warn!("Connection {} dropped, reconnecting in {:?}", key_owned, delay);
                let timer = tokio::spawn(reconnect_after(service, delay, policy.clone(), key_owned.clone()));
                if let Some(previous) = reconnects.insert(key_owned.clone(), timer) {
                    previous.abort();
                }
            }
        });

        if let Some(previous) = self.watchers.insert(key.to_string(), watcher) {
            previous.abort();
        }
    }

    pub fn connection(&self, game_id: &str, player_id: Option<&str>) -> Option<Arc<WebSocketService>> {
        self.connections
            .get(&connection_key(game_id, player_id))
            .map(|c| c.value().clone())
    }

    /// Disconnect and forget the entry, cancelling any pending reconnect.
    pub fn remove_connection(&self, game_id: &str, player_id: Option<&str>) {
        let key = connection_key(game_id, player_id);
        self.teardown(&key);
    }

    fn teardown(&self, key: &str) {
        self.create_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        if let Some((_, watcher)) = self.watchers.remove(key) {
            watcher.abort();
        }
        if let Some((_, timer)) = self.reconnects.remove(key) {
            timer.abort();
        }
        if let Some((_, service)) = self.connections.remove(key) {
            service.disconnect();
        }
    }

    pub fn add_listener<F>(&self, game_id: &str, kind: MessageType, handler: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.listeners.add((game_id.to_string(), kind), handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self, game_id: &str, kind: MessageType) -> usize {
        self.listeners.count(&(game_id.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Tear down every connection.
    pub fn shutdown(&self) {
        let keys: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        for key in keys {
            self.teardown(&key);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
        for entry in self.watchers.iter() {
            entry.value().abort();
        }
        for entry in self.reconnects.iter() {
            entry.value().abort();
        }
    }
}

async fn reconnect_after(service: Arc<WebSocketService>, delay: Duration, policy: RetryPolicy, key: String) {
    tokio::time::sleep(delay).await;
    match service.connect(&policy).await {
        Ok(()) => tracing::info!("Reconnected {}", key),
        Err(e) => tracing::error!("Reconnect of {} failed: {}", key, e),
    }
}
