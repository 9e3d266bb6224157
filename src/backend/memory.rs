use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{BackendEvent, GameBackend};
use crate::error::{Error, Result};
use crate::types::{Game, GamePatch, Player, PlayerPatch};

/// Process-local backend. Useful for tests and for running without the
/// managed API; changes are published to subscribers like the real one.
#[derive(Default)]
pub struct MemoryBackend {
    games: DashMap<String, Game>,
    players: DashMap<String, Player>,
    /// game_id -> player ids in creation order
    roster: DashMap<String, Vec<String>>,
    events: DashMap<String, broadcast::Sender<BackendEvent>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, game_id: &str, event: BackendEvent) {
        if let Some(tx) = self.events.get(game_id) {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl GameBackend for MemoryBackend {
    async fn get_game(&self, id: &str) -> Result<Option<Game>> {
        Ok(self.games.get(id).map(|g| g.value().clone()))
    }

    async fn get_player(&self, id: &str) -> Result<Option<Player>> {
        Ok(self.players.get(id).map(|p| p.value().clone()))
    }

    async fn players_by_game_id(&self, game_id: &str) -> Result<Vec<Player>> {
        let ids = self
            .roster
            .get(game_id)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.players.get(id).map(|p| p.value().clone()))
            .collect())
    }

    async fn create_game(&self, game: &Game) -> Result<Game> {
        match self.games.entry(game.id.clone()) {
            Entry::Occupied(_) => Err(Error::Backend(format!("game {} already exists", game.id))),
            Entry::Vacant(slot) => {
                slot.insert(game.clone());
                Ok(game.clone())
            }
        }
    }

    async fn create_player(&self, player: &Player) -> Result<Player> {
        if !self.games.contains_key(&player.game_id) {
            return Err(Error::NotFound {
                entity: "game",
                id: player.game_id.clone(),
            });
        }
        self.players.insert(player.id.clone(), player.clone());
        self.roster
            .entry(player.game_id.clone())
            .or_default()
            .push(player.id.clone());
        self.publish(&player.game_id, BackendEvent::PlayerCreated(player.clone()));
        Ok(player.clone())
    }

    async fn update_game(&self, id: &str, patch: &GamePatch) -> Result<Game> {
        let updated = {
            let mut game = self.games.get_mut(id).ok_or_else(|| Error::NotFound {
                entity: "game",
                id: id.to_string(),
            })?;
            game.apply(patch);
            game.clone()
        };
        self.publish(id, BackendEvent::GameUpdated(updated.clone()));
        Ok(updated)
    }

    async fn update_player(&self, id: &str, patch: &PlayerPatch) -> Result<Player> {
        let updated = {
            let mut player = self.players.get_mut(id).ok_or_else(|| Error::NotFound {
                entity: "player",
                id: id.to_string(),
            })?;
            player.apply(patch);
            player.clone()
        };
        self.publish(&updated.game_id, BackendEvent::PlayerUpdated(updated.clone()));
        Ok(updated)
    }

    async fn claim_host(&self, game_id: &str, player_id: &str) -> Result<bool> {
        let claimed = {
            let mut game = self.games.get_mut(game_id).ok_or_else(|| Error::NotFound {
                entity: "game",
                id: game_id.to_string(),
            })?;
            if game.host_id.is_some() {
                None
            } else {
                game.host_id = Some(player_id.to_string());
                Some(game.clone())
            }
        };
        match claimed {
            Some(game) => {
                self.publish(game_id, BackendEvent::GameUpdated(game));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self, game_id: &str) -> broadcast::Receiver<BackendEvent> {
        self.events
            .entry(game_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }
}
