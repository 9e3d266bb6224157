//! The managed data API behind every session: queries, mutations and
//! per-game change subscriptions.

mod graphql;
mod memory;

pub use graphql::GraphQlBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{Game, GamePatch, Player, PlayerPatch};

/// A change pushed by the backend's subscriptions for one game.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    GameUpdated(Game),
    PlayerCreated(Player),
    PlayerUpdated(Player),
}

#[async_trait]
pub trait GameBackend: Send + Sync {
    async fn get_game(&self, id: &str) -> Result<Option<Game>>;

    async fn get_player(&self, id: &str) -> Result<Option<Player>>;

    /// Players of a game in the backend's own order.
    async fn players_by_game_id(&self, game_id: &str) -> Result<Vec<Player>>;

    async fn create_game(&self, game: &Game) -> Result<Game>;

    async fn create_player(&self, player: &Player) -> Result<Player>;

    async fn update_game(&self, id: &str, patch: &GamePatch) -> Result<Game>;

    async fn update_player(&self, id: &str, patch: &PlayerPatch) -> Result<Player>;

    /// Set `hostId` only if the game has none yet. Returns whether this call won.
    async fn claim_host(&self, game_id: &str, player_id: &str) -> Result<bool>;

    /// Changes to the game and its players.
    fn subscribe(&self, game_id: &str) -> broadcast::Receiver<BackendEvent>;
}
