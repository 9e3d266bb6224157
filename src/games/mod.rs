//! Rule engines. An engine wraps the latest [`Game`] record, validates moves
//! locally and persists accepted changes through the backend.

pub mod letter;
pub mod picture;
pub mod timer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::backend::GameBackend;
use crate::error::{Error, Result};
use crate::types::{Game, GamePatch, GameSettings, GameStatus, GameType};

pub use letter::{LetterGame, WordOutcome};
pub use picture::{DrawingDebouncer, GuessOutcome, PictureGame};
pub use timer::RoundTimer;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_LEN: usize = 4;
const CODE_ATTEMPTS: usize = 10;

/// Move validation and scoring shared by every game type.
pub trait GameRules {
    type Move;
    type Score;

    fn validate_move(&self, mv: &Self::Move) -> bool;

    /// Pure function of `moves`.
    fn calculate_score(&self, moves: &[Self::Move]) -> Self::Score;
}

fn create_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
        .collect()
}

/// Create a game in the lobby under a fresh 4-character code.
pub async fn new_game(backend: &dyn GameBackend, game_type: GameType) -> Result<Game> {
    for _ in 0..CODE_ATTEMPTS {
        let code = create_code();
        if backend.get_game(&code).await?.is_some() {
            continue;
        }
        let game = backend.create_game(&Game::new(code, game_type)).await?;
        tracing::info!("Game created: {} ({:?})", game.id, game.game_type);
        return Ok(game);
    }
    Err(Error::CodeExhausted)
}

/// Round lifecycle common to both games:
/// `LOBBY → PLAYING → ROUND_END → (PLAYING | FINISHED)`.
pub struct BaseGame {
    game: Game,
    backend: Arc<dyn GameBackend>,
    round_seconds: u32,
}

impl BaseGame {
    pub fn new(game: Game, backend: Arc<dyn GameBackend>, round_seconds: u32) -> Self {
        Self {
            game,
            backend,
            round_seconds,
        }
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn backend(&self) -> &Arc<dyn GameBackend> {
        &self.backend
    }

    /// Adopt a newer copy of the game, e.g. one received over the relay.
    pub fn sync(&mut self, game: Game) {
        if game.id == self.game.id {
            self.game = game;
        }
    }

    pub fn status(&self) -> GameStatus {
        self.game.status
    }

    pub fn is_host(&self, player_id: &str) -> bool {
        self.game.is_host(player_id)
    }

    pub fn is_last_round(&self) -> bool {
        self.game.current_round >= self.game.max_rounds
    }

    fn require_host(&self, player_id: &str, action: &'static str) -> Result<()> {
        if self.is_host(player_id) {
            Ok(())
        } else {
            Err(Error::NotHost(action))
        }
    }

    fn require_transition(&self, to: GameStatus) -> Result<()> {
        if self.game.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.game.status,
                to,
            })
        }
    }

    /// Seconds left in the current round as of `now`.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> u32 {
        if self.game.status != GameStatus::Playing {
            return 0;
        }
        match self.game.round_start_time {
            Some(start) => {
                let elapsed = (now - start).num_seconds().max(0) as u64;
                (self.round_seconds as u64).saturating_sub(elapsed) as u32
            }
            None => self.game.time_remaining.unwrap_or(self.round_seconds),
        }
    }

    /// Countdown for the round in progress, resumed from its start time.
    pub fn round_timer(&self, now: DateTime<Utc>) -> Option<RoundTimer> {
        if self.game.status != GameStatus::Playing {
            return None;
        }
        Some(RoundTimer::start(self.time_remaining(now)))
    }

    /// Persist `patch` and adopt the backend's copy of the game.
    pub async fn apply(&mut self, patch: &GamePatch) -> Result<&Game> {
        self.game = self.backend.update_game(&self.game.id, patch).await?;
        Ok(&self.game)
    }

    /// Host starts the first round from the lobby or the next one after a
    /// round ended. `extra` carries the game-type specific round setup.
    pub async fn begin_round(&mut self, actor: &str, extra: GamePatch, now: DateTime<Utc>) -> Result<&Game> {
        self.require_host(actor, "start a round")?;
        self.require_transition(GameStatus::Playing)?;
        if self.game.status == GameStatus::RoundEnd && self.is_last_round() {
            return Err(Error::InvalidTransition {
                from: self.game.status,
                to: GameStatus::Playing,
            });
        }

        let round = self.game.current_round + 1;
        let patch = GamePatch {
            status: Some(GameStatus::Playing),
            current_round: Some(round),
            round_start_time: Some(now),
            time_remaining: Some(self.round_seconds),
            ..extra
        };
        tracing::info!("Game {} starting round {}/{}", self.game.id, round, self.game.max_rounds);
        self.apply(&patch).await
    }

    /// End the current round. Allowed for the host, or for anyone once the
    /// round timer has run out. The last round finishes the game.
    pub async fn end_round(&mut self, actor: &str, extra: GamePatch, now: DateTime<Utc>) -> Result<&Game> {
        if !self.is_host(actor) && self.time_remaining(now) > 0 {
            return Err(Error::NotHost("end a round before time is up"));
        }
        self.close_round(extra).await
    }

    /// Close the round without checking who asked.
    pub(super) async fn close_round(&mut self, extra: GamePatch) -> Result<&Game> {
        let next = if self.is_last_round() {
            GameStatus::Finished
        } else {
            GameStatus::RoundEnd
        };
        self.require_transition(next)?;

        let patch = GamePatch {
            status: Some(next),
            time_remaining: Some(0),
            ..extra
        };
        tracing::info!("Game {} round {} ended -> {}", self.game.id, self.game.current_round, next);
        self.apply(&patch).await
    }

    /// Host ends the game early.
    pub async fn finish(&mut self, actor: &str) -> Result<&Game> {
        self.require_host(actor, "finish the game")?;
        self.require_transition(GameStatus::Finished)?;
        let patch = GamePatch {
            status: Some(GameStatus::Finished),
            time_remaining: Some(0),
            ..Default::default()
        };
        self.apply(&patch).await
    }

    /// Host replaces the settings while the game is still in the lobby.
    pub async fn update_settings(&mut self, actor: &str, settings: &GameSettings) -> Result<&Game> {
        self.require_host(actor, "change settings")?;
        if !matches!(self.game.status, GameStatus::Setup | GameStatus::Lobby) {
            return Err(Error::InvalidMove("settings are locked once the game starts".into()));
        }
        if settings.game_type() != self.game.game_type {
            return Err(Error::InvalidSettings {
                game_id: self.game.id.clone(),
                reason: format!("expected {:?} settings", self.game.game_type),
            });
        }
        let patch = GamePatch {
            max_rounds: Some(settings.max_rounds()),
            ..Default::default()
        }
        .with_settings(settings);
        self.apply(&patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::LetterSettings;

    async fn hosted_game(backend: &Arc<MemoryBackend>) -> Game {
        let game = new_game(backend.as_ref(), GameType::LetterRace).await.unwrap();
        backend.claim_host(&game.id, "host").await.unwrap();
        backend.get_game(&game.id).await.unwrap().unwrap()
    }

    #[test]
    fn codes_use_the_alphabet() {
        for _ in 0..50 {
            let code = create_code();
            assert_eq!(code.len(), 4);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let backend = Arc::new(MemoryBackend::new());
        let game = hosted_game(&backend).await;
        let mut base = BaseGame::new(game, backend.clone(), 60);
        let now = Utc::now();

        assert!(matches!(
            base.end_round("host", GamePatch::default(), now).await,
            Err(Error::InvalidTransition { .. })
        ));

        for round in 1..=3 {
            base.begin_round("host", GamePatch::default(), now).await.unwrap();
            assert_eq!(base.status(), GameStatus::Playing);
            assert_eq!(base.game().current_round, round);
            base.end_round("host", GamePatch::default(), now).await.unwrap();
        }
        assert_eq!(base.status(), GameStatus::Finished);
        assert!(base.begin_round("host", GamePatch::default(), now).await.is_err());
    }

    #[tokio::test]
    async fn only_host_starts_rounds() {
        let backend = Arc::new(MemoryBackend::new());
        let game = hosted_game(&backend).await;
        let mut base = BaseGame::new(game, backend, 60);
        let res = base.begin_round("guest", GamePatch::default(), Utc::now()).await;
        assert!(matches!(res, Err(Error::NotHost(_))));
    }

    #[tokio::test]
    async fn anyone_ends_an_expired_round() {
        let backend = Arc::new(MemoryBackend::new());
        let game = hosted_game(&backend).await;
        let mut base = BaseGame::new(game, backend, 60);
        let start = Utc::now();
        base.begin_round("host", GamePatch::default(), start).await.unwrap();

        let early = start + chrono::Duration::seconds(10);
        assert_eq!(base.time_remaining(early), 50);
        assert!(base.end_round("guest", GamePatch::default(), early).await.is_err());

        let late = start + chrono::Duration::seconds(61);
        assert_eq!(base.time_remaining(late), 0);
        base.end_round("guest", GamePatch::default(), late).await.unwrap();
        assert_eq!(base.status(), GameStatus::RoundEnd);
        assert!(base.round_timer(late).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn round_timer_resumes_mid_round() {
        let backend = Arc::new(MemoryBackend::new());
        let game = hosted_game(&backend).await;
        let mut base = BaseGame::new(game, backend, 60);
        let start = Utc::now();
        base.begin_round("host", GamePatch::default(), start).await.unwrap();

        let mut timer = base.round_timer(start + chrono::Duration::seconds(57)).unwrap();
        assert_eq!(timer.remaining(), 3);
        timer.expired().await;
        assert_eq!(timer.remaining(), 0);
    }

    #[tokio::test]
    async fn settings_locked_after_start() {
        let backend = Arc::new(MemoryBackend::new());
        let game = hosted_game(&backend).await;
        let mut base = BaseGame::new(game, backend, 60);
        let settings = GameSettings::Letter(LetterSettings {
            max_rounds: 5,
            ..Default::default()
        });
        base.update_settings("host", &settings).await.unwrap();
        assert_eq!(base.game().max_rounds, 5);
        assert_eq!(base.game().settings().unwrap(), settings);

        base.begin_round("host", GamePatch::default(), Utc::now()).await.unwrap();
        assert!(base.update_settings("host", &settings).await.is_err());
    }
}
