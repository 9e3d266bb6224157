use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use tokio::sync::mpsc;

use super::{BaseGame, GameRules, RoundTimer};
use crate::backend::GameBackend;
use crate::error::{Error, Result};
use crate::types::{
    DrawingData, Game, GamePatch, GameSettings, GameStatus, Guess, PicturePhase, PictureSettings, Player,
    PlayerPatch, Stroke,
};

const FIRST_CORRECT_POINTS: u32 = 3;
const LATER_CORRECT_POINTS: u32 = 1;

pub const PROMPTS: &[&str] = &[
    "cat", "house", "tree", "car", "sun", "boat", "flower", "guitar", "pizza", "rocket", "bicycle", "umbrella",
    "elephant", "castle", "snowman", "lighthouse", "dragon", "banana", "octopus", "volcano",
];

#[derive(Debug, Clone, PartialEq)]
pub enum GuessOutcome {
    Correct { points: u32, player: Player },
    Wrong,
    /// The player already found the prompt this round.
    AlreadyGuessed,
}

/// The player drawing in `round` (1-based), rotating through `players`.
pub fn drawer_for_round(players: &[Player], round: u32) -> Option<&Player> {
    if players.is_empty() {
        return None;
    }
    let index = (round.max(1) - 1) as usize % players.len();
    players.get(index)
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub struct PictureGame {
    base: BaseGame,
    settings: PictureSettings,
}

impl PictureGame {
    pub fn new(game: Game, backend: Arc<dyn GameBackend>) -> Result<Self> {
        let settings = picture_settings(&game)?;
        let round_seconds = settings.draw_time + settings.guess_time + settings.reveal_time;
        let base = BaseGame::new(game, backend, round_seconds);
        Ok(Self { base, settings })
    }

    pub fn base(&self) -> &BaseGame {
        &self.base
    }

    pub fn game(&self) -> &Game {
        self.base.game()
    }

    pub fn settings(&self) -> &PictureSettings {
        &self.settings
    }

    pub fn phase(&self) -> Option<PicturePhase> {
        self.settings.phase
    }

    pub fn is_drawer(&self, player_id: &str) -> bool {
        self.settings.drawer_id.as_deref() == Some(player_id)
    }

    pub fn sync(&mut self, game: Game) -> Result<()> {
        let settings = picture_settings(&game)?;
        self.base.sync(game);
        self.settings = settings;
        Ok(())
    }

    /// Adopt the stored game so moves made through other clients' engines
    /// are seen before this one decides anything.
    async fn reload(&mut self) -> Result<()> {
        let id = self.game().id.clone();
        let game = self
            .base
            .backend()
            .get_game(&id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "game",
                id: id.clone(),
            })?;
        self.sync(game)
    }

    /// Seconds left in the current phase.
    pub fn phase_remaining(&self, now: DateTime<Utc>) -> u32 {
        let (Some(phase), Some(start)) = (self.settings.phase, self.settings.phase_start_time) else {
            return 0;
        };
        let elapsed = (now - start).num_seconds().max(0) as u64;
        (self.settings.phase_duration(phase) as u64).saturating_sub(elapsed) as u32
    }

    pub fn phase_timer(&self, now: DateTime<Utc>) -> Option<RoundTimer> {
        self.settings.phase.map(|_| RoundTimer::start(self.phase_remaining(now)))
    }

    pub async fn start_round(&mut self, actor: &str, now: DateTime<Utc>) -> Result<&Game> {
        let prompt = {
            let mut rng = rand::rng();
            PROMPTS.choose(&mut rng).copied().unwrap_or("cat")
        };
        self.start_round_with_prompt(actor, prompt, now).await
    }

    /// Pick the drawer for the next round and open the drawing phase.
    pub async fn start_round_with_prompt(&mut self, actor: &str, prompt: &str, now: DateTime<Utc>) -> Result<&Game> {
        let backend = self.base.backend().clone();
        let players = backend.players_by_game_id(&self.game().id).await?;
        let round = self.game().current_round + 1;
        let drawer = drawer_for_round(&players, round)
            .ok_or_else(|| Error::InvalidMove("cannot start a round without players".into()))?;

        let settings = PictureSettings {
            phase: Some(PicturePhase::Draw),
            phase_start_time: Some(now),
            drawer_id: Some(drawer.id.clone()),
            prompt: Some(prompt.to_string()),
            drawing: None,
            guesses: Vec::new(),
            ..self.settings.clone()
        };
        let patch = GamePatch {
            current_drawing: Some(String::new()),
            ..Default::default()
        }
        .with_settings(&GameSettings::Picture(settings.clone()));

        self.base.begin_round(actor, patch, now).await?;
        tracing::info!("Game {} round {}: {} draws", self.game().id, round, drawer.name);
        self.settings = settings;
        Ok(self.base.game())
    }

    fn require_phase(&self, phase: PicturePhase) -> Result<()> {
        if self.base.status() == GameStatus::Playing && self.settings.phase == Some(phase) {
            Ok(())
        } else {
            Err(Error::InvalidMove(format!(
                "expected {phase} phase, game is {} in {:?}",
                self.base.status(),
                self.settings.phase
            )))
        }
    }

    async fn persist(&mut self, settings: PictureSettings, extra: GamePatch) -> Result<&Game> {
        let patch = extra.with_settings(&GameSettings::Picture(settings.clone()));
        self.base.apply(&patch).await?;
        self.settings = settings;
        Ok(self.base.game())
    }

    pub async fn submit_drawing(&mut self, player_id: &str, drawing: DrawingData) -> Result<&Game> {
        self.reload().await?;
        self.require_phase(PicturePhase::Draw)?;
        if !self.is_drawer(player_id) {
            return Err(Error::InvalidMove("only the drawer can draw".into()));
        }
        let extra = GamePatch {
            current_drawing: Some(serde_json::to_string(&drawing)?),
            ..Default::default()
        };
        let settings = PictureSettings {
            drawing: Some(drawing),
            ..self.settings.clone()
        };
        self.persist(settings, extra).await
    }

    /// DRAW → GUESS → REVEAL, then the reveal ends the round. The host may
    /// advance at any time; anyone may once the phase timer ran out.
    pub async fn advance_phase(&mut self, actor: &str, now: DateTime<Utc>) -> Result<&Game> {
        self.reload().await?;
        if self.base.status() != GameStatus::Playing {
            return Err(Error::InvalidMove("no round in progress".into()));
        }
        if !self.base.is_host(actor) && self.phase_remaining(now) > 0 {
            return Err(Error::NotHost("advance the phase before time is up"));
        }

        let next = match self.settings.phase {
            Some(PicturePhase::Draw) => PicturePhase::Guess,
            Some(PicturePhase::Guess) => PicturePhase::Reveal,
            Some(PicturePhase::Reveal) | None => {
                let settings = PictureSettings {
                    phase: None,
                    phase_start_time: None,
                    ..self.settings.clone()
                };
                let patch = GamePatch::default().with_settings(&GameSettings::Picture(settings.clone()));
                self.base.close_round(patch).await?;
                self.settings = settings;
                return Ok(self.base.game());
            }
        };

        tracing::debug!("Game {} entering {} phase", self.game().id, next);
        let settings = PictureSettings {
            phase: Some(next),
            phase_start_time: Some(now),
            ..self.settings.clone()
        };
        self.persist(settings, GamePatch::default()).await
    }

    /// Record a guess during the guessing phase and award points for a
    /// correct one. Earlier guesses are read from the stored game, not from
    /// this engine's copy.
    pub async fn submit_guess(&mut self, player_id: &str, text: &str, now: DateTime<Utc>) -> Result<GuessOutcome> {
        self.reload().await?;
        self.require_phase(PicturePhase::Guess)?;
        if self.is_drawer(player_id) {
            return Err(Error::InvalidMove("the drawer cannot guess".into()));
        }
        if self
            .settings
            .guesses
            .iter()
            .any(|g| g.correct && g.player_id == player_id)
        {
            return Ok(GuessOutcome::AlreadyGuessed);
        }

        let prompt = self.settings.prompt.as_deref().map(normalize).unwrap_or_default();
        let correct = !prompt.is_empty() && normalize(text) == prompt;
        let points = match (correct, self.settings.guesses.iter().any(|g| g.correct)) {
            (false, _) => 0,
            (true, false) => FIRST_CORRECT_POINTS,
            (true, true) => LATER_CORRECT_POINTS,
        };

        let mut settings = self.settings.clone();
        settings.guesses.push(Guess {
            player_id: player_id.to_string(),
            text: text.trim().to_string(),
            correct,
            at: now,
        });
        self.persist(settings, GamePatch::default()).await?;

        if !correct {
            return Ok(GuessOutcome::Wrong);
        }
        let backend = self.base.backend().clone();
        let player = backend
            .get_player(player_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "player",
                id: player_id.to_string(),
            })?;
        let patch = PlayerPatch {
            score: Some(player.score + points),
            ..Default::default()
        };
        let player = backend.update_player(player_id, &patch).await?;
        tracing::info!("Player {} guessed the prompt for {} points", player.name, points);
        Ok(GuessOutcome::Correct { points, player })
    }
}

impl GameRules for PictureGame {
    type Move = Guess;
    type Score = BTreeMap<String, u32>;

    fn validate_move(&self, guess: &Guess) -> bool {
        !self.is_drawer(&guess.player_id) && !guess.text.trim().is_empty()
    }

    /// Points per guessing player. Only a player's first correct guess
    /// counts; the drawer never scores.
    fn calculate_score(&self, guesses: &[Guess]) -> BTreeMap<String, u32> {
        let mut scores = BTreeMap::new();
        let mut found = 0;
        for guess in guesses.iter().filter(|g| !self.is_drawer(&g.player_id)) {
            let score = scores.entry(guess.player_id.clone()).or_insert(0);
            if !guess.correct || *score > 0 {
                continue;
            }
            *score = if found == 0 {
                FIRST_CORRECT_POINTS
            } else {
                LATER_CORRECT_POINTS
            };
            found += 1;
        }
        scores
    }
}

fn picture_settings(game: &Game) -> Result<PictureSettings> {
    match game.settings()? {
        GameSettings::Picture(settings) => Ok(settings),
        GameSettings::Letter(_) => Err(Error::InvalidSettings {
            game_id: game.id.clone(),
            reason: "not a picture game".into(),
        }),
    }
}

/// Coalesces strokes pushed on pointer-up into one drawing update per quiet
/// period. The task ends once the debouncer is dropped and any pending
/// drawing has been flushed.
pub struct DrawingDebouncer {
    strokes: mpsc::UnboundedSender<Stroke>,
}

impl DrawingDebouncer {
    pub fn spawn(initial: DrawingData, quiet: Duration, out: mpsc::UnboundedSender<DrawingData>) -> Self {
        let (strokes, mut rx) = mpsc::unbounded_channel::<Stroke>();
        tokio::spawn(async move {
            let mut drawing = initial;
            while let Some(stroke) = rx.recv().await {
                drawing.lines.push(stroke);
                loop {
                    match tokio::time::timeout(quiet, rx.recv()).await {
                        Ok(Some(stroke)) => drawing.lines.push(stroke),
                        Ok(None) => {
                            let _ = out.send(drawing);
                            return;
                        }
                        Err(_) => break,
                    }
                }
                if out.send(drawing.clone()).is_err() {
                    return;
                }
            }
        });
        Self { strokes }
    }

    pub fn push(&self, stroke: Stroke) {
        let _ = self.strokes.send(stroke);
    }
}
