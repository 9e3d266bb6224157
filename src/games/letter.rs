use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;

use super::{BaseGame, GameRules};
use crate::backend::GameBackend;
use crate::dictionary::WordValidator;
use crate::error::{Error, Result};
use crate::types::{Game, GamePatch, GameSettings, GameStatus, LetterSettings, Player, PlayerPatch};

/// Letters that show up often enough in English words to be fair.
const LETTER_POOL: &[u8] = b"ABCDEFGHILMNOPRSTUW";

/// Result of a word submission.
#[derive(Debug, Clone, PartialEq)]
pub enum WordOutcome {
    Accepted { word: String, points: u32, player: Player },
    Duplicate,
    TooShort,
    MissingLetters,
    NotInDictionary,
    RoundClosed,
}

/// Whether `letters` appear in `word` in order, ignoring case, and the word
/// is at least `min_len` long.
pub fn matches_letters(word: &str, letters: &str, min_len: usize) -> bool {
    if word.chars().count() < min_len {
        return false;
    }
    let mut chars = word.chars().map(|c| c.to_ascii_uppercase());
    letters
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .all(|wanted| chars.any(|c| c == wanted))
}

pub fn score_word(word: &str) -> u32 {
    let len = word.chars().count();
    let mut points = 1;
    if len >= 6 {
        points += 2;
    }
    if len >= 8 {
        points += 2;
    }
    points
}

/// `count` distinct letters from the pool.
pub fn random_letters(count: usize) -> String {
    let mut rng = rand::rng();
    LETTER_POOL
        .choose_multiple(&mut rng, count)
        .map(|&b| char::from(b))
        .collect()
}

pub struct LetterGame {
    base: BaseGame,
    settings: LetterSettings,
}

impl LetterGame {
    pub fn new(game: Game, backend: Arc<dyn GameBackend>) -> Result<Self> {
        let settings = letter_settings(&game)?;
        let base = BaseGame::new(game, backend, settings.time_per_round);
        Ok(Self { base, settings })
    }

    pub fn base(&self) -> &BaseGame {
        &self.base
    }

    pub fn game(&self) -> &Game {
        self.base.game()
    }

    pub fn settings(&self) -> &LetterSettings {
        &self.settings
    }

    /// Letters of the current round, empty before the first round.
    pub fn letters(&self) -> &str {
        self.game().current_letters.as_deref().unwrap_or("")
    }

    pub fn sync(&mut self, game: Game) -> Result<()> {
        let settings = letter_settings(&game)?;
        self.base.sync(game);
        self.settings = settings;
        Ok(())
    }

    pub async fn start_round(&mut self, actor: &str, now: DateTime<Utc>) -> Result<&Game> {
        let letters = random_letters(self.settings.letters_per_round);
        self.start_round_with(actor, &letters, now).await
    }

    /// Start a round with fixed letters and clear everyone's word list.
    pub async fn start_round_with(&mut self, actor: &str, letters: &str, now: DateTime<Utc>) -> Result<&Game> {
        let patch = GamePatch {
            current_letters: Some(letters.to_ascii_uppercase()),
            ..Default::default()
        };
        self.base.begin_round(actor, patch, now).await?;

        let backend = self.base.backend().clone();
        let players = backend.players_by_game_id(&self.game().id).await?;
        let reset = PlayerPatch {
            current_words: Some(Vec::new()),
            ..Default::default()
        };
        for player in players.iter().filter(|p| !p.current_words.is_empty()) {
            backend.update_player(&player.id, &reset).await?;
        }
        Ok(self.base.game())
    }

    pub async fn end_round(&mut self, actor: &str, now: DateTime<Utc>) -> Result<&Game> {
        self.base.end_round(actor, GamePatch::default(), now).await
    }

    pub async fn update_settings(&mut self, actor: &str, settings: LetterSettings) -> Result<&Game> {
        self.base
            .update_settings(actor, &GameSettings::Letter(settings.clone()))
            .await?;
        self.settings = settings;
        Ok(self.base.game())
    }

    /// Check a word locally, then against the dictionary, then record it and
    /// add its points to the player's score.
    pub async fn submit_word(
        &mut self,
        player_id: &str,
        word: &str,
        validator: &dyn WordValidator,
    ) -> Result<WordOutcome> {
        if self.base.status() != GameStatus::Playing {
            return Ok(WordOutcome::RoundClosed);
        }
        let word = word.trim().to_ascii_uppercase();
        let backend = self.base.backend().clone();
        let player = backend
            .get_player(player_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "player",
                id: player_id.to_string(),
            })?;
        if player.game_id != self.game().id {
            return Err(Error::InvalidMove(format!("player {player_id} is not in this game")));
        }

        if player.current_words.iter().any(|w| w.eq_ignore_ascii_case(&word)) {
            return Ok(WordOutcome::Duplicate);
        }
        if word.chars().count() < self.settings.min_word_length {
            return Ok(WordOutcome::TooShort);
        }
        if !self.validate_move(&word) {
            return Ok(WordOutcome::MissingLetters);
        }

        let verdict = validator.validate(std::slice::from_ref(&word)).await?;
        if verdict.first() != Some(&true) {
            tracing::debug!("Word {} rejected by dictionary", word);
            return Ok(WordOutcome::NotInDictionary);
        }

        let points = score_word(&word);
        let mut words = player.current_words.clone();
        words.push(word.clone());
        let patch = PlayerPatch {
            current_words: Some(words),
            score: Some(player.score + points),
            ..Default::default()
        };
        let player = backend.update_player(player_id, &patch).await?;
        tracing::info!("Player {} scored {} for {}", player.name, points, word);
        Ok(WordOutcome::Accepted { word, points, player })
    }
}

impl GameRules for LetterGame {
    type Move = String;
    type Score = u32;

    fn validate_move(&self, word: &String) -> bool {
        matches_letters(word, self.letters(), self.settings.min_word_length)
    }

    fn calculate_score(&self, words: &[String]) -> u32 {
        words.iter().map(|w| score_word(w)).sum()
    }
}

fn letter_settings(game: &Game) -> Result<LetterSettings> {
    match game.settings()? {
        GameSettings::Letter(settings) => Ok(settings),
        GameSettings::Picture(_) => Err(Error::InvalidSettings {
            game_id: game.id.clone(),
            reason: "not a letter race".into(),
        }),
    }
}
