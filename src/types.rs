use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Setup,
    Lobby,
    Playing,
    RoundEnd,
    Finished,
}

impl GameStatus {
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        use GameStatus::*;
        matches!(
            (self, next),
            (Setup, Lobby)
                | (Lobby, Playing)
                | (Playing, RoundEnd)
                | (Playing, Finished)
                | (RoundEnd, Playing)
                | (RoundEnd, Finished)
        )
    }
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "SETUP"),
            Self::Lobby => write!(f, "LOBBY"),
            Self::Playing => write!(f, "PLAYING"),
            Self::RoundEnd => write!(f, "ROUND_END"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    LetterRace,
    PictureGame,
}

/// A game session as stored by the backend. `id` doubles as the join code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    pub code: String,
    pub status: GameStatus,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub current_round: u32,
    #[serde(default)]
    pub max_rounds: u32,
    pub game_type: GameType,
    /// Raw JSON document; decode with [`Game::settings`].
    #[serde(default)]
    pub settings: Option<String>,
    #[serde(default)]
    pub time_remaining: Option<u32>,
    #[serde(default)]
    pub round_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_letters: Option<String>,
    #[serde(default)]
    pub current_drawing: Option<String>,
}

impl Game {
    pub fn new(code: String, game_type: GameType) -> Self {
        let settings = GameSettings::defaults_for(game_type);
        Self {
            id: code.clone(),
            code,
            status: GameStatus::Lobby,
            host_id: None,
            current_round: 0,
            max_rounds: settings.max_rounds(),
            game_type,
            settings: Some(settings.encode()),
            time_remaining: None,
            round_start_time: None,
            current_letters: None,
            current_drawing: None,
        }
    }

    /// Decode the settings document for this game's type.
    ///
    /// A missing or blank document yields the defaults; anything else that
    /// does not parse is an error rather than a silent fallback.
    pub fn settings(&self) -> Result<GameSettings> {
        let raw = match self.settings.as_deref().map(str::trim) {
            None | Some("") => return Ok(GameSettings::defaults_for(self.game_type)),
            Some(raw) => raw,
        };
        let decoded = match self.game_type {
            GameType::LetterRace => serde_json::from_str(raw).map(GameSettings::Letter),
            GameType::PictureGame => serde_json::from_str(raw).map(GameSettings::Picture),
        };
        decoded.map_err(|e| Error::InvalidSettings {
            game_id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn is_host(&self, player_id: &str) -> bool {
        self.host_id.as_deref() == Some(player_id)
    }

    pub fn apply(&mut self, patch: &GamePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(host_id) = &patch.host_id {
            self.host_id = Some(host_id.clone());
        }
        if let Some(round) = patch.current_round {
            self.current_round = round;
        }
        if let Some(max) = patch.max_rounds {
            self.max_rounds = max;
        }
        if let Some(settings) = &patch.settings {
            self.settings = Some(settings.clone());
        }
        if let Some(t) = patch.time_remaining {
            self.time_remaining = Some(t);
        }
        if let Some(start) = patch.round_start_time {
            self.round_start_time = Some(start);
        }
        if let Some(letters) = &patch.current_letters {
            self.current_letters = Some(letters.clone());
        }
        if let Some(drawing) = &patch.current_drawing {
            self.current_drawing = Some(drawing.clone());
        }
    }
}

/// Partial game update. Only set fields are serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<GameStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_letters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_drawing: Option<String>,
}

impl GamePatch {
    pub fn with_settings(mut self, settings: &GameSettings) -> Self {
        self.settings = Some(settings.encode());
        self
    }
}

/// A participant in a game session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub game_id: String,
    pub name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub current_words: Vec<String>,
    #[serde(default)]
    pub is_confirmed: bool,
}

impl Player {
    pub fn new(game_id: &str, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            name: name.to_string(),
            is_host: false,
            score: 0,
            current_words: Vec::new(),
            is_confirmed: false,
        }
    }

    pub fn apply(&mut self, patch: &PlayerPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(is_host) = patch.is_host {
            self.is_host = is_host;
        }
        if let Some(score) = patch.score {
            self.score = score;
        }
        if let Some(words) = &patch.current_words {
            self.current_words = words.clone();
        }
        if let Some(confirmed) = patch.is_confirmed {
            self.is_confirmed = confirmed;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_host: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_words: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_confirmed: Option<bool>,
}

/// Keep the first record for each player id, preserving order.
pub fn dedup_players(players: Vec<Player>) -> Vec<Player> {
    let mut seen = std::collections::HashSet::new();
    players
        .into_iter()
        .filter(|p| seen.insert(p.id.clone()))
        .collect()
}

// ─── Settings ─────────────────────────────────────────────────────

/// Per-game-type settings, keyed by [`GameType`].
#[derive(Debug, Clone, PartialEq)]
pub enum GameSettings {
    Letter(LetterSettings),
    Picture(PictureSettings),
}

impl GameSettings {
    pub fn defaults_for(game_type: GameType) -> Self {
        match game_type {
            GameType::LetterRace => Self::Letter(LetterSettings::default()),
            GameType::PictureGame => Self::Picture(PictureSettings::default()),
        }
    }

    pub fn game_type(&self) -> GameType {
        match self {
            Self::Letter(_) => GameType::LetterRace,
            Self::Picture(_) => GameType::PictureGame,
        }
    }

    pub fn max_rounds(&self) -> u32 {
        match self {
            Self::Letter(s) => s.max_rounds,
            Self::Picture(s) => s.max_rounds,
        }
    }

    pub fn encode(&self) -> String {
        let encoded = match self {
            Self::Letter(s) => serde_json::to_string(s),
            Self::Picture(s) => serde_json::to_string(s),
        };
        // Plain structs of strings and numbers always serialize.
        encoded.unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LetterSettings {
    pub max_rounds: u32,
    pub time_per_round: u32,
    pub min_word_length: usize,
    pub letters_per_round: usize,
}

impl Default for LetterSettings {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            time_per_round: 60,
            min_word_length: 4,
            letters_per_round: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PicturePhase {
    Draw,
    Guess,
    Reveal,
}

impl std::fmt::Display for PicturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draw => write!(f, "DRAW"),
            Self::Guess => write!(f, "GUESS"),
            Self::Reveal => write!(f, "REVEAL"),
        }
    }
}

/// Picture game configuration plus the transient state of the current round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PictureSettings {
    pub max_rounds: u32,
    pub draw_time: u32,
    pub guess_time: u32,
    pub reveal_time: u32,
    pub phase: Option<PicturePhase>,
    pub phase_start_time: Option<DateTime<Utc>>,
    pub drawer_id: Option<String>,
    pub prompt: Option<String>,
    pub drawing: Option<DrawingData>,
    pub guesses: Vec<Guess>,
}

impl Default for PictureSettings {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            draw_time: 60,
            guess_time: 30,
            reveal_time: 10,
            phase: None,
            phase_start_time: None,
            drawer_id: None,
            prompt: None,
            drawing: None,
            guesses: Vec::new(),
        }
    }
}

impl PictureSettings {
    pub fn phase_duration(&self, phase: PicturePhase) -> u32 {
        match phase {
            PicturePhase::Draw => self.draw_time,
            PicturePhase::Guess => self.guess_time,
            PicturePhase::Reveal => self.reveal_time,
        }
    }
}

// ─── Drawings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One poly-line drawn between pointer-down and pointer-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    pub color: String,
    pub width: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawingData {
    pub lines: Vec<Stroke>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guess {
    pub player_id: String,
    pub text: String,
    pub correct: bool,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_decode_to_defaults() {
        let mut game = Game::new("ABCD".into(), GameType::LetterRace);
        game.settings = None;
        assert_eq!(game.settings().unwrap(), GameSettings::Letter(LetterSettings::default()));
    }

    #[test]
    fn malformed_settings_are_an_error() {
        let mut game = Game::new("ABCD".into(), GameType::PictureGame);
        game.settings = Some("{not json".into());
        assert!(matches!(game.settings(), Err(Error::InvalidSettings { .. })));
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let mut game = Game::new("ABCD".into(), GameType::LetterRace);
        game.settings = Some(r#"{"minWordLength":5}"#.into());
        let GameSettings::Letter(s) = game.settings().unwrap() else {
            panic!("expected letter settings");
        };
        assert_eq!(s.min_word_length, 5);
        assert_eq!(s.letters_per_round, 2);
    }

    #[test]
    fn status_transitions() {
        assert!(GameStatus::Lobby.can_transition_to(GameStatus::Playing));
        assert!(GameStatus::RoundEnd.can_transition_to(GameStatus::Finished));
        assert!(!GameStatus::Lobby.can_transition_to(GameStatus::RoundEnd));
        assert!(!GameStatus::Finished.can_transition_to(GameStatus::Playing));
    }

    #[test]
    fn dedup_keeps_first_record() {
        let a = Player::new("G", "a");
        let mut dup = a.clone();
        dup.score = 9;
        let b = Player::new("G", "b");
        let out = dedup_players(vec![a.clone(), b.clone(), dup]);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn game_serializes_camel_case() {
        let game = Game::new("WXYZ".into(), GameType::LetterRace);
        let v = serde_json::to_value(&game).unwrap();
        assert_eq!(v["gameType"], "LETTER_RACE");
        assert_eq!(v["status"], "LOBBY");
        assert_eq!(v["maxRounds"], 3);
    }
}
