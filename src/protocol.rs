//! Relay wire protocol: `{ "type", "gameId", "data" }` envelopes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{DrawingData, Game, Player};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    GameUpdate,
    PlayerUpdate,
    PlayerJoin,
    PlayerLeave,
    RoundStart,
    RoundEnd,
    DrawingUpdate,
    StateRecovery,
    GetState,
    Heartbeat,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        Self::GameUpdate,
        Self::PlayerUpdate,
        Self::PlayerJoin,
        Self::PlayerLeave,
        Self::RoundStart,
        Self::RoundEnd,
        Self::DrawingUpdate,
        Self::StateRecovery,
        Self::GetState,
        Self::Heartbeat,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub game_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: MessageType, game_id: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            kind,
            game_id: game_id.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn empty(kind: MessageType, game_id: impl Into<String>) -> Self {
        Self {
            kind,
            game_id: game_id.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn heartbeat(game_id: impl Into<String>) -> Self {
        Self::empty(MessageType::Heartbeat, game_id)
    }

    /// Decode `data` into the payload type for this message.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of PLAYER_LEAVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeft {
    pub player_id: String,
}

/// Payload of STATE_RECOVERY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecovery {
    pub game: Game,
    pub players: Vec<Player>,
}

/// Payload of ROUND_START and ROUND_END.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundInfo {
    pub round: u32,
    #[serde(default)]
    pub letters: Option<String>,
    #[serde(default)]
    pub drawer_id: Option<String>,
}

/// Payload of DRAWING_UPDATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingUpdate {
    pub player_id: String,
    pub drawing: DrawingData,
}
