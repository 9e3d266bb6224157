use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::types::GameStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the crate surfaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("not connected")]
    NotConnected,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings for game {game_id}: {reason}")]
    InvalidSettings { game_id: String, reason: String },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("cannot move game from {from} to {to}")]
    InvalidTransition { from: GameStatus, to: GameStatus },
    #[error("only the host can {0}")]
    NotHost(&'static str),
    #[error("invalid move: {0}")]
    InvalidMove(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("conditional write rejected: {0}")]
    ConditionFailed(String),
    #[error("could not allocate a free game code")]
    CodeExhausted,
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl Error {
    /// Whether the shared retry policy should try the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::WebSocket(_) | Self::NotConnected | Self::Backend(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Json(_) | Self::InvalidMove(_) => StatusCode::BAD_REQUEST,
            Self::Http(_) | Self::Status { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
