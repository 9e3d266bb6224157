//! The relay server: one WebSocket room per game, plus the word-validation
//! proxy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::dictionary::{DictionaryApi, ValidateWordsRequest};
use crate::error::{Error, Result};
use crate::protocol::{Envelope, MessageType, PlayerLeft};

const MAX_WORDS_PER_REQUEST: usize = 100;

/// Messages routed from a room to its sockets.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    SendTo { socket_id: String, msg: Envelope },
    Broadcast { msg: Envelope },
    BroadcastExcept { exclude: String, msg: Envelope },
}

impl RelayEvent {
    fn target(&self, socket_id: &str) -> Option<&Envelope> {
        match self {
            Self::SendTo { socket_id: to, msg } => (to == socket_id).then_some(msg),
            Self::Broadcast { msg } => Some(msg),
            Self::BroadcastExcept { exclude, msg } => (exclude != socket_id).then_some(msg),
        }
    }
}

struct Room {
    event_tx: broadcast::Sender<RelayEvent>,
    sockets: HashSet<String>,
}

/// Rooms of connected sockets keyed by game id.
#[derive(Default)]
pub struct Registry {
    rooms: DashMap<String, Room>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a socket to the game's room, creating the room on first join.
    pub fn join(&self, game_id: &str, socket_id: &str) -> broadcast::Receiver<RelayEvent> {
        let mut room = self.rooms.entry(game_id.to_string()).or_insert_with(|| Room {
            event_tx: broadcast::channel(256).0,
            sockets: HashSet::new(),
        });
        room.sockets.insert(socket_id.to_string());
        room.event_tx.subscribe()
    }

    /// Remove a socket; the room goes away with its last socket.
    pub fn leave(&self, game_id: &str, socket_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(game_id) {
            room.sockets.remove(socket_id);
        }
        if self
            .rooms
            .remove_if(game_id, |_, room| room.sockets.is_empty())
            .is_some()
        {
            tracing::info!("Room {} closed", game_id);
        }
    }

    /// Returns how many sockets the event was offered to.
    pub fn publish(&self, game_id: &str, event: RelayEvent) -> usize {
        match self.rooms.get(game_id) {
            Some(room) => room.event_tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn room_size(&self, game_id: &str) -> usize {
        self.rooms.get(game_id).map(|r| r.sockets.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<Registry>,
    pub api_key: Option<String>,
    pub dictionary: DictionaryApi,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: Registry::new(),
            api_key: config.api_key.clone(),
            dictionary: DictionaryApi::new(config.dictionary_api_url.clone()),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/validate-words", post(validate_words))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Routes ───────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn validate_words(
    State(state): State<RelayState>,
    Json(req): Json<ValidateWordsRequest>,
) -> Result<Json<Vec<bool>>> {
    if req.words.len() > MAX_WORDS_PER_REQUEST {
        return Err(Error::InvalidMove(format!(
            "at most {MAX_WORDS_PER_REQUEST} words per request"
        )));
    }
    Ok(Json(state.dictionary.validate_all(&req.words).await))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(expected) = &state.api_key {
        if params.get("apiKey") != Some(expected) {
            tracing::warn!("Rejected relay socket with a bad API key");
            return (StatusCode::UNAUTHORIZED, "Invalid API key").into_response();
        }
    }
    let Some(game_id) = params.get("gameId").filter(|g| !g.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "Missing gameId").into_response();
    };
    let player_id = params.get("playerId").filter(|p| !p.is_empty()).cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry, game_id, player_id))
}

async fn handle_socket(socket: WebSocket, registry: Arc<Registry>, game_id: String, player_id: Option<String>) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let socket_id = uuid::Uuid::new_v4().to_string();
    let mut event_rx = registry.join(&game_id, &socket_id);
    tracing::info!(
        "WebSocket connected: {} game: {} player: {:?} ({} in room)",
        socket_id,
        game_id,
        player_id,
        registry.room_size(&game_id)
    );

    let sender_clone = sender.clone();
    let socket_id_clone = socket_id.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let Some(msg) = event.target(&socket_id_clone) else { continue };
                    if !send_msg(&sender_clone, msg).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Socket {} lagged by {} messages", socket_id_clone, missed);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message from {}: {}", socket_id, e);
                continue;
            }
        };

        if envelope.kind == MessageType::Heartbeat {
            registry.publish(
                &game_id,
                RelayEvent::SendTo {
                    socket_id: socket_id.clone(),
                    msg: Envelope::heartbeat(game_id.as_str()),
                },
            );
            continue;
        }

        tracing::debug!("{:?} from {} in game {}", envelope.kind, socket_id, game_id);
        registry.publish(
            &game_id,
            RelayEvent::BroadcastExcept {
                exclude: socket_id.clone(),
                msg: envelope,
            },
        );
    }

    tracing::info!("WebSocket disconnected: {}", socket_id);
    event_task.abort();
    registry.leave(&game_id, &socket_id);

    if let Some(player_id) = player_id {
        let msg = Envelope::new(MessageType::PlayerLeave, game_id.as_str(), PlayerLeft { player_id });
        registry.publish(&game_id, RelayEvent::Broadcast { msg });
    }
}

async fn send_msg(sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>, msg: &Envelope) -> bool {
    match msg.to_json() {
        Ok(json) => {
            let mut s = sender.lock().await;
            s.send(Message::Text(json.into())).await.is_ok()
        }
        Err(e) => {
            tracing::error!("Cannot encode {:?}: {}", msg.kind, e);
            true
        }
    }
}
