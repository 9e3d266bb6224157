//! Keeps a local picture of one game in sync with the backend and the relay.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{BackendEvent, GameBackend, GraphQlBackend, MemoryBackend};
use crate::config::{config_path, ClientConfig};
use crate::dictionary::DictionaryClient;
use crate::error::{Error, Result};
use crate::protocol::{DrawingUpdate, Envelope, MessageType, PlayerLeft, RoundInfo, StateRecovery};
use crate::storage::{FileStore, PlayerStore};
use crate::types::{dedup_players, DrawingData, Game, GamePatch, GameSettings, GameStatus, Player, PlayerPatch};
use crate::ws::{ConnectionManager, ConnectionState, ListenerId, WebSocketService};

const INIT_ERROR: &str = "Failed to initialize game session";
const CONNECT_ERROR: &str = "Lost connection to the game server";

/// Everything sessions share within one client: backend, player store,
/// relay connections and the games this client already joined.
pub struct SessionContext {
    pub backend: Arc<dyn GameBackend>,
    pub store: Arc<dyn PlayerStore>,
    pub connections: Arc<ConnectionManager>,
    initialized: DashMap<String, String>,
    dictionary: Arc<DictionaryClient>,
    config: ClientConfig,
}

impl SessionContext {
    pub fn new(config: ClientConfig, backend: Arc<dyn GameBackend>, store: Arc<dyn PlayerStore>) -> Arc<Self> {
        let dictionary = Arc::new(DictionaryClient::new(
            config.validate_words_url.clone(),
            config.word_cache_max,
            config.request_policy(),
        ));
        Arc::new(Self {
            backend,
            store,
            connections: Arc::new(ConnectionManager::new(config.clone())),
            initialized: DashMap::new(),
            dictionary,
            config,
        })
    }

    /// GraphQL backend when an endpoint is configured, in-memory otherwise;
    /// player ids persisted to the configured storage file.
    pub fn from_config(config: ClientConfig) -> Arc<Self> {
        let backend: Arc<dyn GameBackend> = match &config.graphql_url {
            Some(url) => Arc::new(GraphQlBackend::new(
                url.clone(),
                config.api_key.clone(),
                config.request_policy(),
            )),
            None => {
                tracing::warn!("No GraphQL endpoint configured, using the in-memory backend");
                Arc::new(MemoryBackend::new())
            }
        };
        let store = Arc::new(FileStore::open(config_path(&config.storage_file)));
        Self::new(config, backend, store)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Word validation through the relay's proxy. Every caller shares one
    /// verdict cache.
    pub fn dictionary(&self) -> Arc<DictionaryClient> {
        self.dictionary.clone()
    }

    /// Player id this context already resolved for `game_id`.
    pub fn initialized_player(&self, game_id: &str) -> Option<String> {
        self.initialized.get(game_id).map(|e| e.value().clone())
    }
}

/// What a UI renders for one game.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub game: Option<Game>,
    pub players: Vec<Player>,
    pub player: Option<Player>,
    pub connection: ConnectionState,
    pub error: Option<String>,
    pub loading: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            game: None,
            players: Vec::new(),
            player: None,
            connection: ConnectionState::Disconnected,
            error: None,
            loading: true,
        }
    }
}

impl SessionState {
    pub fn is_host(&self) -> bool {
        match (&self.game, &self.player) {
            (Some(game), Some(player)) => game.is_host(&player.id),
            _ => false,
        }
    }

    /// Shallow-merge a GAME_UPDATE payload into the local game.
    pub fn merge_game(&mut self, data: &Value) -> Result<()> {
        let Some(game) = &self.game else { return Ok(()) };
        let Value::Object(changes) = data else {
            return Err(Error::InvalidMove(format!("game update is not an object: {data}")));
        };
        let mut merged = serde_json::to_value(game)?;
        if let Value::Object(fields) = &mut merged {
            for (key, value) in changes {
                fields.insert(key.clone(), value.clone());
            }
        }
        self.game = Some(serde_json::from_value(merged)?);
        Ok(())
    }

    /// Replace the player with the same id, or append it.
    pub fn upsert_player(&mut self, player: Player) {
        if self.player.as_ref().is_some_and(|p| p.id == player.id) {
            self.player = Some(player.clone());
        }
        match self.players.iter_mut().find(|p| p.id == player.id) {
            Some(existing) => *existing = player,
            None => self.players.push(player),
        }
    }

    /// Append unless a player with the same id is already listed.
    pub fn add_player(&mut self, player: Player) -> bool {
        if self.players.iter().any(|p| p.id == player.id) {
            return false;
        }
        self.players.push(player);
        true
    }

    /// Move the local game into a round announced by ROUND_START unless a
    /// GAME_UPDATE already did.
    pub fn enter_round(&mut self, info: &RoundInfo) {
        let Some(game) = &mut self.game else { return };
        if game.current_round >= info.round && game.status == GameStatus::Playing {
            return;
        }
        game.status = GameStatus::Playing;
        game.current_round = info.round;
        if info.letters.is_some() {
            game.current_letters = info.letters.clone();
        }
    }

    /// Adopt an authoritative snapshot.
    pub fn recover(&mut self, game: Game, players: Vec<Player>) {
        let players = dedup_players(players);
        if let Some(me) = &self.player {
            if let Some(fresh) = players.iter().find(|p| p.id == me.id) {
                self.player = Some(fresh.clone());
            }
        }
        self.game = Some(game);
        self.players = players;
    }
}

struct Shared {
    ctx: Arc<SessionContext>,
    game_id: String,
    state: watch::Sender<SessionState>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(f);
    }

    fn player_id(&self) -> Option<String> {
        self.state.borrow().player.as_ref().map(|p| p.id.clone())
    }

    fn send(&self, envelope: Envelope) -> bool {
        let Some(player_id) = self.player_id() else { return false };
        match self.ctx.connections.connection(&self.game_id, Some(&player_id)) {
            Some(service) => service.send(envelope),
            None => false,
        }
    }

    async fn fetch(&self) -> Result<(Game, Vec<Player>)> {
        let game = self
            .ctx
            .backend
            .get_game(&self.game_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "game",
                id: self.game_id.clone(),
            })?;
        let players = dedup_players(self.ctx.backend.players_by_game_id(&self.game_id).await?);
        Ok((game, players))
    }

    /// Refetch the game and players and apply them as a recovery.
    async fn refresh(&self) -> Result<()> {
        let (game, players) = self.fetch().await?;
        self.update(|s| s.recover(game, players));
        Ok(())
    }

    /// Join the relay, retrying with the session's linear backoff.
    async fn connect(&self, player_id: &str) -> Result<Arc<WebSocketService>> {
        let policy = self.ctx.config.session_connect_policy();
        let connections = &self.ctx.connections;
        let game_id = &self.game_id;
        policy
            .run_if(
                "join relay",
                move || connections.get_or_create(game_id, Some(player_id)),
                |_| true,
            )
            .await
    }

    fn apply_backend(&self, event: BackendEvent) {
        match event {
            BackendEvent::GameUpdated(game) => self.update(|s| s.game = Some(game)),
            BackendEvent::PlayerCreated(player) => self.update(|s| {
                s.add_player(player);
            }),
            BackendEvent::PlayerUpdated(player) => self.update(|s| s.upsert_player(player)),
        }
    }

    async fn handle(&self, envelope: Envelope) {
        if envelope.game_id != self.game_id {
            return;
        }
        if let Err(e) = self.reconcile(&envelope).await {
            tracing::warn!("Ignoring {:?} for game {}: {}", envelope.kind, self.game_id, e);
        }
    }

    async fn reconcile(&self, envelope: &Envelope) -> Result<()> {
        match envelope.kind {
            MessageType::GameUpdate => {
                let mut res = Ok(());
                self.update(|s| res = s.merge_game(&envelope.data));
                res?;
            }
            MessageType::PlayerUpdate => {
                let updated: Player = envelope.payload()?;
                match self.ctx.backend.players_by_game_id(&self.game_id).await {
                    Ok(players) => self.update(|s| {
                        s.players = dedup_players(players);
                        s.upsert_player(updated);
                    }),
                    Err(e) => {
                        tracing::warn!("Player refetch for game {} failed: {}", self.game_id, e);
                        self.update(|s| s.upsert_player(updated));
                    }
                }
            }
            MessageType::PlayerJoin => {
                let player: Player = envelope.payload()?;
                tracing::info!("Player {} joined game {}", player.name, self.game_id);
                self.update(|s| {
                    s.add_player(player);
                });
            }
            MessageType::PlayerLeave => {
                let left: PlayerLeft = envelope.payload()?;
                tracing::info!("Player {} left game {}", left.player_id, self.game_id);
            }
            MessageType::StateRecovery => {
                let recovery: StateRecovery = envelope.payload()?;
                self.update(|s| s.recover(recovery.game, recovery.players));
            }
            MessageType::GetState => {
                let snapshot = {
                    let state = self.state.borrow();
                    match &state.game {
                        Some(game) if state.is_host() => Some(StateRecovery {
                            game: game.clone(),
                            players: state.players.clone(),
                        }),
                        _ => None,
                    }
                };
                if let Some(snapshot) = snapshot {
                    self.send(Envelope::new(MessageType::StateRecovery, self.game_id.as_str(), &snapshot));
                }
            }
            MessageType::DrawingUpdate => {
                let update: DrawingUpdate = envelope.payload()?;
                let drawing = serde_json::to_string(&update.drawing)?;
                self.update(|s| {
                    if let Some(game) = &mut s.game {
                        game.current_drawing = Some(drawing);
                    }
                });
            }
            MessageType::RoundStart => {
                let info: RoundInfo = envelope.payload()?;
                tracing::info!("Game {} round {} started", self.game_id, info.round);
                self.update(|s| s.enter_round(&info));
            }
            MessageType::RoundEnd => {
                let info: RoundInfo = envelope.payload()?;
                tracing::info!("Game {} round {} ended", self.game_id, info.round);
            }
            MessageType::Heartbeat => {}
        }
        Ok(())
    }
}

/// Mirror the socket state into the session, recover after reconnects and
/// fall back to the session connect loop once the socket gives up.
async fn watch_connection(shared: Arc<Shared>, player_id: String, mut service: Arc<WebSocketService>) {
    loop {
        let mut state = service.state();
        let mut dropped = false;
        loop {
            let current = *state.borrow_and_update();
            shared.update(|s| s.connection = current);
            match current {
                ConnectionState::Disconnected => dropped = true,
                ConnectionState::Connected if dropped => {
                    dropped = false;
                    match shared.refresh().await {
                        Ok(()) => tracing::info!("Recovered state for game {}", shared.game_id),
                        Err(e) => tracing::warn!("State recovery for game {} failed: {}", shared.game_id, e),
                    }
                }
                ConnectionState::Error => break,
                _ => {}
            }
            if state.changed().await.is_err() {
                return;
            }
        }

        match shared.connect(&player_id).await {
            Ok(fresh) => {
                service = fresh;
                if let Err(e) = shared.refresh().await {
                    tracing::warn!("State recovery for game {} failed: {}", shared.game_id, e);
                }
            }
            Err(e) => {
                tracing::error!("Giving up on relay for game {}: {}", shared.game_id, e);
                shared.update(|s| {
                    s.connection = ConnectionState::Error;
                    s.error = Some(CONNECT_ERROR.to_string());
                });
                return;
            }
        }
    }
}

/// A client's live view of one game.
pub struct GameSession {
    shared: Arc<Shared>,
    listeners: Vec<ListenerId>,
    tasks: Vec<JoinHandle<()>>,
}

impl GameSession {
    pub fn new(ctx: Arc<SessionContext>, game_id: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                game_id: game_id.to_string(),
                state: watch::channel(SessionState::default()).0,
            }),
            listeners: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Create a session and join the game as `name`.
    pub async fn join(ctx: Arc<SessionContext>, game_id: &str, name: &str) -> Result<Self> {
        let mut session = Self::new(ctx, game_id);
        session.start(name).await?;
        Ok(session)
    }

    /// Resolve the player, load the game and wire up live updates. On
    /// failure the state carries a generic error and the cause is returned.
    pub async fn start(&mut self, name: &str) -> Result<()> {
        match self.init(name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Session for game {} failed to start: {}", self.shared.game_id, e);
                self.shared.update(|s| {
                    s.error = Some(INIT_ERROR.to_string());
                    s.loading = false;
                });
                Err(e)
            }
        }
    }

    async fn init(&mut self, name: &str) -> Result<()> {
        let ctx = self.shared.ctx.clone();
        let game_id = self.shared.game_id.clone();

        let mut events = ctx.backend.subscribe(&game_id);
        let (player, is_new) = self.resolve_player(name).await?;
        let (game, players) = self.shared.fetch().await?;
        let player = players
            .iter()
            .find(|p| p.id == player.id)
            .cloned()
            .unwrap_or(player);
        self.shared.update(|s| {
            s.game = Some(game);
            s.players = players;
            s.player = Some(player.clone());
            s.error = None;
            s.loading = false;
        });

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => shared.apply_backend(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} backend events for game {}", missed, shared.game_id);
                        if let Err(e) = shared.refresh().await {
                            tracing::warn!("Refetch for game {} failed: {}", shared.game_id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        for kind in MessageType::ALL.into_iter().filter(|k| *k != MessageType::Heartbeat) {
            let tx = tx.clone();
            let id = ctx.connections.add_listener(&game_id, kind, move |envelope| {
                let _ = tx.send(envelope.clone());
            });
            self.listeners.push(id);
        }
        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                shared.handle(envelope).await;
            }
        }));

        match self.shared.connect(&player.id).await {
            Ok(service) => {
                let current = service.connection_state();
                self.shared.update(|s| s.connection = current);
                if is_new {
                    service.send(Envelope::new(MessageType::PlayerJoin, game_id.as_str(), &player));
                }
                self.tasks
                    .push(tokio::spawn(watch_connection(self.shared.clone(), player.id.clone(), service)));
            }
            Err(e) => {
                tracing::error!("Could not join relay for game {}: {}", game_id, e);
                self.shared.update(|s| s.connection = ConnectionState::Error);
            }
        }
        tracing::info!("Session for game {} ready as {}", game_id, player.name);
        Ok(())
    }

    /// Stored id, then this context's earlier join, then a new player. The
    /// first player into a game without a host claims it.
    async fn resolve_player(&self, name: &str) -> Result<(Player, bool)> {
        let ctx = &self.shared.ctx;
        let game_id = &self.shared.game_id;

        let known = [ctx.store.player_id(game_id), ctx.initialized_player(game_id)];
        for id in known.into_iter().flatten() {
            match ctx.backend.get_player(&id).await? {
                Some(player) if player.game_id == *game_id => {
                    tracing::info!("Rejoining game {} as {}", game_id, player.name);
                    self.remember(&player.id);
                    return Ok((player, false));
                }
                _ => tracing::warn!("Known player {} for game {} no longer exists", id, game_id),
            }
        }

        let game = ctx.backend.get_game(game_id).await?.ok_or_else(|| Error::NotFound {
            entity: "game",
            id: game_id.clone(),
        })?;
        let existing = ctx.backend.players_by_game_id(game_id).await?;
        let mut player = ctx.backend.create_player(&Player::new(game_id, name)).await?;

        if existing.is_empty() && game.host_id.is_none() && ctx.backend.claim_host(game_id, &player.id).await? {
            let patch = PlayerPatch {
                is_host: Some(true),
                ..Default::default()
            };
            player = ctx.backend.update_player(&player.id, &patch).await?;
            tracing::info!("{} is hosting game {}", player.name, game_id);
        }

        self.remember(&player.id);
        Ok((player, true))
    }

    fn remember(&self, player_id: &str) {
        let ctx = &self.shared.ctx;
        ctx.initialized
            .insert(self.shared.game_id.clone(), player_id.to_string());
        if let Err(e) = ctx.store.set_player_id(&self.shared.game_id, player_id) {
            tracing::warn!("Could not persist player id for game {}: {}", self.shared.game_id, e);
        }
    }

    pub fn game_id(&self) -> &str {
        &self.shared.game_id
    }

    pub fn player_id(&self) -> Option<String> {
        self.shared.player_id()
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Refetch the authoritative game and players.
    pub async fn refresh(&self) -> Result<()> {
        self.shared.refresh().await
    }

    /// Persist a game change and tell the other clients about it.
    pub async fn publish_game_update(&self, patch: &GamePatch) -> Result<Game> {
        let game = self.shared.ctx.backend.update_game(&self.shared.game_id, patch).await?;
        self.shared.update(|s| s.game = Some(game.clone()));
        self.shared
            .send(Envelope::new(MessageType::GameUpdate, self.shared.game_id.as_str(), patch));
        Ok(game)
    }

    /// Persist a change to this client's player and broadcast the result.
    pub async fn publish_player_update(&self, patch: &PlayerPatch) -> Result<Player> {
        let player_id = self.player_id().ok_or(Error::NotConnected)?;
        let player = self.shared.ctx.backend.update_player(&player_id, patch).await?;
        self.shared.update(|s| s.upsert_player(player.clone()));
        self.shared
            .send(Envelope::new(MessageType::PlayerUpdate, self.shared.game_id.as_str(), &player));
        Ok(player)
    }

    /// Adopt a game record produced locally without telling anyone.
    pub fn set_game(&self, game: Game) {
        self.shared.update(|s| s.game = Some(game));
    }

    /// Adopt a game a rule engine already persisted and push it to the other
    /// clients as GAME_UPDATE.
    pub fn broadcast_game(&self, game: &Game) -> bool {
        self.shared.update(|s| s.game = Some(game.clone()));
        self.shared
            .send(Envelope::new(MessageType::GameUpdate, self.shared.game_id.as_str(), game))
    }

    /// [`broadcast_game`](Self::broadcast_game) after a round started or
    /// ended, followed by ROUND_START or ROUND_END.
    pub fn broadcast_round(&self, game: &Game) -> bool {
        let sent = self.broadcast_game(game);
        let Some(kind) = round_message(game) else { return sent };
        let info = RoundInfo {
            round: game.current_round,
            letters: game.current_letters.clone(),
            drawer_id: match game.settings() {
                Ok(GameSettings::Picture(settings)) => settings.drawer_id,
                _ => None,
            },
        };
        self.shared.send(Envelope::new(kind, self.shared.game_id.as_str(), &info)) && sent
    }

    /// Push a player a rule engine already persisted, e.g. after scoring.
    pub fn broadcast_player(&self, player: &Player) -> bool {
        self.shared.update(|s| s.upsert_player(player.clone()));
        self.shared
            .send(Envelope::new(MessageType::PlayerUpdate, self.shared.game_id.as_str(), player))
    }

    /// Stream the drawer's canvas to the other clients.
    pub fn broadcast_drawing(&self, drawing: &DrawingData) -> Result<bool> {
        let player_id = self.player_id().ok_or(Error::NotConnected)?;
        let encoded = serde_json::to_string(drawing)?;
        self.shared.update(|s| {
            if let Some(game) = &mut s.game {
                game.current_drawing = Some(encoded);
            }
        });
        let update = DrawingUpdate {
            player_id,
            drawing: drawing.clone(),
        };
        Ok(self
            .shared
            .send(Envelope::new(MessageType::DrawingUpdate, self.shared.game_id.as_str(), &update)))
    }

    /// Send on this session's relay connection; false if it was queued or
    /// there is no connection.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.shared.send(envelope)
    }

    /// Ask the host for a STATE_RECOVERY.
    pub fn request_state(&self) -> bool {
        self.send(Envelope::empty(MessageType::GetState, self.shared.game_id.as_str()))
    }

    /// Stop background work and drop the relay connection.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let ctx = &self.shared.ctx;
        for id in self.listeners.drain(..) {
            ctx.connections.remove_listener(id);
        }
        if let Some(player_id) = self.shared.player_id() {
            ctx.connections.remove_connection(&self.shared.game_id, Some(&player_id));
        }
    }
}

/// The round message announcing a game in this status.
fn round_message(game: &Game) -> Option<MessageType> {
    match game.status {
        GameStatus::Playing => Some(MessageType::RoundStart),
        GameStatus::RoundEnd | GameStatus::Finished => Some(MessageType::RoundEnd),
        GameStatus::Setup | GameStatus::Lobby => None,
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        self.close();
    }
}
