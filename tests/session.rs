mod common;

use std::sync::Arc;

use common::{client_config, settle, spawn_relay, spawn_relay_with, wait_for};
use denbox::backend::{GameBackend, MemoryBackend};
use denbox::config::RelayConfig;
use denbox::games::new_game;
use denbox::protocol::MessageType;
use denbox::session::{GameSession, SessionContext};
use denbox::storage::{FileStore, MemoryStore, PlayerStore};
use denbox::types::{Game, GamePatch, GameStatus, GameType, PlayerPatch};
use denbox::ws::ConnectionState;
use denbox::Error;

struct Setup {
    addr: std::net::SocketAddr,
    backend: Arc<MemoryBackend>,
    game: Game,
}

async fn setup() -> Setup {
    let addr = spawn_relay(None).await;
    let backend = Arc::new(MemoryBackend::new());
    let game = new_game(backend.as_ref(), GameType::LetterRace).await.unwrap();
    Setup { addr, backend, game }
}

fn context(setup: &Setup, backend: Arc<dyn GameBackend>) -> Arc<SessionContext> {
    SessionContext::new(client_config(setup.addr), backend, Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn first_player_becomes_host() {
    let s = setup().await;
    let ann_ctx = context(&s, s.backend.clone());
    let ben_ctx = context(&s, s.backend.clone());

    let ann = GameSession::join(ann_ctx.clone(), &s.game.id, "Ann").await.unwrap();
    let ben = GameSession::join(ben_ctx, &s.game.id, "Ben").await.unwrap();

    let ann_state = ann.snapshot();
    let me = ann_state.player.clone().unwrap();
    assert!(me.is_host);
    assert!(ann_state.is_host());
    assert_eq!(ann_state.game.as_ref().unwrap().host_id.as_deref(), Some(me.id.as_str()));
    assert_eq!(ann_ctx.store.player_id(&s.game.id), Some(me.id.clone()));
    assert_eq!(ann_ctx.initialized_player(&s.game.id), Some(me.id));

    let ben_state = ben.snapshot();
    assert!(!ben_state.player.as_ref().unwrap().is_host);
    assert!(!ben_state.is_host());
    assert!(!ben_state.loading);
    assert_eq!(ben_state.connection, ConnectionState::Connected);
}

#[tokio::test]
async fn known_player_is_reused() {
    let s = setup().await;
    let ctx = context(&s, s.backend.clone());

    let mut first = GameSession::join(ctx.clone(), &s.game.id, "Ann").await.unwrap();
    let id = first.player_id().unwrap();
    first.close();

    let second = GameSession::join(ctx, &s.game.id, "Ann again").await.unwrap();
    assert_eq!(second.player_id(), Some(id));
    assert_eq!(s.backend.players_by_game_id(&s.game.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stored_player_survives_a_restart() {
    let s = setup().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("players.json");

    let ctx = SessionContext::new(client_config(s.addr), s.backend.clone(), Arc::new(FileStore::open(&path)));
    let id = GameSession::join(ctx, &s.game.id, "Ann").await.unwrap().player_id().unwrap();

    let restarted = SessionContext::new(client_config(s.addr), s.backend.clone(), Arc::new(FileStore::open(&path)));
    let session = GameSession::join(restarted, &s.game.id, "Ann").await.unwrap();
    assert_eq!(session.player_id(), Some(id));
}

#[tokio::test]
async fn unknown_game_reports_a_generic_error() {
    let s = setup().await;
    let mut session = GameSession::new(context(&s, s.backend.clone()), "NOPE");

    let res = session.start("Ann").await;
    assert!(matches!(res, Err(Error::NotFound { .. })));
    let state = session.snapshot();
    assert_eq!(state.error.as_deref(), Some("Failed to initialize game session"));
    assert!(!state.loading);
}

#[tokio::test]
async fn backend_changes_reach_every_session() {
    let s = setup().await;
    let ann = GameSession::join(context(&s, s.backend.clone()), &s.game.id, "Ann").await.unwrap();
    let ben = GameSession::join(context(&s, s.backend.clone()), &s.game.id, "Ben").await.unwrap();

    let mut ann_rx = ann.state();
    wait_for(&mut ann_rx, |st| st.players.len() == 2).await;

    ben.publish_player_update(&PlayerPatch {
        score: Some(4),
        ..Default::default()
    })
    .await
    .unwrap();
    let ben_id = ben.player_id().unwrap();
    let state = wait_for(&mut ann_rx, |st| st.players.iter().any(|p| p.id == ben_id && p.score == 4)).await;
    assert_eq!(state.players.len(), 2);
}

/// Each client gets its own backend copy, so changes can only arrive over
/// the relay.
#[tokio::test]
async fn game_updates_travel_over_the_relay() {
    let s = setup().await;
    let ben_backend = Arc::new(MemoryBackend::new());
    ben_backend.create_game(&s.game).await.unwrap();

    let ann = GameSession::join(context(&s, s.backend.clone()), &s.game.id, "Ann").await.unwrap();
    let ben = GameSession::join(context(&s, ben_backend.clone()), &s.game.id, "Ben").await.unwrap();
    settle().await;

    let mut ben_rx = ben.state();
    // Ben's own PLAYER_JOIN reached Ann over the relay.
    let mut ann_rx = ann.state();
    wait_for(&mut ann_rx, |st| st.players.iter().any(|p| p.name == "Ben")).await;

    ann.publish_game_update(&GamePatch {
        status: Some(GameStatus::Playing),
        current_round: Some(1),
        current_letters: Some("AB".into()),
        ..Default::default()
    })
    .await
    .unwrap();

    let state = wait_for(&mut ben_rx, |st| {
        st.game.as_ref().is_some_and(|g| g.status == GameStatus::Playing)
    })
    .await;
    let game = state.game.unwrap();
    assert_eq!(game.current_round, 1);
    assert_eq!(game.current_letters.as_deref(), Some("AB"));
    // The merge only touched the relayed fields.
    assert_eq!(
        ben_backend.get_game(&s.game.id).await.unwrap().unwrap().status,
        GameStatus::Lobby
    );
}

#[tokio::test]
async fn host_answers_state_requests() {
    let s = setup().await;
    let ben_backend = Arc::new(MemoryBackend::new());
    ben_backend.create_game(&s.game).await.unwrap();

    let ann = GameSession::join(context(&s, s.backend.clone()), &s.game.id, "Ann").await.unwrap();
    let ben = GameSession::join(context(&s, ben_backend), &s.game.id, "Ben").await.unwrap();
    settle().await;

    let ann_id = ann.player_id().unwrap();
    let mut ben_rx = ben.state();
    assert!(ben.request_state());
    let state = wait_for(&mut ben_rx, |st| st.players.iter().any(|p| p.id == ann_id)).await;
    assert_eq!(state.game.unwrap().host_id, Some(ann_id));
}

#[tokio::test]
async fn closed_sessions_release_their_listeners() {
    let s = setup().await;
    let ctx = context(&s, s.backend.clone());
    let mut session = GameSession::join(ctx.clone(), &s.game.id, "Ann").await.unwrap();
    assert_eq!(ctx.connections.listener_count(&s.game.id, MessageType::GameUpdate), 1);
    assert_eq!(ctx.connections.len(), 1);

    session.close();
    assert_eq!(ctx.connections.listener_count(&s.game.id, MessageType::GameUpdate), 0);
    assert!(ctx.connections.is_empty());
}

#[tokio::test]
async fn dropped_socket_recovers_the_game() {
    let s = setup().await;
    let ctx = context(&s, s.backend.clone());
    let session = GameSession::join(ctx.clone(), &s.game.id, "Ann").await.unwrap();
    let me = session.player_id().unwrap();
    let mut rx = session.state();

    // Local copy drifted away from the backend while the socket was down.
    let mut stale = session.snapshot().game.unwrap();
    stale.status = GameStatus::Finished;
    session.set_game(stale);

    ctx.connections.connection(&s.game.id, Some(&me)).unwrap().disconnect();
    wait_for(&mut rx, |st| st.connection == ConnectionState::Disconnected).await;

    let state = wait_for(&mut rx, |st| {
        st.connection == ConnectionState::Connected
            && st.game.as_ref().is_some_and(|g| g.status == GameStatus::Lobby)
    })
    .await;
    assert!(state.error.is_none());
    assert!(ctx.connections.connection(&s.game.id, Some(&me)).unwrap().is_connected());
}

#[tokio::test]
async fn relay_going_away_ends_in_a_connection_error() {
    let config = RelayConfig {
        port: 0,
        api_key: None,
        dictionary_api_url: "http://127.0.0.1:9".to_string(),
    };
    let (addr, server) = spawn_relay_with(config).await;
    let backend = Arc::new(MemoryBackend::new());
    let game = new_game(backend.as_ref(), GameType::LetterRace).await.unwrap();
    let ctx = SessionContext::new(client_config(addr), backend, Arc::new(MemoryStore::new()));

    let session = GameSession::join(ctx.clone(), &game.id, "Ann").await.unwrap();
    let me = session.player_id().unwrap();
    let mut rx = session.state();

    server.abort();
    let _ = server.await;
    ctx.connections.connection(&game.id, Some(&me)).unwrap().disconnect();

    let state = wait_for(&mut rx, |st| st.connection == ConnectionState::Error && st.error.is_some()).await;
    assert_eq!(state.error.as_deref(), Some("Lost connection to the game server"));
    // The backend view survives the lost relay.
    assert_eq!(state.game.unwrap().id, game.id);
    assert!(ctx.connections.connection(&game.id, Some(&me)).is_none());
}
