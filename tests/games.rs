mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use common::{client_config, settle, spawn_relay, wait_for, within};
use denbox::backend::{GameBackend, MemoryBackend};
use denbox::dictionary::WordValidator;
use denbox::games::{new_game, DrawingDebouncer, GameRules, GuessOutcome, LetterGame, PictureGame, WordOutcome};
use denbox::protocol::{Envelope, MessageType, RoundInfo};
use denbox::session::{GameSession, SessionContext};
use denbox::storage::MemoryStore;
use denbox::types::{DrawingData, Game, GameSettings, GameStatus, GameType, LetterSettings, PicturePhase, Point, Stroke};

/// Stand-in for the dictionary proxy.
struct Words(&'static [&'static str]);

#[async_trait]
impl WordValidator for Words {
    async fn validate(&self, words: &[String]) -> denbox::Result<Vec<bool>> {
        Ok(words
            .iter()
            .map(|w| self.0.iter().any(|known| known.eq_ignore_ascii_case(w)))
            .collect())
    }
}

#[tokio::test]
async fn letter_race_round() {
    let addr = spawn_relay(None).await;
    let backend = Arc::new(MemoryBackend::new());
    let game = new_game(backend.as_ref(), GameType::LetterRace).await.unwrap();
    assert_eq!(game.status, GameStatus::Lobby);
    assert_eq!(game.settings().unwrap(), GameSettings::Letter(LetterSettings::default()));

    let ctx = SessionContext::new(client_config(addr), backend.clone(), Arc::new(MemoryStore::new()));
    let session = GameSession::join(ctx, &game.id, "Ann").await.unwrap();
    let me = session.player_id().unwrap();

    let mut letters = LetterGame::new(session.snapshot().game.unwrap(), backend.clone()).unwrap();
    letters.start_round_with(&me, "AB", Utc::now()).await.unwrap();
    session.set_game(letters.game().clone());

    let dictionary = Words(&["cable"]);
    let outcome = letters.submit_word(&me, "CABLE", &dictionary).await.unwrap();
    let WordOutcome::Accepted { points, player, .. } = outcome else {
        panic!("CABLE should be accepted, got {outcome:?}");
    };
    assert_eq!(points, 1);
    assert_eq!(player.score, 1);
    assert_eq!(letters.calculate_score(&player.current_words), 1);

    let mut rx = session.state();
    let state = wait_for(&mut rx, |st| st.player.as_ref().is_some_and(|p| p.score == 1)).await;
    assert_eq!(state.game.unwrap().current_letters.as_deref(), Some("AB"));
}

#[tokio::test]
async fn picture_game_round_with_three_players() {
    let addr = spawn_relay(None).await;
    let backend = Arc::new(MemoryBackend::new());
    let game = new_game(backend.as_ref(), GameType::PictureGame).await.unwrap();

    let mut sessions = Vec::new();
    for name in ["A", "B", "C"] {
        let ctx = SessionContext::new(client_config(addr), backend.clone(), Arc::new(MemoryStore::new()));
        sessions.push(GameSession::join(ctx, &game.id, name).await.unwrap());
    }
    let ids: Vec<String> = sessions.iter().map(|s| s.player_id().unwrap()).collect();
    let (a, b, c) = (&ids[0], &ids[1], &ids[2]);

    let hosted = backend.get_game(&game.id).await.unwrap().unwrap();
    assert_eq!(hosted.host_id.as_ref(), Some(a));

    let mut picture = PictureGame::new(hosted, backend.clone()).unwrap();
    let now = Utc::now();
    picture.start_round_with_prompt(a, "house", now).await.unwrap();
    assert!(picture.is_drawer(a));

    picture.advance_phase(a, now).await.unwrap();
    assert_eq!(picture.phase(), Some(PicturePhase::Guess));

    assert!(matches!(
        picture.submit_guess(b, "house", now).await.unwrap(),
        GuessOutcome::Correct { points: 3, .. }
    ));
    assert!(matches!(
        picture.submit_guess(c, "House", now).await.unwrap(),
        GuessOutcome::Correct { points: 1, .. }
    ));

    let scores = picture.calculate_score(&picture.settings().guesses);
    assert_eq!(scores.get(b), Some(&3));
    assert_eq!(scores.get(c), Some(&1));
    assert!(!scores.contains_key(a));

    // Every session learns the new scores from the backend.
    let mut rx = sessions[2].state();
    let state = wait_for(&mut rx, |st| {
        st.players.iter().filter(|p| p.score > 0).count() == 2
    })
    .await;
    let score_of = |id: &String| state.players.iter().find(|p| &p.id == id).unwrap().score;
    assert_eq!(score_of(a), 0);
    assert_eq!(score_of(b), 3);
    assert_eq!(score_of(c), 1);
}

/// Two clients whose backends never see each other's writes, like two
/// GraphQL clients without subscriptions. Only the relay connects them.
struct Table {
    host: GameSession,
    host_backend: Arc<MemoryBackend>,
    guest: GameSession,
    guest_ctx: Arc<SessionContext>,
    game: Game,
}

async fn table(game_type: GameType) -> Table {
    let addr = spawn_relay(None).await;
    let host_backend = Arc::new(MemoryBackend::new());
    let game = new_game(host_backend.as_ref(), game_type).await.unwrap();
    let guest_backend = Arc::new(MemoryBackend::new());
    guest_backend.create_game(&game).await.unwrap();

    let host_ctx = SessionContext::new(client_config(addr), host_backend.clone(), Arc::new(MemoryStore::new()));
    let guest_ctx = SessionContext::new(client_config(addr), guest_backend, Arc::new(MemoryStore::new()));
    let host = GameSession::join(host_ctx, &game.id, "Ann").await.unwrap();
    let guest = GameSession::join(guest_ctx.clone(), &game.id, "Ben").await.unwrap();
    settle().await;
    let game = host.snapshot().game.unwrap();
    Table {
        host,
        host_backend,
        guest,
        guest_ctx,
        game,
    }
}

fn record(ctx: &SessionContext, game_id: &str, kind: MessageType) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctx.connections.add_listener(game_id, kind, move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    rx
}

#[tokio::test]
async fn letter_round_reaches_other_clients() {
    let t = table(GameType::LetterRace).await;
    let ann = t.host.player_id().unwrap();
    let mut starts = record(&t.guest_ctx, &t.game.id, MessageType::RoundStart);
    let mut ends = record(&t.guest_ctx, &t.game.id, MessageType::RoundEnd);
    let mut ben_rx = t.guest.state();

    let mut letters = LetterGame::new(t.game.clone(), t.host_backend.clone()).unwrap();
    let started = letters.start_round_with(&ann, "AB", Utc::now()).await.unwrap().clone();
    assert!(t.host.broadcast_round(&started));

    let state = wait_for(&mut ben_rx, |st| {
        st.game.as_ref().is_some_and(|g| g.status == GameStatus::Playing)
    })
    .await;
    let game = state.game.unwrap();
    assert_eq!(game.current_round, 1);
    assert_eq!(game.current_letters.as_deref(), Some("AB"));
    let info: RoundInfo = within(starts.recv()).await.unwrap().payload().unwrap();
    assert_eq!(info.round, 1);
    assert_eq!(info.letters.as_deref(), Some("AB"));

    let outcome = letters.submit_word(&ann, "cable", &Words(&["cable"])).await.unwrap();
    let WordOutcome::Accepted { player, .. } = outcome else {
        panic!("CABLE should be accepted, got {outcome:?}");
    };
    t.host.broadcast_player(&player);
    wait_for(&mut ben_rx, |st| st.players.iter().any(|p| p.id == ann && p.score == 1)).await;

    let ended = letters.end_round(&ann, Utc::now()).await.unwrap().clone();
    t.host.broadcast_round(&ended);
    wait_for(&mut ben_rx, |st| {
        st.game.as_ref().is_some_and(|g| g.status == GameStatus::RoundEnd)
    })
    .await;
    let info: RoundInfo = within(ends.recv()).await.unwrap().payload().unwrap();
    assert_eq!(info.round, 1);
}

#[tokio::test]
async fn drawings_reach_guessers() {
    let t = table(GameType::PictureGame).await;
    let ann = t.host.player_id().unwrap();
    let mut starts = record(&t.guest_ctx, &t.game.id, MessageType::RoundStart);
    let mut ben_rx = t.guest.state();

    let mut picture = PictureGame::new(t.game.clone(), t.host_backend.clone()).unwrap();
    let started = picture
        .start_round_with_prompt(&ann, "house", Utc::now())
        .await
        .unwrap()
        .clone();
    t.host.broadcast_round(&started);
    let info: RoundInfo = within(starts.recv()).await.unwrap().payload().unwrap();
    assert_eq!(info.drawer_id.as_deref(), Some(ann.as_str()));

    let state = wait_for(&mut ben_rx, |st| {
        st.game.as_ref().is_some_and(|g| g.status == GameStatus::Playing)
    })
    .await;
    let synced = PictureGame::new(state.game.unwrap(), t.host_backend.clone()).unwrap();
    assert_eq!(synced.phase(), Some(PicturePhase::Draw));
    assert!(synced.is_drawer(&ann));

    let (tx, mut drawings) = mpsc::unbounded_channel();
    let debouncer = DrawingDebouncer::spawn(DrawingData::default(), Duration::from_millis(50), tx);
    debouncer.push(Stroke {
        points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 4.0, y: 4.0 }],
        color: "#123456".into(),
        width: 3.0,
    });
    let drawing = within(drawings.recv()).await.unwrap();
    assert!(t.host.broadcast_drawing(&drawing).unwrap());

    let state = wait_for(&mut ben_rx, |st| {
        st.game
            .as_ref()
            .and_then(|g| g.current_drawing.as_deref())
            .is_some_and(|d| d.contains("#123456"))
    })
    .await;
    let stored: DrawingData = serde_json::from_str(state.game.unwrap().current_drawing.as_deref().unwrap()).unwrap();
    assert_eq!(stored, drawing);
}
