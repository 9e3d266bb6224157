#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use denbox::config::{ClientConfig, RelayConfig};
use denbox::protocol::{Envelope, MessageType};
use denbox::relay::{router, RelayState};
use denbox::session::SessionState;

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Serve a relay on an ephemeral port.
pub async fn spawn_relay(api_key: Option<&str>) -> SocketAddr {
    let config = RelayConfig {
        port: 0,
        api_key: api_key.map(str::to_string),
        dictionary_api_url: "http://127.0.0.1:9".to_string(),
    };
    spawn_relay_with(config).await.0
}

/// Serve a relay; aborting the handle closes the listener so new
/// connections are refused.
pub async fn spawn_relay_with(config: RelayConfig) -> (SocketAddr, JoinHandle<()>) {
    let app = router(RelayState::new(&config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

type DictionaryState = (&'static [&'static str], Arc<AtomicUsize>);

/// A public dictionary API that knows `known` and counts lookups. Returns
/// its base url for `/entries/{word}`. `POST /short` always answers with a
/// single verdict.
pub async fn spawn_dictionary(known: &'static [&'static str]) -> (String, Arc<AtomicUsize>) {
    async fn entry(State((known, hits)): State<DictionaryState>, Path(word): Path<String>) -> StatusCode {
        hits.fetch_add(1, Ordering::SeqCst);
        if known.iter().any(|k| k.eq_ignore_ascii_case(&word)) {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn short() -> Json<Vec<bool>> {
        Json(vec![true])
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/entries/{word}", get(entry))
        .route("/short", post(short))
        .with_state((known, hits.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        relay_url: format!("ws://{addr}/ws"),
        validate_words_url: format!("http://{addr}/api/validate-words"),
        connect_attempts: 2,
        connect_base_delay_ms: 10,
        session_connect_attempts: 2,
        reconnect_delay_ms: 50,
        heartbeat_interval_secs: 0,
        ..Default::default()
    }
}

pub fn ws_url(addr: SocketAddr, game_id: &str, player_id: Option<&str>, api_key: Option<&str>) -> String {
    let mut url = format!("ws://{addr}/ws?gameId={game_id}");
    if let Some(player_id) = player_id {
        url.push_str(&format!("&playerId={player_id}"));
    }
    if let Some(key) = api_key {
        url.push_str(&format!("&apiKey={key}"));
    }
    url
}

/// Open a raw socket and wait until the relay has put it in its room.
pub async fn raw_socket(addr: SocketAddr, game_id: &str, player_id: Option<&str>) -> Socket {
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(addr, game_id, player_id, None))
        .await
        .unwrap();
    send(&mut ws, &Envelope::heartbeat(game_id)).await;
    let pong = next_envelope(&mut ws).await;
    assert_eq!(pong.kind, MessageType::Heartbeat);
    ws
}

pub async fn send(ws: &mut Socket, envelope: &Envelope) {
    ws.send(Message::Text(envelope.to_json().unwrap().into())).await.unwrap();
}

pub async fn next_envelope(ws: &mut Socket) -> Envelope {
    try_next_envelope(ws, WAIT).await.expect("no message from relay")
}

pub async fn try_next_envelope(ws: &mut Socket, wait: Duration) -> Option<Envelope> {
    let read = async {
        while let Some(frame) = ws.next().await {
            if let Ok(Message::Text(text)) = frame {
                return serde_json::from_str::<Envelope>(text.as_str()).ok();
            }
        }
        None
    };
    tokio::time::timeout(wait, read).await.ok().flatten()
}

/// Wait until the session state satisfies `pred`.
pub async fn wait_for(
    rx: &mut watch::Receiver<SessionState>,
    pred: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let state = tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session state closed");
    state.clone()
}

/// Give the relay a moment to register freshly upgraded sockets.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}
