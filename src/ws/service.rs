use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::listeners::{ListenerId, Listeners};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{Envelope, MessageType};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Error => write!(f, "ERROR"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// The writer half of a live socket plus messages waiting for one.
#[derive(Default)]
struct Link {
    tx: Option<mpsc::UnboundedSender<Message>>,
    queue: VecDeque<Envelope>,
}

/// One socket to the relay for a (game, player) pair.
pub struct WebSocketService {
    game_id: String,
    player_id: Option<String>,
    url: Url,
    heartbeat_interval: Duration,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    handlers: Listeners<MessageType>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketService {
    pub fn new(config: &ClientConfig, game_id: &str, player_id: Option<&str>) -> Result<Arc<Self>> {
        let mut url = Url::parse(&config.relay_url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("gameId", game_id);
            if let Some(player_id) = player_id {
                query.append_pair("playerId", player_id);
            }
            if let Some(key) = &config.api_key {
                query.append_pair("apiKey", key);
            }
        }

        Ok(Arc::new(Self {
            game_id: game_id.to_string(),
            player_id: player_id.map(str::to_string),
            url,
            heartbeat_interval: config.heartbeat_interval(),
            state: watch::channel(ConnectionState::Disconnected).0,
            link: Mutex::new(Link::default()),
            handlers: Listeners::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Watch lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open the socket, retrying failed attempts under `policy`.
    pub async fn connect(self: &Arc<Self>, policy: &RetryPolicy) -> Result<()> {
        let what = format!("connect to relay for game {}", self.game_id);
        let res = policy.run_if(&what, || self.open(), |_| true).await;
        if let Err(e) = &res {
            tracing::error!("Giving up on relay for game {}: {}", self.game_id, e);
            self.state.send_replace(ConnectionState::Error);
        }
        res
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        self.stop_tasks();
        self.state.send_replace(ConnectionState::Connecting);
        tracing::info!("Connecting to relay for game {}", self.game_id);

        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                self.state.send_replace(ConnectionState::Error);
                return Err(e.into());
            }
        };
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // The writer is not tracked: it exits once the link drops `tx`.
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        {
            let mut link = self.lock_link();
            let queued = link.queue.len();
            for envelope in link.queue.drain(..) {
                if let Ok(json) = envelope.to_json() {
                    let _ = tx.send(Message::Text(json.into()));
                }
            }
            link.tx = Some(tx);
            self.state.send_replace(ConnectionState::Connected);
            tracing::info!(
                "Connected to relay for game {} ({} queued messages flushed)",
                self.game_id,
                queued
            );
        }

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Some(service) = weak.upgrade() else { return };
                        service.dispatch(&text);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Relay socket error: {}", e);
                        break;
                    }
                }
            }
            if let Some(service) = weak.upgrade() {
                service.mark_disconnected();
            }
        });

        let mut tasks = vec![reader];
        if !self.heartbeat_interval.is_zero() {
            tasks.push(tokio::spawn(heartbeat(Arc::downgrade(self), self.heartbeat_interval)));
        }
        self.lock_tasks().extend(tasks);

        Ok(())
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => {
                let handled = self.handlers.emit(&envelope.kind, &envelope);
                tracing::debug!("{:?} for game {} -> {} handlers", envelope.kind, envelope.game_id, handled);
            }
            Err(e) => tracing::warn!("Dropping invalid relay message: {}", e),
        }
    }

    fn mark_disconnected(&self) {
        self.lock_link().tx = None;
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::warn!("Relay connection for game {} closed", self.game_id);
    }

    /// Send now if connected; otherwise queue it for the next connect and
    /// return false.
    pub fn send(&self, envelope: Envelope) -> bool {
        let mut link = self.lock_link();
        if self.is_connected() {
            if let Some(tx) = &link.tx {
                match envelope.to_json() {
                    Ok(json) => {
                        if tx.send(Message::Text(json.into())).is_ok() {
                            return true;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Cannot encode {:?}: {}", envelope.kind, e);
                        return false;
                    }
                }
            }
        }
        link.queue.push_back(envelope);
        false
    }

    pub fn queued(&self) -> usize {
        self.lock_link().queue.len()
    }

    pub fn on<F>(&self, kind: MessageType, handler: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.handlers.add(kind, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.handlers.remove(id)
    }

    /// Close the socket and stop background tasks.
    pub fn disconnect(&self) {
        let tx = self.lock_link().tx.take();
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None));
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("Disconnected from relay for game {}", self.game_id);
    }

    fn stop_tasks(&self) {
        self.lock_link().tx = None;
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WebSocketService {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

async fn heartbeat(service: Weak<WebSocketService>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(svc) = service.upgrade() else { return };
        if svc.is_connected() {
            svc.send(Envelope::heartbeat(svc.game_id.clone()));
        }
    }
}
