use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retry::{Backoff, RetryPolicy};

/// Resolves a path relative to the config directory.
pub fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Relay server and word-validation proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub port: u16,
    /// When set, sockets must present this key as `apiKey`.
    pub api_key: Option<String>,
    pub dictionary_api_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            api_key: None,
            dictionary_api_url: "https://api.dictionaryapi.dev/api/v2/entries/en".to_string(),
        }
    }
}

/// Settings for the session-synchronization client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub relay_url: String,
    pub api_key: Option<String>,
    pub graphql_url: Option<String>,
    pub validate_words_url: String,
    pub connect_attempts: u32,
    pub connect_base_delay_ms: u64,
    pub session_connect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub request_attempts: u32,
    pub word_cache_max: usize,
    pub storage_file: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3000/ws".to_string(),
            api_key: None,
            graphql_url: None,
            validate_words_url: "http://localhost:3000/api/validate-words".to_string(),
            connect_attempts: 3,
            connect_base_delay_ms: 1000,
            session_connect_attempts: 5,
            reconnect_delay_ms: 1000,
            heartbeat_interval_secs: 30,
            request_attempts: 3,
            word_cache_max: 1000,
            storage_file: "players.json".to_string(),
        }
    }
}

impl ClientConfig {
    fn base_delay(&self) -> Duration {
        Duration::from_millis(self.connect_base_delay_ms)
    }

    /// Linear `base × attempt` between socket connect attempts.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, self.base_delay(), Backoff::Linear)
    }

    /// The manager's single reconnect after a dropped socket.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(1, self.base_delay(), Backoff::Linear)
    }

    /// The session's own connect loop: linear, capped at five times the base delay.
    pub fn session_connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.session_connect_attempts, self.base_delay(), Backoff::Linear)
            .with_max_delay(self.base_delay() * 5)
    }

    /// Backend and dictionary requests.
    pub fn request_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.request_attempts, Duration::from_millis(250), Backoff::Exponential)
            .with_max_delay(Duration::from_secs(4))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub client: ClientConfig,
}

/// Initialize the config directory with defaults if missing.
pub fn init() -> Result<()> {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base)?;
    }

    let path = config_path("denbox.json");
    if !path.exists() {
        fs::write(&path, serde_json::to_string_pretty(&Config::default())?)?;
        tracing::info!("Wrote default config to {}", path.display());
    }
    Ok(())
}

/// Load `denbox.json` and apply environment overrides.
pub fn load() -> Result<Config> {
    let path = config_path("denbox.json");
    let mut config: Config = if path.exists() {
        serde_json::from_str(&fs::read_to_string(&path)?)?
    } else {
        Config::default()
    };
    apply_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
        config.relay.port = port;
    }
    if let Some(key) = var("DENBOX_API_KEY") {
        config.relay.api_key = Some(key.clone());
        config.client.api_key = Some(key);
    }
    if let Some(url) = var("DENBOX_RELAY_URL") {
        config.client.relay_url = url;
    }
    if let Some(url) = var("DENBOX_GRAPHQL_URL") {
        config.client.graphql_url = Some(url);
    }
    if let Some(url) = var("DENBOX_DICTIONARY_URL") {
        config.relay.dictionary_api_url = url;
    }
}
