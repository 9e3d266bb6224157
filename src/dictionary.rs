use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::word_cache::WordCache;

/// Body of `POST /api/validate-words`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateWordsRequest {
    pub words: Vec<String>,
}

/// Answers whether words are real dictionary words, one verdict per word.
#[async_trait]
pub trait WordValidator: Send + Sync {
    async fn validate(&self, words: &[String]) -> Result<Vec<bool>>;
}

/// Client side of the validation proxy, fronted by a [`WordCache`].
pub struct DictionaryClient {
    http: reqwest::Client,
    endpoint: String,
    cache: Mutex<WordCache>,
    policy: RetryPolicy,
}

impl DictionaryClient {
    pub fn new(endpoint: impl Into<String>, cache_size: usize, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            cache: Mutex::new(WordCache::new(cache_size)),
            policy,
        }
    }

    async fn fetch(&self, words: &[String]) -> Result<Vec<bool>> {
        let body = &ValidateWordsRequest { words: words.to_vec() };
        let this = self;
        self.policy
            .run("validate-words", move || async move {
                let res = this.http.post(&this.endpoint).json(body).send().await?;
                if !res.status().is_success() {
                    return Err(Error::Status {
                        status: res.status().as_u16(),
                        url: this.endpoint.clone(),
                    });
                }
                Ok(res.json::<Vec<bool>>().await?)
            })
            .await
    }
}

#[async_trait]
impl WordValidator for DictionaryClient {
    async fn validate(&self, words: &[String]) -> Result<Vec<bool>> {
        let mut verdicts: Vec<Option<bool>> = {
            let cache = self.cache.lock().await;
            words.iter().map(|w| cache.get(w)).collect()
        };

        let unknown: Vec<String> = words
            .iter()
            .zip(&verdicts)
            .filter(|(_, v)| v.is_none())
            .map(|(w, _)| w.clone())
            .collect();

        if !unknown.is_empty() {
            let fetched = self.fetch(&unknown).await?;
            if fetched.len() != unknown.len() {
                return Err(Error::Backend(format!(
                    "validate-words returned {} results for {} words",
                    fetched.len(),
                    unknown.len()
                )));
            }

            let mut cache = self.cache.lock().await;
            for (word, valid) in unknown.iter().zip(&fetched) {
                cache.set(word, *valid);
            }
            let mut fetched = fetched.into_iter();
            for slot in verdicts.iter_mut().filter(|v| v.is_none()) {
                *slot = fetched.next();
            }
        }

        Ok(verdicts.into_iter().map(|v| v.unwrap_or(false)).collect())
    }
}

/// Server side of the proxy: asks the public dictionary API about each word.
#[derive(Clone)]
pub struct DictionaryApi {
    http: reqwest::Client,
    base_url: String,
}

impl DictionaryApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn lookup(&self, word: &str) -> Result<bool> {
        let word = word.trim().to_lowercase();
        if word.is_empty() || !word.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(false);
        }

        let url = format!("{}/{}", self.base_url, word);
        let res = self.http.get(&url).send().await?;
        match res.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Look every word up concurrently. Failed lookups count as invalid.
    pub async fn validate_all(&self, words: &[String]) -> Vec<bool> {
        let lookups = words.iter().map(|w| async move {
            match self.lookup(w).await {
                Ok(valid) => valid,
                Err(e) => {
                    tracing::warn!("Dictionary lookup for {:?} failed: {}", w, e);
                    false
                }
            }
        });
        futures::future::join_all(lookups).await
    }
}

#[async_trait]
impl WordValidator for DictionaryApi {
    async fn validate(&self, words: &[String]) -> Result<Vec<bool>> {
        Ok(self.validate_all(words).await)
    }
}
