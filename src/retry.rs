//! One retry policy for every network call site.

use std::future::Future;
use std::time::Duration;

use tokio_retry::RetryIf;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// `base × attempt`
    Linear,
    /// `base × 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// The waits between attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> std::vec::IntoIter<Duration> {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for(attempt))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(what, op, Error::is_retryable).await
    }

    pub async fn run_if<T, F, Fut, P>(&self, what: &str, mut op: F, mut retryable: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnMut(&Error) -> bool,
    {
        let max = self.max_attempts;
        let mut attempt = 0u32;
        let action = || {
            attempt += 1;
            let n = attempt;
            let fut = op();
            async move {
                let res = fut.await;
                if let Err(e) = &res {
                    tracing::warn!("{} failed (attempt {}/{}): {}", what, n, max, e);
                }
                res
            }
        };
        RetryIf::spawn(self.delays(), action, |e: &Error| retryable(e)).await
    }
}
