use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-second countdown for a round or phase. Stops when dropped.
pub struct RoundTimer {
    remaining: watch::Receiver<u32>,
    task: JoinHandle<()>,
}

impl RoundTimer {
    pub fn start(seconds: u32) -> Self {
        let (tx, remaining) = watch::channel(seconds);
        let task = tokio::spawn(async move {
            let mut left = seconds;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            while left > 0 {
                ticker.tick().await;
                left -= 1;
                if tx.send(left).is_err() {
                    return;
                }
            }
        });
        Self { remaining, task }
    }

    /// Pick up a countdown that started at `started` and lasts `seconds`.
    pub fn resume(started: DateTime<Utc>, seconds: u32, now: DateTime<Utc>) -> Self {
        let elapsed = (now - started).num_seconds().max(0) as u64;
        Self::start((seconds as u64).saturating_sub(elapsed) as u32)
    }

    pub fn remaining(&self) -> u32 {
        *self.remaining.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.remaining.clone()
    }

    /// Resolves once the countdown reaches zero.
    pub async fn expired(&mut self) {
        // A closed channel means the countdown already finished.
        let _ = self.remaining.wait_for(|left| *left == 0).await;
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
