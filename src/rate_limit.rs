//! Fixed-window admission control keyed by client identifier.
//!
//! Each client gets a counter and a reset instant. The first request after the
//! reset instant opens a fresh window. Because windows are fixed, a client can
//! land up to twice the limit across a window boundary.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_MAX_REQUESTS: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitEntry {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit of {max_requests} requests per {}s exceeded", .window.as_secs())]
pub struct RateLimitExceeded {
    pub max_requests: u32,
    pub window: Duration,
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        self.check_at(key, Instant::now()).await
    }

    /// Admits or rejects one request from `key` as of `now`.
    ///
    /// A rejection leaves the stored entry untouched.
    pub async fn check_at(&self, key: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut entries = self.entries.lock().await;

        match entries.get_mut(key) {
            Some(entry) if now < entry.reset_at => {
                if entry.count >= self.max_requests {
                    return Err(RateLimitExceeded {
                        max_requests: self.max_requests,
                        window: self.window,
                        retry_after: entry.reset_at - now,
                    });
                }
                entry.count += 1;
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    RateLimitEntry {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
            }
        }

        Ok(())
    }

    /// Drops every entry whose window has ended. Returns how many were removed.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.reset_at);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Sweeps expired entries once per window until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(limiter.window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_at(Instant::now()).await;
                        if removed > 0 {
                            let remaining = limiter.len().await;
                            debug!(removed, remaining, "Rate limiter swept expired entries");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
