//! Flood protection for the relay
//!
//! Client messages are counted per connection in fixed windows. A client that
//! exceeds the budget gets a `RATE_LIMITED` error for each extra message until
//! the window rolls over.

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window message counter keyed by connection
#[derive(Debug, Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    max_messages: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES, Duration::from_secs(DEFAULT_WINDOW_SECS))
    }
}

const DEFAULT_MAX_MESSAGES: u32 = 120;
const DEFAULT_WINDOW_SECS: u64 = 10;

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            max_messages,
            window,
        }
    }

    /// Count one message for `key`. Returns false once the window's budget is spent.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.count = 0;
            entry.started = now;
        }
        if entry.count >= self.max_messages {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop a closed connection's counter
    pub async fn forget(&self, key: &str) {
        self.windows.write().await.remove(key);
    }

    /// Drop counters whose window ended long ago. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < self.window * 2);
        before - windows.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.read().await.len()
    }
}

/// Relay flood limits
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// None = unlimited
    pub rate_limiter: Option<RateLimiter>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limiter: Some(RateLimiter::default()),
        }
    }
}

impl LimitsConfig {
    /// Load config from environment variables. `RELAY_RATE_LIMIT=0` disables limiting.
    pub fn from_env() -> Self {
        let max_messages = std::env::var("RELAY_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGES);

        let window_secs = std::env::var("RELAY_RATE_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_WINDOW_SECS);

        let rate_limiter = (max_messages > 0)
            .then(|| RateLimiter::new(max_messages, Duration::from_secs(window_secs)));

        tracing::info!(
            max_messages,
            window_secs,
            enabled = rate_limiter.is_some(),
            "Relay limits loaded"
        );

        Self { rate_limiter }
    }
}
