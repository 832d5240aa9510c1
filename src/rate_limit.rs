// src/rate_limit.rs
// Fixed-window admission control keyed by client identity

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ids;

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_reset_at: i64,
}

/// Result of a single admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Epoch millis at which the current window ends
    pub reset_at: i64,
    /// Seconds until the window ends, only set on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

pub struct RateLimiter {
    max_requests: u32,
    window_ms: i64,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window_ms: window_ms.max(1) as i64,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    /// Check and count a request for `client_id` at the current time
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        self.check_at(client_id, ids::now_millis())
    }

    /// Check and count a request at `now` (epoch millis).
    ///
    /// The read-modify-write happens under one lock, so concurrent requests
    /// for the same key can never both take the last slot.
    pub fn check_at(&self, client_id: &str, now: i64) -> RateLimitDecision {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let entry = entries
            .entry(client_id.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                window_reset_at: now + self.window_ms,
            });

        if now > entry.window_reset_at {
            *entry = RateLimitEntry {
                count: 0,
                window_reset_at: now + self.window_ms,
            };
        }

        if entry.count >= self.max_requests {
            let wait_ms = (entry.window_reset_at - now).max(0) as u64;
            let retry_after = wait_ms.div_ceil(1000).max(1);
            warn!(client = %client_id, retry_after, "Rate limit exceeded");
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                limit: self.max_requests,
                reset_at: entry.window_reset_at,
                retry_after: Some(retry_after),
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: self.max_requests - entry.count,
            limit: self.max_requests,
            reset_at: entry.window_reset_at,
            retry_after: None,
        }
    }

    /// Drop entries whose window has ended. Returns how many were removed.
    pub fn sweep_at(&self, now: i64) -> usize {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, e| now <= e.window_reset_at);
        before - entries.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(ids::now_millis())
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Periodically sweep expired entries until `shutdown` fires
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = limiter.sweep();
                    if removed > 0 {
                        debug!(removed, "Swept expired rate limit entries");
                    }
                }
            }
        }
    })
}
