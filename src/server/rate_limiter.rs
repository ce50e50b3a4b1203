//! Per-user fixed window that resets once it has elapsed.
//!
//! Reset-on-elapse keeps bookkeeping O(1) per call but lets a client burst
//! up to twice the limit around a window boundary.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::models::UserId;

#[derive(Debug, Clone)]
pub struct RateWindow {
    pub user_id: UserId,
    pub window_start: Instant,
    pub count: u32,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64, over_by: u32 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    windows: DashMap<UserId, RateWindow>,
    limit: u32,
    window: Duration,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, idle_ttl: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit: limit.max(1),
            window,
            idle_ttl,
        }
    }

    pub fn allow(&self, user_id: UserId) -> bool {
        self.check(user_id).is_allowed()
    }

    pub fn check(&self, user_id: UserId) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(user_id).or_insert_with(|| RateWindow {
            user_id,
            window_start: now,
            count: 0,
            last_seen: now,
        });
        let window = entry.value_mut();

        if now.duration_since(window.window_start) >= self.window {
            window.window_start = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);
        window.last_seen = now;

        if window.count <= self.limit {
            return RateDecision::Allowed { remaining: self.limit - window.count };
        }

        let over_by = window.count - self.limit;
        let left = self.window.saturating_sub(now.duration_since(window.window_start));
        let retry_after_secs = self.backoff(left, over_by);
        debug!(
            "[RATE] User {} over limit by {} (retry in {}s)",
            user_id, over_by, retry_after_secs
        );
        RateDecision::Limited { retry_after_secs, over_by }
    }

    /// Time left in the window, scaled by how many whole limits the user is over.
    fn backoff(&self, left: Duration, over_by: u32) -> u64 {
        let base = left.as_secs().max(1);
        let factor = 1 + u64::from(over_by / self.limit);
        (base * factor).min(self.window.as_secs().max(1) * 10)
    }

    /// Drops windows idle for longer than the TTL. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let keys: Vec<UserId> = self.windows.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter(|user_id| {
                self.windows
                    .remove_if(user_id, |_, w| now.duration_since(w.last_seen) > self.idle_ttl)
                    .is_some()
            })
            .count()
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }

    pub fn spawn_cleanup(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.cleanup();
                        if removed > 0 {
                            info!("[RATE] Cleaned up {} idle rate windows", removed);
                        }
                    }
                }
            }
        });
    }
}
