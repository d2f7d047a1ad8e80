//! Rate limiting for escalated error logs
//!
//! A misbehaving or hostile client can make every datagram it sends fail.
//! Escalated failures are logged through this limiter so that one source
//! cannot flood the operator's log:
//! - Tracks logged errors per source IP address
//! - Implements sliding window limiting
//! - Counts what was logged and what was dropped
//! - Handles cleanup of idle sources

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Statistics about error log throttling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Number of sources with errors inside the current window
    pub tracked_sources: usize,

    /// Number of sources currently at their limit
    pub throttled_sources: usize,

    /// Total errors logged
    pub logged: u64,

    /// Total errors dropped while a source was throttled
    pub dropped: u64,
}

#[derive(Default)]
struct SourceHistory {
    /// When each logged error within the window happened
    logged_at: Vec<Instant>,
    dropped: u64,
}

/// Sliding window limiter keyed by source IP address
pub struct RateLimiter {
    sources: RwLock<HashMap<IpAddr, SourceHistory>>,

    /// Errors allowed per source within the window
    max_per_window: usize,

    window: Duration,

    totals: RwLock<(u64, u64)>,
}

impl RateLimiter {
    /// Creates a new rate limiter
    ///
    /// # Arguments
    /// * `max_per_window` - Errors logged per source within the window
    /// * `window` - Length of the sliding window
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            max_per_window,
            window,
            totals: RwLock::new((0, 0)),
        }
    }

    /// Records an error from `source` and decides whether to log it
    ///
    /// # Returns
    /// * `true` if the error should be logged
    /// * `false` if the source has reached its limit
    pub async fn allow(&self, source: IpAddr) -> bool {
        let mut sources = self.sources.write().await;
        let now = Instant::now();

        let history = sources.entry(source).or_default();
        history
            .logged_at
            .retain(|&time| now.duration_since(time) <= self.window);

        let allowed = history.logged_at.len() < self.max_per_window;
        if allowed {
            history.logged_at.push(now);
        } else {
            history.dropped += 1;
            // First drop in a burst is worth a note
            if history.dropped == 1 {
                log::warn!(
                    "Throttling error logs for {}: {} errors in {:?}",
                    source,
                    history.logged_at.len(),
                    self.window
                );
            }
        }
        drop(sources);

        let mut totals = self.totals.write().await;
        if allowed {
            totals.0 += 1;
        } else {
            totals.1 += 1;
        }
        allowed
    }

    /// Forgets sources with no errors inside the window
    pub async fn cleanup(&self) {
        let mut sources = self.sources.write().await;
        let now = Instant::now();

        sources.retain(|_, history| {
            history
                .logged_at
                .retain(|&time| now.duration_since(time) <= self.window);
            if history.logged_at.is_empty() {
                return false;
            }
            history.dropped = 0;
            true
        });
    }

    /// Gets current throttling statistics
    pub async fn get_stats(&self) -> RateLimitStats {
        let sources = self.sources.read().await;
        let (logged, dropped) = *self.totals.read().await;
        let now = Instant::now();

        let live = |history: &SourceHistory| {
            history
                .logged_at
                .iter()
                .filter(|&&time| now.duration_since(time) <= self.window)
                .count()
        };

        RateLimitStats {
            tracked_sources: sources.values().filter(|&h| live(h) > 0).count(),
            throttled_sources: sources
                .values()
                .filter(|&h| live(h) >= self.max_per_window)
                .count(),
            logged,
            dropped,
        }
    }
}
