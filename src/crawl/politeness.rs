//! Per-origin politeness — request spacing for crawled sites
//!
//! Each origin gets a single-token bucket refilled at one request per
//! second (or slower when robots.txt sets a longer crawl delay).
//! Waiting is a cooperative suspension point: callers sleep, never spin.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Floor on per-origin spacing
pub const MIN_ORIGIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct OriginState {
    next_allowed: Instant,
    interval: Duration,
}

/// Tracks when each origin may next be fetched
pub struct PolitenessGate {
    origins: Mutex<HashMap<String, OriginState>>,
}

impl PolitenessGate {
    pub fn new() -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next fetch slot for `origin` and return how long the
    /// caller must sleep before using it. `crawl_delay_secs` comes from
    /// robots.txt and only ever lengthens the interval.
    pub fn reserve(&self, origin: &str, crawl_delay_secs: Option<u64>) -> Duration {
        let interval = crawl_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(MIN_ORIGIN_INTERVAL)
            .max(MIN_ORIGIN_INTERVAL);

        let now = Instant::now();
        let mut origins = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        let state = origins.entry(origin.to_string()).or_insert(OriginState {
            next_allowed: now,
            interval,
        });
        state.interval = interval;

        let wait = state.next_allowed.saturating_duration_since(now);
        state.next_allowed = now.max(state.next_allowed) + state.interval;
        wait
    }

    /// Reserve a slot and sleep until it opens
    pub async fn acquire(&self, origin: &str, crawl_delay_secs: Option<u64>) {
        let wait = self.reserve(origin, crawl_delay_secs);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Forget idle origins to bound memory on long crawls
    pub fn prune(&self) {
        let now = Instant::now();
        let mut origins = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        origins.retain(|_, state| state.next_allowed + Duration::from_secs(300) > now);
    }

    pub fn tracked_origins(&self) -> usize {
        self.origins.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for PolitenessGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fetch_is_immediate() {
        let gate = PolitenessGate::new();
        assert!(gate.reserve("https://example.org", None).is_zero());
    }

    #[test]
    fn test_second_fetch_waits_one_second() {
        let gate = PolitenessGate::new();
        gate.reserve("https://example.org", None);
        let wait = gate.reserve("https://example.org", None);
        assert!(wait > Duration::from_millis(900));
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_origins_independent() {
        let gate = PolitenessGate::new();
        gate.reserve("https://a.org", None);
        assert!(gate.reserve("https://b.org", None).is_zero());
    }

    #[test]
    fn test_crawl_delay_lengthens_interval() {
        let gate = PolitenessGate::new();
        gate.reserve("https://slow.org", Some(10));
        let wait = gate.reserve("https://slow.org", Some(10));
        assert!(wait > Duration::from_secs(9));
    }

    #[test]
    fn test_queueing_accumulates() {
        let gate = PolitenessGate::new();
        gate.reserve("https://example.org", None);
        gate.reserve("https://example.org", None);
        let third = gate.reserve("https://example.org", None);
        assert!(third > Duration::from_millis(1900));
    }
}
