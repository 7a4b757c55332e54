//! Load guard — admission control and bandwidth throttling
//!
//! Per-caller QPM quotas, a concurrency semaphore, token-bucket
//! bandwidth accounting, and the crawl-request throttle (60/h per
//! caller, 10 pending per domain). Over-limit requests are rejected
//! with BUSY; they are never queued unboundedly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::crypto::Fingerprint;

/// Crawl requests admitted per caller per hour
pub const CRAWL_REQUESTS_PER_HOUR: u32 = 60;
/// Pending crawl requests admitted per target domain
pub const MAX_PENDING_PER_DOMAIN: usize = 10;

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Admitted,
    Busy,
}

/// Sliding-window QPM counter per caller
#[derive(Debug, Default)]
struct QpmWindow {
    timestamps: Vec<Instant>,
}

/// Per-caller query admission: QPM quota + global concurrency
pub struct QueryGuard {
    qpm_limit: u32,
    windows: Mutex<HashMap<Fingerprint, QpmWindow>>,
    concurrency: Semaphore,
}

impl QueryGuard {
    pub fn new(qpm_limit: u32, max_concurrent: usize) -> Self {
        Self {
            qpm_limit,
            windows: Mutex::new(HashMap::new()),
            concurrency: Semaphore::new(max_concurrent),
        }
    }

    /// Try to admit a query from `caller`. Returns a permit that frees
    /// the concurrency slot on drop, or Busy.
    pub fn admit(&self, caller: Option<Fingerprint>) -> Result<QueryPermit<'_>, GuardVerdict> {
        if let Some(caller) = caller {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            let window = windows.entry(caller).or_default();
            let now = Instant::now();
            window
                .timestamps
                .retain(|t| now.duration_since(*t) < Duration::from_secs(60));
            if window.timestamps.len() as u32 >= self.qpm_limit {
                debug!(caller = %caller, "QPM quota exceeded");
                return Err(GuardVerdict::Busy);
            }
            window.timestamps.push(now);
        }

        match self.concurrency.try_acquire() {
            Ok(permit) => Ok(QueryPermit { _permit: permit }),
            Err(_) => Err(GuardVerdict::Busy),
        }
    }
}

/// Held for the duration of one admitted query
pub struct QueryPermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}

/// Token bucket for one direction of bandwidth
#[derive(Debug)]
struct Bucket {
    rate_bps: u64,
    capacity_bits: f64,
    tokens_bits: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            capacity_bits: rate_bps as f64,
            tokens_bits: rate_bps as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens_bits = (self.tokens_bits + elapsed * self.rate_bps as f64)
            .min(self.capacity_bits);
        self.last_refill = now;
    }

    /// Time to wait before `bits` are available; deducts on success
    fn reserve(&mut self, bits: f64, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens_bits >= bits {
            self.tokens_bits -= bits;
            return Duration::ZERO;
        }
        let deficit = bits - self.tokens_bits;
        self.tokens_bits = 0.0;
        Duration::from_secs_f64(deficit / self.rate_bps as f64)
    }
}

/// Upload/download token buckets; exceeded transfers block
/// cooperatively instead of failing
pub struct BandwidthThrottle {
    upload: Mutex<Bucket>,
    download: Mutex<Bucket>,
}

impl BandwidthThrottle {
    pub fn new(upload_bps: u64, download_bps: u64) -> Self {
        Self {
            upload: Mutex::new(Bucket::new(upload_bps)),
            download: Mutex::new(Bucket::new(download_bps)),
        }
    }

    /// Acquire upload allowance for `bytes`, sleeping as needed
    pub async fn acquire_upload(&self, bytes: usize) {
        let wait = {
            let mut bucket = self.upload.lock().unwrap_or_else(|e| e.into_inner());
            bucket.reserve(bytes as f64 * 8.0, Instant::now())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Acquire download allowance for `bytes`, sleeping as needed
    pub async fn acquire_download(&self, bytes: usize) {
        let wait = {
            let mut bucket = self.download.lock().unwrap_or_else(|e| e.into_inner());
            bucket.reserve(bytes as f64 * 8.0, Instant::now())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Crawl-request throttle: hourly per-caller quota plus a pending cap
/// per target domain
pub struct CrawlGuard {
    hourly: Mutex<HashMap<Fingerprint, Vec<Instant>>>,
    pending_by_domain: Mutex<HashMap<String, usize>>,
}

impl CrawlGuard {
    pub fn new() -> Self {
        Self {
            hourly: Mutex::new(HashMap::new()),
            pending_by_domain: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a crawl request for `domain` from `caller`
    pub fn admit(&self, caller: Fingerprint, domain: &str) -> Result<CrawlTicket, GuardVerdict> {
        {
            let mut hourly = self.hourly.lock().unwrap_or_else(|e| e.into_inner());
            let window = hourly.entry(caller).or_default();
            let now = Instant::now();
            window.retain(|t| now.duration_since(*t) < Duration::from_secs(3600));
            if window.len() as u32 >= CRAWL_REQUESTS_PER_HOUR {
                return Err(GuardVerdict::Busy);
            }
            window.push(now);
        }

        let mut pending = self
            .pending_by_domain
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let count = pending.entry(domain.to_string()).or_insert(0);
        if *count >= MAX_PENDING_PER_DOMAIN {
            return Err(GuardVerdict::Busy);
        }
        *count += 1;
        Ok(CrawlTicket {
            domain: domain.to_string(),
        })
    }

    /// Release a pending slot once the crawl settles
    pub fn settle(&self, ticket: CrawlTicket) {
        let mut pending = self
            .pending_by_domain
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(count) = pending.get_mut(&ticket.domain) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for CrawlGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks one admitted crawl request until settled
#[derive(Debug)]
pub struct CrawlTicket {
    domain: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    #[test]
    fn test_qpm_quota() {
        let guard = QueryGuard::new(3, 100);
        let caller = Some(fp(1));

        for _ in 0..3 {
            assert!(guard.admit(caller).is_ok());
        }
        assert!(matches!(guard.admit(caller), Err(GuardVerdict::Busy)));
        // Another caller is unaffected
        assert!(guard.admit(Some(fp(2))).is_ok());
    }

    #[test]
    fn test_concurrency_cap() {
        let guard = QueryGuard::new(1000, 2);
        let p1 = guard.admit(None).unwrap();
        let _p2 = guard.admit(None).unwrap();
        assert!(matches!(guard.admit(None), Err(GuardVerdict::Busy)));

        drop(p1);
        assert!(guard.admit(None).is_ok());
    }

    #[test]
    fn test_crawl_guard_hourly_quota() {
        let guard = CrawlGuard::new();
        let caller = fp(3);
        let mut tickets = Vec::new();
        for i in 0..CRAWL_REQUESTS_PER_HOUR {
            let domain = format!("d{i}.example.org");
            tickets.push(guard.admit(caller, &domain).unwrap());
        }
        assert!(matches!(
            guard.admit(caller, "another.example.org"),
            Err(GuardVerdict::Busy)
        ));
    }

    #[test]
    fn test_crawl_guard_domain_pending_cap() {
        let guard = CrawlGuard::new();
        let mut tickets = Vec::new();
        for i in 0..MAX_PENDING_PER_DOMAIN {
            tickets.push(guard.admit(fp(i as u8), "example.org").unwrap());
        }
        assert!(matches!(
            guard.admit(fp(200), "example.org"),
            Err(GuardVerdict::Busy)
        ));

        // Settling frees a slot
        guard.settle(tickets.pop().unwrap());
        assert!(guard.admit(fp(201), "example.org").is_ok());
    }

    #[tokio::test]
    async fn test_bandwidth_bucket_allows_burst_then_waits() {
        let throttle = BandwidthThrottle::new(8_000, 8_000); // 1 KB/s
        let start = Instant::now();
        // Fits in the initial burst capacity
        throttle.acquire_upload(500).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_bucket_reserve_math() {
        let mut bucket = Bucket::new(1000);
        let now = Instant::now();
        assert_eq!(bucket.reserve(400.0, now), Duration::ZERO);
        assert_eq!(bucket.reserve(600.0, now), Duration::ZERO);
        // Bucket drained: the next 500 bits need 0.5 s at 1000 bps
        let wait = bucket.reserve(500.0, now);
        assert!((wait.as_secs_f64() - 0.5).abs() < 0.01);
    }
}
