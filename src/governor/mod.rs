//! Resource governor and load guard
//!
//! Operating profiles, the dynamic degradation-level monitor, and
//! admission control (QPM, concurrency, bandwidth token buckets,
//! crawl-request throttles).

pub mod load_guard;
pub mod monitor;
pub mod profiles;

pub use load_guard::{
    BandwidthThrottle, CrawlGuard, CrawlTicket, GuardVerdict, QueryGuard, QueryPermit,
    CRAWL_REQUESTS_PER_HOUR, MAX_PENDING_PER_DOMAIN,
};
pub use monitor::{classify, DegradationLevel, Governor, LevelTracker, ResourceSample, HYSTERESIS};
pub use profiles::{Profile, ProfileLimits, UnknownProfile};
