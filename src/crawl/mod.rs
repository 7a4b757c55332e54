//! Crawl engine and deduplication pipeline
//!
//! URL canonicalization, SSRF defense, robots policy, per-origin
//! politeness, capped streaming fetch, text extraction, three-layer
//! dedup, and the per-URL crawl state machine with attestation and
//! keyword publication.

pub mod canonical;
pub mod dedup;
pub mod engine;
pub mod extract;
pub mod fetch;
pub mod politeness;
pub mod robots;
pub mod simhash;
pub mod ssrf;

pub use canonical::{apply_rel_canonical, canonicalize, origin_of, CanonicalError};
pub use dedup::{DedupError, DedupStore, DedupVerdict};
pub use engine::{
    normalize_for_hash, recrawl_interval_ms, CrawlConfig, CrawlEngine, CrawlError, CrawlOutcome,
    K_TOP_KEYWORDS,
};
pub use extract::{extract, normalize_whitespace, ExtractedContent};
pub use fetch::{build_client, fetch_page, FetchError, FetchedPage, MAX_BODY_BYTES};
pub use politeness::PolitenessGate;
pub use robots::{RobotsCache, RobotsPolicy, RobotsVerdict};
pub use simhash::{hamming_distance, is_near_duplicate, simhash, SimHashIndex, HAMMING_THRESHOLD};
pub use ssrf::{validate_resolved_ip, validate_url, SsrfError};
