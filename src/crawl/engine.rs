//! Crawl engine — the per-URL pipeline
//!
//! State machine per URL:
//!
//! ```text
//! UNASSIGNED → OWNED → LOCKED → FETCHING → PARSING → DEDUP
//!            → INDEXED | REJECTED | FAILED
//! ```
//!
//! Ownership is advisory: a peer owns a URL iff its fingerprint is
//! among the N closest to `H(canonical_url)`. Non-owners only crawl
//! when forced, and never publish pointers for pages they don't own.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::canonical;
use super::dedup::{DedupStore, DedupVerdict};
use super::extract::{self, normalize_whitespace};
use super::fetch::{self, FetchError};
use super::politeness::PolitenessGate;
use super::robots::{RobotsCache, RobotsVerdict};
use super::simhash::simhash;
use crate::credits::{ActionType, CreditLedger};
use crate::crypto::{ContentHash, Envelope, NodeKeys, NonceCounter, PeerIdentity};
use crate::governor::BandwidthThrottle;
use crate::dht::node::now_ms;
use crate::dht::records::{
    CrawlLock, CrawlLockRelease, KeywordPointer, RecordPayload, LOCK_TTL_SECS,
};
use crate::dht::{owns_key, DhtHandle, Key, REPLICATION_FACTOR};
use crate::index::{Document, LinkGraph, LocalIndex};
use crate::trust::attestation::{build_attestation, AttestationCache};
use crate::trust::takedown::TakedownStore;

/// Global crawl concurrency default
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
/// Keyword pointers published per document
pub const K_TOP_KEYWORDS: usize = 32;

/// Recrawl cadence bounds
pub const MIN_RECRAWL_MS: u64 = 3600 * 1000;
pub const MAX_RECRAWL_MS: u64 = 30 * 24 * 3600 * 1000;
/// Base recrawl interval (one day)
pub const BASE_RECRAWL_MS: u64 = 24 * 3600 * 1000;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("DHT unavailable: {0}")]
    Dht(#[from] crate::dht::NodeError),
    #[error("Index error: {0}")]
    Index(#[from] crate::index::IndexError),
    #[error("Dedup error: {0}")]
    Dedup(#[from] super::dedup::DedupError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::credits::LedgerError),
    #[error("Signing failed: {0}")]
    Signing(#[from] crate::crypto::EnvelopeError),
}

/// Terminal result of one crawl attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Document indexed and published
    Indexed { doc_id: u64 },
    /// Canonical URL already in the index
    AlreadyIndexed,
    /// Identical content exists elsewhere; reference only
    DuplicateContent,
    /// Stored but grouped under a near-duplicate; pointers suppressed
    NearDuplicate { doc_id: u64, group_doc: u64 },
    /// This peer is not among the URL's owners
    NotOwned,
    /// Another peer holds a live crawl lock
    LockHeld,
    /// Policy rejection (SSRF, robots, empty extraction, takedown…)
    Rejected { reason: String },
    /// Transient failure after retries; eligible for backoff re-queue
    Failed { reason: String },
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_concurrent: usize,
    pub k_top_keywords: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            k_top_keywords: K_TOP_KEYWORDS,
        }
    }
}

/// Normalization applied to extracted text before hashing.
/// `content_hash = SHA-256(normalized_text)`.
pub fn normalize_for_hash(text: &str) -> String {
    normalize_whitespace(text).to_lowercase()
}

/// Adaptive recrawl interval: base λ scaled down for churning pages and
/// authoritative ones, clamped to [1 h, 30 d].
pub fn recrawl_interval_ms(change_ratio: f64, authority: f64) -> u64 {
    let churn = change_ratio.clamp(0.0, 1.0);
    let auth = authority.clamp(0.0, 1.0);
    let scale = (1.0 - 0.5 * auth) / (0.25 + churn);
    ((BASE_RECRAWL_MS as f64 * scale) as u64).clamp(MIN_RECRAWL_MS, MAX_RECRAWL_MS)
}

/// Rough language tag for indexed text; the stop-word set is only
/// applied to English
fn detect_language(text: &str) -> String {
    let total = text.chars().take(2000).count().max(1);
    let ascii = text
        .chars()
        .take(2000)
        .filter(|c| c.is_ascii())
        .count();
    if ascii * 10 >= total * 9 {
        "en".to_string()
    } else {
        "und".to_string()
    }
}

/// The crawl engine
pub struct CrawlEngine {
    keys: Arc<NodeKeys>,
    identity: PeerIdentity,
    nonces: Arc<Mutex<NonceCounter>>,
    dht: DhtHandle,
    index: Arc<LocalIndex>,
    dedup: Arc<DedupStore>,
    robots: Arc<RobotsCache>,
    politeness: Arc<PolitenessGate>,
    client: reqwest::Client,
    link_graph: Arc<Mutex<LinkGraph>>,
    ledger: Arc<CreditLedger>,
    takedowns: Arc<TakedownStore>,
    attestations: Arc<AttestationCache>,
    throttle: Arc<BandwidthThrottle>,
    concurrency: Arc<Semaphore>,
    config: CrawlConfig,
}

impl CrawlEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Arc<NodeKeys>,
        identity: PeerIdentity,
        nonces: Arc<Mutex<NonceCounter>>,
        dht: DhtHandle,
        index: Arc<LocalIndex>,
        dedup: Arc<DedupStore>,
        client: reqwest::Client,
        link_graph: Arc<Mutex<LinkGraph>>,
        ledger: Arc<CreditLedger>,
        takedowns: Arc<TakedownStore>,
        attestations: Arc<AttestationCache>,
        throttle: Arc<BandwidthThrottle>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            robots: Arc::new(RobotsCache::new(client.clone())),
            politeness: Arc::new(PolitenessGate::new()),
            concurrency: Arc::new(Semaphore::new(config.max_concurrent)),
            keys,
            identity,
            nonces,
            dht,
            index,
            dedup,
            client,
            link_graph,
            ledger,
            takedowns,
            attestations,
            throttle,
            config,
        }
    }

    fn next_nonce(&self) -> u64 {
        self.nonces.lock().unwrap_or_else(|e| e.into_inner()).next()
    }

    /// Sign a record payload into wire-ready envelope bytes
    fn signed_envelope(&self, payload: &RecordPayload) -> Result<Vec<u8>, CrawlError> {
        let envelope = Envelope::sign(
            &self.keys,
            &self.identity,
            self.next_nonce(),
            now_ms(),
            payload.encode(),
        )?;
        Ok(envelope.encode())
    }

    /// Crawl one URL through the full pipeline
    pub async fn crawl_url(&self, raw_url: &str, force: bool) -> Result<CrawlOutcome, CrawlError> {
        // UNASSIGNED: canonicalize first, everything downstream keys on it
        let canonical_url = match canonical::canonicalize(raw_url) {
            Ok(url) => url,
            Err(e) => {
                return Ok(CrawlOutcome::Rejected {
                    reason: e.to_string(),
                })
            }
        };

        if self.takedowns.is_url_blocked(&canonical_url) {
            return Ok(CrawlOutcome::Rejected {
                reason: "url is under a takedown obligation".into(),
            });
        }

        // Dedup layer 1 before any network cost
        if !force && self.dedup.is_url_seen(&canonical_url)? {
            return Ok(CrawlOutcome::AlreadyIndexed);
        }

        // OWNED: advisory ownership by XOR closeness
        let url_key = Key::hash(canonical_url.as_bytes());
        let peers = self.dht.known_peers().await?;
        let is_owner = owns_key(
            &url_key,
            &self.identity.fingerprint(),
            &peers,
            REPLICATION_FACTOR,
        );
        if !is_owner && !force {
            return Ok(CrawlOutcome::NotOwned);
        }

        // Robots: conservative deny
        let parsed = match url::Url::parse(&canonical_url) {
            Ok(u) => u,
            Err(e) => {
                return Ok(CrawlOutcome::Rejected {
                    reason: e.to_string(),
                })
            }
        };
        let crawl_delay = match self.robots.check(&parsed).await {
            RobotsVerdict::Allowed { crawl_delay_secs } => crawl_delay_secs,
            RobotsVerdict::Denied => {
                return Ok(CrawlOutcome::Rejected {
                    reason: "robots.txt denies crawling".into(),
                })
            }
        };

        // LOCKED: take the advisory crawl lock
        if let Some(lock) = self.dht.active_lock(canonical_url.clone()).await? {
            if lock.peer_id != self.identity.fingerprint() {
                debug!(url = %canonical_url, holder = %lock.peer_id, "crawl lock held");
                return Ok(CrawlOutcome::LockHeld);
            }
        }
        let lock_payload = RecordPayload::CrawlLock(CrawlLock {
            peer_id: self.identity.fingerprint(),
            canonical_url: canonical_url.clone(),
            acquired_at_ms: now_ms(),
            ttl_secs: LOCK_TTL_SECS,
        });
        let lock_bytes = self.signed_envelope(&lock_payload)?;
        if !self
            .dht
            .publish(Key::for_lock(&canonical_url), lock_bytes)
            .await?
        {
            return Ok(CrawlOutcome::LockHeld);
        }

        let outcome = self.fetch_and_index(&canonical_url, crawl_delay, is_owner).await;
        self.release_lock(&canonical_url).await?;
        outcome
    }

    async fn fetch_and_index(
        &self,
        canonical_url: &str,
        crawl_delay: Option<u64>,
        is_owner: bool,
    ) -> Result<CrawlOutcome, CrawlError> {
        // FETCHING: politeness, then a bounded-concurrency fetch
        if let Some(origin) = canonical::origin_of(canonical_url) {
            self.politeness.acquire(&origin, crawl_delay).await;
        }

        let _permit = self
            .concurrency
            .acquire()
            .await
            .expect("crawl semaphore closed");

        let page = match fetch::fetch_page(&self.client, canonical_url).await {
            Ok(page) => page,
            Err(e @ (FetchError::Ssrf(_) | FetchError::Refused(_) | FetchError::UnsupportedContent(_))) => {
                return Ok(CrawlOutcome::Rejected {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                return Ok(CrawlOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };
        drop(_permit);

        // Bandwidth accounting: the fetched body draws down the
        // download bucket, pacing subsequent fetches
        self.throttle.acquire_download(page.body.len()).await;

        let raw_hash = ContentHash::from_data(&page.body);

        // PARSING: extraction is CPU-bound, keep it off the runtime
        let body_text = String::from_utf8_lossy(&page.body).into_owned();
        let content_type = page.content_type.clone();
        let final_url = page.final_url.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract::extract(&body_text, &content_type, &final_url)
        })
        .await
        .unwrap_or_default();

        if extracted.is_empty() {
            return Ok(CrawlOutcome::Rejected {
                reason: "extractor produced no text".into(),
            });
        }

        // A same-origin rel=canonical hint may rename the document
        let canonical_url = match &extracted.canonical_hint {
            Some(hint) => canonical::apply_rel_canonical(canonical_url, hint),
            None => canonical_url.to_string(),
        };

        if self.takedowns.is_url_blocked(&canonical_url) {
            return Ok(CrawlOutcome::Rejected {
                reason: "canonical target is under a takedown obligation".into(),
            });
        }

        // DEDUP: exact, then near
        let normalized = normalize_for_hash(&extracted.text);
        let content_hash = ContentHash::from_text(&normalized);

        if self.takedowns.is_hash_blocked(&content_hash) {
            return Ok(CrawlOutcome::Rejected {
                reason: "content hash is under a takedown obligation".into(),
            });
        }

        let text_for_simhash = normalized.clone();
        let fingerprint = tokio::task::spawn_blocking(move || simhash(&text_for_simhash))
            .await
            .unwrap_or(0);

        // Exact dedup also consults recent remote attestations
        let now = now_ms();
        let verdict = self.dedup.check_content(&content_hash, fingerprint)?;
        if matches!(verdict, DedupVerdict::Fresh)
            && self.attestations.contains(&content_hash, now)
        {
            debug!(url = %canonical_url, "content already attested remotely");
            return Ok(CrawlOutcome::DuplicateContent);
        }

        match verdict {
            DedupVerdict::AlreadyIndexedUrl => Ok(CrawlOutcome::AlreadyIndexed),
            DedupVerdict::ExactDuplicate { .. } => Ok(CrawlOutcome::DuplicateContent),
            DedupVerdict::NearDuplicate { group_doc } => {
                let doc_id = self
                    .store_document(
                        &canonical_url,
                        &extracted.title,
                        &extracted.text,
                        raw_hash,
                        content_hash,
                        fingerprint,
                        &extracted.out_links,
                        now,
                    )
                    .await?;
                info!(url = %canonical_url, doc_id, group_doc, "near-duplicate stored, pointers suppressed");
                Ok(CrawlOutcome::NearDuplicate { doc_id, group_doc })
            }
            DedupVerdict::Fresh => {
                let doc_id = self
                    .store_document(
                        &canonical_url,
                        &extracted.title,
                        &extracted.text,
                        raw_hash,
                        content_hash,
                        fingerprint,
                        &extracted.out_links,
                        now,
                    )
                    .await?;

                if is_owner {
                    self.publish_keywords(doc_id, &extracted.text, content_hash, now)
                        .await?;
                } else {
                    debug!(url = %canonical_url, "forced crawl by non-owner, pointers withheld");
                }

                self.ledger
                    .record_action(ActionType::Crawl, 1.0, 1.0, &canonical_url, now)?;
                info!(url = %canonical_url, doc_id, "document indexed");
                Ok(CrawlOutcome::Indexed { doc_id })
            }
        }
    }

    /// INDEXED: write the document, attest it, feed the link graph
    #[allow(clippy::too_many_arguments)]
    async fn store_document(
        &self,
        canonical_url: &str,
        title: &str,
        text: &str,
        raw_hash: ContentHash,
        content_hash: ContentHash,
        fingerprint: u64,
        out_links: &[String],
        now: u64,
    ) -> Result<u64, CrawlError> {
        // Re-crawls replace the existing document in place
        let doc_id = match self.index.get_by_url(canonical_url) {
            Ok(Some(existing)) => existing.doc_id,
            _ => self.index.next_doc_id()?,
        };
        let doc = Document {
            doc_id,
            canonical_url: canonical_url.to_string(),
            content_hash,
            raw_hash,
            title: title.to_string(),
            text: text.to_string(),
            language: detect_language(text),
            crawl_time_ms: now,
            simhash: fingerprint,
            authority_score: 0.0,
            link_out: out_links.to_vec(),
        };
        self.index.upsert(&doc)?;
        self.dedup
            .mark_indexed(canonical_url, content_hash, fingerprint, doc_id, now)?;

        {
            let mut graph = self.link_graph.lock().unwrap_or_else(|e| e.into_inner());
            let canonical_links: Vec<String> = out_links
                .iter()
                .filter_map(|l| canonical::canonicalize(l).ok())
                .collect();
            graph.record_page(canonical_url, &canonical_links);
        }

        // Attestation: exactly one per (peer, url) per crawl
        let (attestation, envelope) = build_attestation(
            &self.keys,
            &self.identity,
            self.next_nonce(),
            canonical_url,
            raw_hash,
            content_hash,
            now,
        )?;
        self.attestations.insert(&attestation);
        self.dht
            .publish(Key::for_attestation(canonical_url), envelope.encode())
            .await?;

        Ok(doc_id)
    }

    /// Publish keyword pointers for the top tf-idf terms
    async fn publish_keywords(
        &self,
        doc_id: u64,
        text: &str,
        content_hash: ContentHash,
        now: u64,
    ) -> Result<(), CrawlError> {
        let keywords = self.index.top_keywords(text, self.config.k_top_keywords)?;
        let max_weight = keywords.first().map(|(_, w)| *w).unwrap_or(1.0).max(1e-9);

        for (term, weight) in keywords {
            let pointer = RecordPayload::KeywordPointer(KeywordPointer {
                peer_id: self.identity.fingerprint(),
                doc_id,
                relevance_ppm: KeywordPointer::from_relevance(weight / max_weight),
                content_hash,
                published_at_ms: now,
            });
            let bytes = self.signed_envelope(&pointer)?;
            if let Err(e) = self.dht.publish(Key::for_keyword(&term), bytes).await {
                warn!(term = %term, error = %e, "keyword pointer publish failed");
            }
        }
        Ok(())
    }

    async fn release_lock(&self, canonical_url: &str) -> Result<(), CrawlError> {
        let release = RecordPayload::CrawlLockRelease(CrawlLockRelease {
            peer_id: self.identity.fingerprint(),
            canonical_url: canonical_url.to_string(),
            released_at_ms: now_ms(),
        });
        let bytes = self.signed_envelope(&release)?;
        self.dht
            .publish(Key::for_lock(canonical_url), bytes)
            .await?;
        Ok(())
    }

    /// Periodic maintenance: forget idle politeness origins
    pub fn prune(&self) {
        self.politeness.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_for_hash_matches_expectation() {
        // The canonical first-crawl scenario
        let text = "The quick brown fox jumps over the lazy dog.";
        let normalized = normalize_for_hash(text);
        assert_eq!(normalized, "the quick brown fox jumps over the lazy dog.");
        assert_eq!(
            ContentHash::from_text(&normalized),
            ContentHash::from_text("the quick brown fox jumps over the lazy dog.")
        );
    }

    #[test]
    fn test_recrawl_interval_bounds() {
        // A dead page with no authority sits near the cap
        assert_eq!(recrawl_interval_ms(0.0, 0.0), MAX_RECRAWL_MS.min(4 * BASE_RECRAWL_MS));
        // A churning authoritative page recrawls fast but never under 1 h
        assert!(recrawl_interval_ms(1.0, 1.0) >= MIN_RECRAWL_MS);
        // Monotone: more churn, shorter interval
        assert!(recrawl_interval_ms(0.9, 0.0) < recrawl_interval_ms(0.1, 0.0));
        // More authority, shorter interval
        assert!(recrawl_interval_ms(0.5, 1.0) < recrawl_interval_ms(0.5, 0.0));
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(detect_language("plain english text here"), "en");
        assert_eq!(detect_language("текст на русском языке без ascii"), "und");
    }
}
