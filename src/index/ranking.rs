//! Composite result ranking
//!
//! Final score per candidate for a query:
//!
//! ```text
//! score = 0.55·bm25_norm + 0.20·freshness + 0.15·trust + 0.10·authority
//! ```
//!
//! `bm25_norm` is per-query min-max normalized; `freshness` decays as
//! `exp(−age_days / 30)`; `trust` is the source peer's tier-mapped
//! value; `authority` comes from the link graph. Ties break toward the
//! newer crawl, then the lower doc id. When a vector backend is
//! registered, a reciprocal-rank fusion pass (weight 0.3) runs after
//! the linear blend.

use crate::crypto::Fingerprint;
use crate::trust::score::TrustTier;

pub const WEIGHT_BM25: f64 = 0.55;
pub const WEIGHT_FRESHNESS: f64 = 0.20;
pub const WEIGHT_TRUST: f64 = 0.15;
pub const WEIGHT_AUTHORITY: f64 = 0.10;

/// Freshness decay constant, in days
pub const FRESHNESS_TAU_DAYS: f64 = 30.0;

/// RRF weight applied on the vector rank
pub const VECTOR_FUSION_WEIGHT: f64 = 0.3;
/// Standard RRF rank offset
const RRF_K: f64 = 60.0;

/// An unranked candidate from the local index or a remote responder
#[derive(Debug, Clone)]
pub struct Candidate {
    pub doc_id: u64,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub bm25_raw: f64,
    pub crawl_time_ms: u64,
    pub authority: f64,
    pub tier: TrustTier,
    pub peer: Option<Fingerprint>,
    /// Down-weighted when the content hash could not be matched to a
    /// known attestation
    pub unverified: bool,
}

/// A ranked result with its score breakdown
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub doc_id: u64,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub bm25_score: f64,
    pub freshness_score: f64,
    pub trust_score: f64,
    pub authority_score: f64,
    pub combined_score: f64,
    pub crawl_time_ms: u64,
    pub peer: Option<Fingerprint>,
}

/// Tier-mapped trust value for ranking
pub fn tier_value(tier: TrustTier) -> f64 {
    match tier {
        TrustTier::Trusted => 1.0,
        TrustTier::Normal => 0.75,
        TrustTier::Suspect => 0.4,
        TrustTier::Untrusted => 0.0,
    }
}

/// Exponential freshness decay
pub fn freshness(crawl_time_ms: u64, now_ms: u64) -> f64 {
    let age_days = now_ms.saturating_sub(crawl_time_ms) as f64 / (24.0 * 3600.0 * 1000.0);
    (-age_days / FRESHNESS_TAU_DAYS).exp()
}

/// Penalty multiplier for results whose content hash is unverified
const UNVERIFIED_FACTOR: f64 = 0.8;

/// Rank candidates and return the top `limit`
pub fn rank(candidates: Vec<Candidate>, limit: usize, now_ms: u64) -> Vec<RankedResult> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let raw: Vec<f64> = candidates.iter().map(|c| c.bm25_raw).collect();
    let normalized = super::bm25::normalize(&raw);

    let mut results: Vec<RankedResult> = candidates
        .into_iter()
        .zip(normalized)
        .map(|(c, bm25_norm)| {
            let fresh = freshness(c.crawl_time_ms, now_ms);
            let trust = tier_value(c.tier);
            let mut combined = WEIGHT_BM25 * bm25_norm
                + WEIGHT_FRESHNESS * fresh
                + WEIGHT_TRUST * trust
                + WEIGHT_AUTHORITY * c.authority;
            if c.unverified {
                combined *= UNVERIFIED_FACTOR;
            }
            RankedResult {
                doc_id: c.doc_id,
                url: c.url,
                title: c.title,
                snippet: c.snippet,
                bm25_score: bm25_norm,
                freshness_score: fresh,
                trust_score: trust,
                authority_score: c.authority,
                combined_score: combined,
                crawl_time_ms: c.crawl_time_ms,
                peer: c.peer,
            }
        })
        .collect();

    sort_ranked(&mut results);
    results.truncate(limit);
    results
}

/// Apply the vector fusion pass: each doc present in `vector_ranked`
/// (best first) gains `0.3 · 1/(60 + rank)` on its combined score.
pub fn fuse_vector_ranks(results: &mut Vec<RankedResult>, vector_ranked: &[u64]) {
    if vector_ranked.is_empty() {
        return;
    }
    for result in results.iter_mut() {
        if let Some(rank) = vector_ranked.iter().position(|id| *id == result.doc_id) {
            result.combined_score += VECTOR_FUSION_WEIGHT / (RRF_K + rank as f64 + 1.0);
        }
    }
    sort_ranked(results);
}

fn sort_ranked(results: &mut [RankedResult]) {
    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.crawl_time_ms.cmp(&a.crawl_time_ms))
            .then(a.doc_id.cmp(&b.doc_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(doc_id: u64, bm25: f64, crawled: u64, tier: TrustTier) -> Candidate {
        Candidate {
            doc_id,
            url: format!("https://example.org/{doc_id}"),
            title: String::new(),
            snippet: String::new(),
            bm25_raw: bm25,
            crawl_time_ms: crawled,
            authority: 0.0,
            tier,
            peer: None,
            unverified: false,
        }
    }

    const DAY_MS: u64 = 24 * 3600 * 1000;

    #[test]
    fn test_relevance_dominates() {
        let now = 100 * DAY_MS;
        let results = rank(
            vec![
                candidate(1, 10.0, now, TrustTier::Normal),
                candidate(2, 1.0, now, TrustTier::Normal),
            ],
            10,
            now,
        );
        assert_eq!(results[0].doc_id, 1);
    }

    #[test]
    fn test_freshness_decay() {
        let now = 1000 * DAY_MS;
        assert!((freshness(now, now) - 1.0).abs() < 1e-9);
        let month_old = freshness(now - 30 * DAY_MS, now);
        assert!((month_old - (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_trust_tier_breaks_near_ties() {
        let now = 10 * DAY_MS;
        let results = rank(
            vec![
                candidate(1, 5.0, now, TrustTier::Untrusted),
                candidate(2, 5.0, now, TrustTier::Trusted),
            ],
            10,
            now,
        );
        assert_eq!(results[0].doc_id, 2);
    }

    #[test]
    fn test_tie_breaks_newer_then_lower_id() {
        let now = 10 * DAY_MS;
        let results = rank(
            vec![
                candidate(5, 5.0, now, TrustTier::Normal),
                candidate(3, 5.0, now, TrustTier::Normal),
                candidate(4, 5.0, now - DAY_MS, TrustTier::Normal),
            ],
            10,
            now,
        );
        // Same score, same crawl time: lower id first; older crawl last
        assert_eq!(
            results.iter().map(|r| r.doc_id).collect::<Vec<_>>(),
            vec![3, 5, 4]
        );
    }

    #[test]
    fn test_unverified_penalized() {
        let now = 10 * DAY_MS;
        let mut verified = candidate(1, 5.0, now, TrustTier::Normal);
        let mut unverified = candidate(2, 5.0, now, TrustTier::Normal);
        verified.unverified = false;
        unverified.unverified = true;

        let results = rank(vec![unverified, verified], 10, now);
        assert_eq!(results[0].doc_id, 1);
    }

    #[test]
    fn test_vector_fusion_lifts_ranked_docs() {
        let now = 10 * DAY_MS;
        let mut results = rank(
            vec![
                candidate(1, 5.0, now, TrustTier::Normal),
                candidate(2, 4.9, now, TrustTier::Normal),
            ],
            10,
            now,
        );
        let before_top = results[0].doc_id;
        assert_eq!(before_top, 1);

        // Vector side strongly prefers doc 2
        fuse_vector_ranks(&mut results, &[2]);
        assert_eq!(results[0].doc_id, 2);
    }

    #[test]
    fn test_empty_fusion_is_noop() {
        let now = 10 * DAY_MS;
        let mut results = rank(vec![candidate(1, 5.0, now, TrustTier::Normal)], 10, now);
        let score = results[0].combined_score;
        fuse_vector_ranks(&mut results, &[]);
        assert!((results[0].combined_score - score).abs() < 1e-12);
    }

    #[test]
    fn test_limit_respected() {
        let now = 10 * DAY_MS;
        let candidates = (0..20)
            .map(|i| candidate(i, i as f64, now, TrustTier::Normal))
            .collect();
        assert_eq!(rank(candidates, 5, now).len(), 5);
    }
}
