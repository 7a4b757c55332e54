//! Distributed search orchestrator
//!
//! Local-first: the local index probe and the remote fan-out run
//! concurrently, results are merged, verified, re-ranked, charged to
//! the credit ledger, and cached. Raw query text never crosses the
//! network — responders see keyword key hashes only.
//!
//! Deadlines: each fan-out RPC gets its own deadline (default 2 s)
//! under a global query deadline (default 5 s). Partial results are
//! acceptable and flagged.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::cache::QueryCache;
use super::query::{self, ParsedQuery};
use crate::credits::{CreditLedger, SearchCharge};
use crate::crypto::{Envelope, Fingerprint};
use crate::dht::node::now_ms;
use crate::dht::records::RecordPayload;
use crate::dht::{DhtHandle, DocMetaEntry, PeerStore, RpcResponse};
use crate::governor::Governor;
use crate::index::ranking::tier_value;
use crate::index::{fuse_vector_ranks, make_snippet, rank, Candidate, LocalIndex, RankedResult, VectorRegistry};
use crate::trust::{AttestationCache, TrustStore, TrustTier};
use crate::trust::takedown::TakedownStore;

/// Default responders queried per search
pub const DEFAULT_FANOUT: usize = 3;
/// Per-RPC deadline
pub const RPC_DEADLINE: Duration = Duration::from_secs(2);
/// Global query deadline
pub const QUERY_DEADLINE: Duration = Duration::from_secs(5);
/// Local probe over-fetch factor
const LOCAL_PROBE_FACTOR: usize = 4;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub fanout: usize,
    pub rpc_deadline: Duration,
    pub query_deadline: Duration,
    pub pow_difficulty: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            rpc_deadline: RPC_DEADLINE,
            query_deadline: QUERY_DEADLINE,
            pow_difficulty: crate::crypto::DEFAULT_POW_DIFFICULTY,
        }
    }
}

/// A completed search
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<RankedResult>,
    /// Some responders were missing, busy, or timed out
    pub partial: bool,
    pub from_cache: bool,
    pub charge: Option<SearchCharge>,
    pub elapsed_ms: u64,
}

/// The orchestrator
pub struct SearchOrchestrator {
    own_peer: Fingerprint,
    index: Arc<LocalIndex>,
    dht: DhtHandle,
    trust: Arc<TrustStore>,
    attestations: Arc<AttestationCache>,
    takedowns: Arc<TakedownStore>,
    peer_store: Arc<PeerStore>,
    ledger: Arc<CreditLedger>,
    governor: Arc<Governor>,
    vector: VectorRegistry,
    cache: QueryCache,
    /// Link-graph authority per canonical URL, refreshed by the node's
    /// maintenance loop
    authority: Arc<std::sync::Mutex<std::collections::HashMap<String, f64>>>,
    config: SearchConfig,
}

impl SearchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_peer: Fingerprint,
        index: Arc<LocalIndex>,
        dht: DhtHandle,
        trust: Arc<TrustStore>,
        attestations: Arc<AttestationCache>,
        takedowns: Arc<TakedownStore>,
        peer_store: Arc<PeerStore>,
        ledger: Arc<CreditLedger>,
        governor: Arc<Governor>,
        vector: VectorRegistry,
        authority: Arc<std::sync::Mutex<std::collections::HashMap<String, f64>>>,
        config: SearchConfig,
    ) -> Self {
        Self {
            own_peer,
            index,
            dht,
            trust,
            attestations,
            takedowns,
            peer_store,
            ledger,
            governor,
            vector,
            cache: QueryCache::new(),
            authority,
            config,
        }
    }

    /// `search(query, limit, local_only) → RankedList`
    pub async fn search(
        &self,
        raw_query: &str,
        limit: usize,
        local_only: bool,
    ) -> SearchResponse {
        let started = Instant::now();
        let parsed = query::parse(raw_query);

        // Cache first; hits return the previously computed list as-is
        if let Some(results) = self.cache.get(&parsed.fingerprint) {
            debug!(qfp = %parsed.fingerprint.short(), "cache hit");
            return SearchResponse {
                results,
                partial: false,
                from_cache: true,
                charge: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }

        // Degradation level 2+ forces local-only search
        let fanout_allowed = self.governor.level().allows_fanout();
        let go_remote = !local_only && fanout_allowed && !parsed.terms.is_empty();

        // Local probe and remote fan-out run concurrently
        let local_task = self.local_probe(&parsed, limit * LOCAL_PROBE_FACTOR);
        let remote_task = async {
            if go_remote {
                match tokio::time::timeout(
                    self.config.query_deadline,
                    self.fan_out(&parsed, limit),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(qfp = %parsed.fingerprint.short(), "query deadline hit");
                        (Vec::new(), true)
                    }
                }
            } else {
                (Vec::new(), false)
            }
        };
        let (local_candidates, (remote_candidates, partial)) =
            tokio::join!(local_task, remote_task);

        // Merge, dedup by content identity, re-rank
        let mut candidates = local_candidates;
        candidates.extend(remote_candidates);
        dedup_by_url(&mut candidates);

        let mut results = rank(candidates, limit, now_ms());
        if self.vector.is_available() {
            let vector_ranked = self.vector.search(&parsed.normalized, limit * 2);
            fuse_vector_ranks(&mut results, &vector_ranked);
            results.truncate(limit);
        }

        // Charge the ledger; search is never refused over credits
        let charge = match self.ledger.charge_search(now_ms()) {
            Ok(charge) => Some(charge),
            Err(e) => {
                warn!(error = %e, "search charge failed");
                None
            }
        };

        self.cache.put(parsed.fingerprint, results.clone());
        info!(
            qfp = %parsed.fingerprint.short(),
            results = results.len(),
            partial,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search completed"
        );

        SearchResponse {
            results,
            partial,
            from_cache: false,
            charge,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// BM25 probe of the local index (blocking sled I/O off the runtime)
    async fn local_probe(&self, parsed: &ParsedQuery, limit: usize) -> Vec<Candidate> {
        let index = Arc::clone(&self.index);
        let takedowns = Arc::clone(&self.takedowns);
        let authority = Arc::clone(&self.authority);
        let terms = parsed.terms.clone();

        tokio::task::spawn_blocking(move || {
            let hits = match index.search_keywords(&terms, limit) {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "local probe failed");
                    return Vec::new();
                }
            };
            let authority = authority.lock().unwrap_or_else(|e| e.into_inner());
            hits.into_iter()
                .filter_map(|hit| {
                    let doc = index.get_doc(hit.doc_id).ok()?;
                    if takedowns.is_hash_blocked(&doc.content_hash)
                        || takedowns.is_url_blocked(&doc.canonical_url)
                    {
                        return None;
                    }
                    let auth = authority
                        .get(&doc.canonical_url)
                        .copied()
                        .unwrap_or(doc.authority_score);
                    Some(Candidate {
                        doc_id: doc.doc_id,
                        snippet: make_snippet(&doc.text, &terms, 240),
                        url: doc.canonical_url,
                        title: doc.title,
                        bm25_raw: hit.bm25_score,
                        crawl_time_ms: doc.crawl_time_ms,
                        authority: auth,
                        tier: TrustTier::Trusted,
                        peer: None,
                        unverified: false,
                    })
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    /// Pick the top-F responders by latency-weighted trust
    fn select_responders(&self) -> Vec<Fingerprint> {
        let now = now_ms();
        let profiles = self.peer_store.all().unwrap_or_default();
        let mut scored: Vec<(f64, Fingerprint)> = profiles
            .into_iter()
            .filter_map(|profile| {
                let peer = profile.identity.fingerprint();
                if peer == self.own_peer {
                    return None;
                }
                let tier = self.trust.tier(&peer, now);
                // Only Normal-and-above responders are queried
                if tier < TrustTier::Normal || self.trust.is_isolated(&peer) {
                    return None;
                }
                let latency_penalty = 1.0 + profile.latency_ema_ms.max(0.0) / 100.0;
                Some((tier_value(tier) / latency_penalty, peer))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(self.config.fanout)
            .map(|(_, peer)| peer)
            .collect()
    }

    /// Query remote responders; returns (candidates, partial)
    async fn fan_out(&self, parsed: &ParsedQuery, limit: usize) -> (Vec<Candidate>, bool) {
        let responders = self.select_responders();
        if responders.is_empty() {
            return (Vec::new(), false);
        }

        let keyword_keys = parsed.keyword_keys();
        let mut partial = false;
        let mut candidates = Vec::new();

        let lookups = responders.iter().map(|peer| {
            let dht = self.dht.clone();
            let keys = keyword_keys.clone();
            let peer = *peer;
            let deadline = self.config.rpc_deadline;
            async move {
                let result = tokio::time::timeout(
                    deadline,
                    dht.keyword_lookup(peer, keys, (limit * LOCAL_PROBE_FACTOR) as u32),
                )
                .await;
                (peer, result)
            }
        });

        for (peer, outcome) in futures::future::join_all(lookups).await {
            match outcome {
                Ok(Ok(RpcResponse::Pointers { envelopes, partial: responder_partial })) => {
                    if responder_partial {
                        partial = true;
                    }
                    let verified = self.verify_pointers(peer, envelopes).await;
                    candidates.extend(verified);
                }
                Ok(Ok(RpcResponse::Busy)) => {
                    debug!(peer = %peer, "responder busy");
                    partial = true;
                }
                Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                    debug!(peer = %peer, "responder failed or timed out");
                    partial = true;
                }
            }
        }

        (candidates, partial)
    }

    /// Verify pointer envelopes from one responder and resolve their
    /// display metadata
    async fn verify_pointers(
        &self,
        responder: Fingerprint,
        envelopes: Vec<Vec<u8>>,
    ) -> Vec<Candidate> {
        let now = now_ms();
        let mut pointers = Vec::new();

        for bytes in envelopes {
            let Ok(envelope) = Envelope::decode(&bytes) else {
                continue;
            };
            // Origin must be a known, verifiable identity
            let Ok(Some(profile)) = self.peer_store.get(&envelope.peer_id) else {
                continue;
            };
            if envelope
                .verify(&profile.identity, self.config.pow_difficulty, now)
                .is_err()
            {
                debug!(origin = %envelope.peer_id, "pointer signature rejected");
                continue;
            }
            let Ok(RecordPayload::KeywordPointer(pointer)) =
                RecordPayload::decode(&envelope.payload)
            else {
                continue;
            };
            if self.trust.is_isolated(&pointer.peer_id) {
                continue;
            }
            if self.takedowns.is_hash_blocked(&pointer.content_hash) {
                continue;
            }
            // Only the responder's own documents can be resolved to
            // metadata in the follow-up call
            if pointer.peer_id != responder {
                continue;
            }
            pointers.push(pointer);
        }

        if pointers.is_empty() {
            return Vec::new();
        }

        let doc_ids: Vec<u64> = pointers.iter().map(|p| p.doc_id).collect();
        let metas = match tokio::time::timeout(
            self.config.rpc_deadline,
            self.dht.doc_meta(responder, doc_ids),
        )
        .await
        {
            Ok(Ok(RpcResponse::DocMetas { docs })) => docs,
            _ => Vec::new(),
        };

        let tier = self.trust.tier(&responder, now);
        pointers
            .into_iter()
            .filter_map(|pointer| {
                let meta: &DocMetaEntry =
                    metas.iter().find(|m| m.doc_id == pointer.doc_id)?;
                if meta.content_hash != pointer.content_hash {
                    return None;
                }
                if self.takedowns.is_url_blocked(&meta.url) {
                    return None;
                }
                // Tolerated-unknown: kept, but down-weighted
                let unverified = !self.attestations.contains(&pointer.content_hash, now);
                Some(Candidate {
                    doc_id: pointer.doc_id,
                    url: meta.url.clone(),
                    title: meta.title.clone(),
                    snippet: meta.snippet.clone(),
                    bm25_raw: pointer.relevance(),
                    crawl_time_ms: meta.crawl_time_ms,
                    authority: 0.0,
                    tier,
                    peer: Some(responder),
                    unverified,
                })
            })
            .collect()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }
}

/// Collapse candidates sharing a canonical URL, keeping the best source
fn dedup_by_url(candidates: &mut Vec<Candidate>) {
    use std::collections::HashMap;
    let mut best: HashMap<String, usize> = HashMap::new();
    let mut keep = vec![true; candidates.len()];

    for (i, candidate) in candidates.iter().enumerate() {
        match best.get(&candidate.url) {
            Some(&prev) => {
                let previous = &candidates[prev];
                // Prefer verified, then higher relevance
                let replace = (previous.unverified && !candidate.unverified)
                    || (previous.unverified == candidate.unverified
                        && candidate.bm25_raw > previous.bm25_raw);
                if replace {
                    keep[prev] = false;
                    best.insert(candidate.url.clone(), i);
                } else {
                    keep[i] = false;
                }
            }
            None => {
                best.insert(candidate.url.clone(), i);
            }
        }
    }

    let mut index = 0;
    candidates.retain(|_| {
        let kept = keep[index];
        index += 1;
        kept
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str, bm25: f64, unverified: bool) -> Candidate {
        Candidate {
            doc_id: 1,
            url: url.to_string(),
            title: String::new(),
            snippet: String::new(),
            bm25_raw: bm25,
            crawl_time_ms: 0,
            authority: 0.0,
            tier: TrustTier::Normal,
            peer: None,
            unverified,
        }
    }

    #[test]
    fn test_dedup_by_url_keeps_best() {
        let mut candidates = vec![
            candidate("https://a.org/x", 0.5, false),
            candidate("https://a.org/x", 0.9, false),
            candidate("https://a.org/y", 0.1, false),
        ];
        dedup_by_url(&mut candidates);
        assert_eq!(candidates.len(), 2);
        let x = candidates
            .iter()
            .find(|c| c.url == "https://a.org/x")
            .unwrap();
        assert!((x.bm25_raw - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_dedup_prefers_verified() {
        let mut candidates = vec![
            candidate("https://a.org/x", 0.9, true),
            candidate("https://a.org/x", 0.2, false),
        ];
        dedup_by_url(&mut candidates);
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].unverified);
    }
}
