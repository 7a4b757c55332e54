//! Content attestations
//!
//! After indexing a page, a peer signs a claim binding (url, raw_hash,
//! content_hash, crawl_time). Attestations are what audits re-check and
//! what search verification consults before trusting a remote result.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::crypto::{ContentHash, Envelope, EnvelopeError, Fingerprint, NodeKeys, PeerIdentity};
use crate::dht::records::{ContentAttestation, RecordPayload, ATTESTATION_TTL_MS};

/// Build a signed attestation envelope ready for DHT publication
pub fn build_attestation(
    keys: &NodeKeys,
    identity: &PeerIdentity,
    nonce: u64,
    canonical_url: &str,
    raw_hash: ContentHash,
    content_hash: ContentHash,
    crawl_time_ms: u64,
) -> Result<(ContentAttestation, Envelope), EnvelopeError> {
    let attestation = ContentAttestation {
        peer_id: identity.fingerprint(),
        canonical_url: canonical_url.to_string(),
        raw_hash,
        content_hash,
        crawl_time_ms,
    };
    let payload = RecordPayload::ContentAttestation(attestation.clone()).encode();
    let envelope = Envelope::sign(keys, identity, nonce, crawl_time_ms, payload)?;
    Ok((attestation, envelope))
}

/// Cache of recently observed attestations, keyed by content hash.
///
/// Search verification accepts a remote result outright when its
/// claimed content hash appears here; otherwise the result is kept but
/// down-weighted as tolerated-unknown.
#[derive(Debug, Default)]
pub struct AttestationCache {
    by_hash: Mutex<HashMap<ContentHash, CachedAttestation>>,
}

#[derive(Debug, Clone)]
struct CachedAttestation {
    peer: Fingerprint,
    canonical_url: String,
    crawl_time_ms: u64,
}

impl AttestationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, attestation: &ContentAttestation) {
        let mut map = self.by_hash.lock().unwrap_or_else(|e| e.into_inner());
        let entry = CachedAttestation {
            peer: attestation.peer_id,
            canonical_url: attestation.canonical_url.clone(),
            crawl_time_ms: attestation.crawl_time_ms,
        };
        // Keep the newest attestation per content hash
        match map.get(&attestation.content_hash) {
            Some(existing) if existing.crawl_time_ms >= entry.crawl_time_ms => {}
            _ => {
                map.insert(attestation.content_hash, entry);
            }
        }
    }

    /// Whether a fresh attestation for this hash is known
    pub fn contains(&self, content_hash: &ContentHash, now_ms: u64) -> bool {
        let map = self.by_hash.lock().unwrap_or_else(|e| e.into_inner());
        map.get(content_hash)
            .map(|a| now_ms.saturating_sub(a.crawl_time_ms) <= ATTESTATION_TTL_MS)
            .unwrap_or(false)
    }

    /// The attesting peer for a hash, if cached and fresh
    pub fn attester(&self, content_hash: &ContentHash, now_ms: u64) -> Option<Fingerprint> {
        let map = self.by_hash.lock().unwrap_or_else(|e| e.into_inner());
        map.get(content_hash).and_then(|a| {
            (now_ms.saturating_sub(a.crawl_time_ms) <= ATTESTATION_TTL_MS).then_some(a.peer)
        })
    }

    /// Drop attestations past their TTL
    pub fn sweep(&self, now_ms: u64) {
        let mut map = self.by_hash.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, a| now_ms.saturating_sub(a.crawl_time_ms) <= ATTESTATION_TTL_MS);
    }

    /// Fresh attestations as audit candidates
    pub fn audit_targets(&self, now_ms: u64) -> Vec<super::audit::AuditTarget> {
        let map = self.by_hash.lock().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter(|(_, a)| now_ms.saturating_sub(a.crawl_time_ms) <= ATTESTATION_TTL_MS)
            .map(|(hash, a)| super::audit::AuditTarget {
                peer: a.peer,
                canonical_url: a.canonical_url.clone(),
                attested_hash: *hash,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_hash.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(n: u8) -> (NodeKeys, PeerIdentity) {
        let keys = NodeKeys::from_secret_bytes([n; 32]).unwrap();
        let identity = PeerIdentity::mine(keys.public_key_bytes(), 8, 0);
        (keys, identity)
    }

    #[test]
    fn test_build_and_verify_attestation() {
        let (keys, identity) = test_identity(1);
        let (attestation, envelope) = build_attestation(
            &keys,
            &identity,
            1,
            "https://example.org/page",
            ContentHash::from_text("raw"),
            ContentHash::from_text("content"),
            5000,
        )
        .unwrap();

        assert_eq!(attestation.peer_id, identity.fingerprint());
        assert!(envelope.verify(&identity, 8, 5000).is_ok());

        // The envelope payload decodes back to the same attestation
        let decoded = RecordPayload::decode(&envelope.payload).unwrap();
        assert_eq!(decoded, RecordPayload::ContentAttestation(attestation));
    }

    #[test]
    fn test_cache_hit_and_ttl() {
        let (_, identity) = test_identity(2);
        let cache = AttestationCache::new();
        let hash = ContentHash::from_text("body");

        let attestation = ContentAttestation {
            peer_id: identity.fingerprint(),
            canonical_url: "https://example.org".into(),
            raw_hash: hash,
            content_hash: hash,
            crawl_time_ms: 1000,
        };
        cache.insert(&attestation);

        assert!(cache.contains(&hash, 2000));
        assert_eq!(cache.attester(&hash, 2000), Some(identity.fingerprint()));

        // Stale after the 7-day TTL
        let later = 1000 + ATTESTATION_TTL_MS + 1;
        assert!(!cache.contains(&hash, later));
    }

    #[test]
    fn test_cache_keeps_newest() {
        let (_, a) = test_identity(3);
        let (_, b) = test_identity(4);
        let cache = AttestationCache::new();
        let hash = ContentHash::from_text("x");

        let older = ContentAttestation {
            peer_id: a.fingerprint(),
            canonical_url: "https://example.org".into(),
            raw_hash: hash,
            content_hash: hash,
            crawl_time_ms: 1000,
        };
        let newer = ContentAttestation {
            peer_id: b.fingerprint(),
            crawl_time_ms: 2000,
            ..older.clone()
        };
        cache.insert(&newer);
        cache.insert(&older);
        assert_eq!(cache.attester(&hash, 3000), Some(b.fingerprint()));
    }

    #[test]
    fn test_sweep() {
        let (_, identity) = test_identity(5);
        let cache = AttestationCache::new();
        let hash = ContentHash::from_text("old");
        cache.insert(&ContentAttestation {
            peer_id: identity.fingerprint(),
            canonical_url: "https://example.org".into(),
            raw_hash: hash,
            content_hash: hash,
            crawl_time_ms: 0,
        });
        cache.sweep(ATTESTATION_TTL_MS + 1);
        assert!(cache.is_empty());
    }
}
