//! STORE validation funnel
//!
//! Every inbound STORE passes these gates in order — reject otherwise:
//!
//! 1. Envelope decode under hard size caps
//! 2. Signature against the sender's registered public key
//! 3. Envelope freshness (|now − ts| ≤ 300 s)
//! 4. Nonce strictly greater than the last accepted for that peer
//! 5. Per-key rate limit (keyword pointers 10/h, others 100/h)
//! 6. Schema-specific constraints (lock owner = sender, quorum size, …)
//!
//! Validation failures are dropped and logged, never panicked on. Each
//! failure adds a strike against the sender; strikes feed the trust
//! kernel.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::keyspace::Key;
use super::records::{RecordError, RecordPayload, RecordTag};
use crate::crypto::{Envelope, EnvelopeError, Fingerprint, NonceTracker, PeerIdentity};

/// Keyword pointer publications per peer per key per hour
pub const KEYWORD_RATE_PER_HOUR: u32 = 10;
/// All other record publications per peer per hour
pub const GENERAL_RATE_PER_HOUR: u32 = 100;

const HOUR_MS: u64 = 3600 * 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("Sender {0} is not a registered identity")]
    UnknownSender(Fingerprint),
    #[error("Rate limit exceeded for peer {0}")]
    RateLimited(Fingerprint),
    #[error("Schema constraint violated: {0}")]
    Constraint(&'static str),
    #[error("Sender is isolated")]
    Isolated,
}

/// A record that has passed the full funnel
#[derive(Debug, Clone)]
pub struct VerifiedRecord {
    pub sender: Fingerprint,
    pub payload: RecordPayload,
    pub timestamp_ms: u64,
}

/// Registry of admitted peer identities (PoW verified on insert)
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    peers: HashMap<Fingerprint, PeerIdentity>,
    difficulty: u32,
}

impl IdentityRegistry {
    pub fn new(difficulty: u32) -> Self {
        Self {
            peers: HashMap::new(),
            difficulty,
        }
    }

    /// Admit a peer identity; rejects identities without valid PoW
    pub fn register(&mut self, identity: PeerIdentity) -> bool {
        if !identity.verify_pow(self.difficulty) {
            warn!(peer = %identity.fingerprint(), "identity rejected: insufficient PoW");
            return false;
        }
        self.peers.insert(identity.fingerprint(), identity);
        true
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<&PeerIdentity> {
        self.peers.get(fp)
    }

    pub fn remove(&mut self, fp: &Fingerprint) {
        self.peers.remove(fp);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.peers.keys().copied().collect()
    }
}

/// Sliding-window publication rate limiter
#[derive(Debug, Default)]
struct RateWindows {
    // (peer, optional key) → timestamps of accepted publications
    windows: HashMap<(Fingerprint, Option<Key>), Vec<u64>>,
}

impl RateWindows {
    fn check_and_record(
        &mut self,
        peer: Fingerprint,
        key: Option<Key>,
        limit: u32,
        now_ms: u64,
    ) -> bool {
        let window = self.windows.entry((peer, key)).or_default();
        window.retain(|t| now_ms.saturating_sub(*t) < HOUR_MS);
        if window.len() as u32 >= limit {
            return false;
        }
        window.push(now_ms);
        true
    }
}

/// The STORE funnel with per-peer strike accounting
pub struct RecordValidator {
    identities: IdentityRegistry,
    nonces: NonceTracker,
    rates: RateWindows,
    strikes: HashMap<Fingerprint, u32>,
    pow_difficulty: u32,
}

impl RecordValidator {
    pub fn new(pow_difficulty: u32) -> Self {
        Self {
            identities: IdentityRegistry::new(pow_difficulty),
            nonces: NonceTracker::new(),
            rates: RateWindows::default(),
            strikes: HashMap::new(),
            pow_difficulty,
        }
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    pub fn register_identity(&mut self, identity: PeerIdentity) -> bool {
        self.identities.register(identity)
    }

    /// Protocol-violation strikes recorded against a peer
    pub fn strikes(&self, peer: &Fingerprint) -> u32 {
        self.strikes.get(peer).copied().unwrap_or(0)
    }

    /// Run the full funnel over raw envelope bytes stored under `key`
    pub fn validate_store(
        &mut self,
        key: &Key,
        envelope_bytes: &[u8],
        now_ms: u64,
    ) -> Result<VerifiedRecord, ValidatorError> {
        match self.validate_inner(key, envelope_bytes, now_ms) {
            Ok(rec) => Ok(rec),
            Err(e) => {
                // Strikes only for attributable protocol violations;
                // rate limiting is backpressure, not misbehavior.
                if let Ok(env) = Envelope::decode(envelope_bytes) {
                    if !matches!(e, ValidatorError::RateLimited(_)) {
                        *self.strikes.entry(env.peer_id).or_insert(0) += 1;
                    }
                }
                debug!(key = %key.to_hex(), error = %e, "store rejected");
                Err(e)
            }
        }
    }

    fn validate_inner(
        &mut self,
        key: &Key,
        envelope_bytes: &[u8],
        now_ms: u64,
    ) -> Result<VerifiedRecord, ValidatorError> {
        // 1. Decode under caps
        let envelope = Envelope::decode(envelope_bytes)?;
        let payload = RecordPayload::decode(&envelope.payload)?;

        // 2.–3. Signature + freshness + PoW against the registered identity
        let sender = self
            .identities
            .get(&envelope.peer_id)
            .cloned()
            .ok_or(ValidatorError::UnknownSender(envelope.peer_id))?;
        envelope.verify(&sender, self.pow_difficulty, now_ms)?;

        // 4. Nonce monotonicity
        self.nonces
            .check_and_record(envelope.peer_id, envelope.nonce)?;

        // 5. Rate limit
        let (rate_key, limit) = match payload.tag() {
            RecordTag::KeywordPointer => (Some(*key), KEYWORD_RATE_PER_HOUR),
            _ => (None, GENERAL_RATE_PER_HOUR),
        };
        if !self
            .rates
            .check_and_record(envelope.peer_id, rate_key, limit, now_ms)
        {
            return Err(ValidatorError::RateLimited(envelope.peer_id));
        }

        // 6. Schema constraints
        check_schema(&payload, &envelope.peer_id, key)?;

        Ok(VerifiedRecord {
            sender: envelope.peer_id,
            payload,
            timestamp_ms: envelope.timestamp_ms,
        })
    }
}

/// Per-family constraints beyond what decoding enforces
fn check_schema(
    payload: &RecordPayload,
    sender: &Fingerprint,
    key: &Key,
) -> Result<(), ValidatorError> {
    if payload.origin() != *sender && !matches!(payload, RecordPayload::AuditReport(_)) {
        return Err(ValidatorError::Constraint("origin must match sender"));
    }

    match payload {
        RecordPayload::CrawlLock(lock) => {
            if Key::for_lock(&lock.canonical_url) != *key {
                return Err(ValidatorError::Constraint("lock stored under wrong key"));
            }
        }
        RecordPayload::CrawlLockRelease(release) => {
            if Key::for_lock(&release.canonical_url) != *key {
                return Err(ValidatorError::Constraint("release stored under wrong key"));
            }
        }
        RecordPayload::ContentAttestation(att) => {
            if Key::for_attestation(&att.canonical_url) != *key {
                return Err(ValidatorError::Constraint(
                    "attestation stored under wrong key",
                ));
            }
        }
        RecordPayload::AuditReport(report) => {
            if report.observations.len() < 3 {
                return Err(ValidatorError::Constraint("audit quorum below three"));
            }
            let mut seen = std::collections::HashSet::new();
            for obs in &report.observations {
                if !seen.insert(obs.auditor) {
                    return Err(ValidatorError::Constraint("duplicate auditor"));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NodeKeys, NonceCounter};
    use crate::dht::records::{CrawlLock, KeywordPointer};

    struct TestPeer {
        keys: NodeKeys,
        identity: PeerIdentity,
        nonces: NonceCounter,
    }

    fn test_peer(n: u8) -> TestPeer {
        let keys = NodeKeys::from_secret_bytes([n; 32]).unwrap();
        let identity = PeerIdentity::mine(keys.public_key_bytes(), 8, 0);
        TestPeer {
            keys,
            identity,
            nonces: NonceCounter::default(),
        }
    }

    fn signed(peer: &mut TestPeer, payload: &RecordPayload, ts: u64) -> Vec<u8> {
        Envelope::sign(
            &peer.keys,
            &peer.identity,
            peer.nonces.next(),
            ts,
            payload.encode(),
        )
        .unwrap()
        .encode()
    }

    fn lock_payload(peer: &TestPeer, url: &str, ts: u64) -> RecordPayload {
        RecordPayload::CrawlLock(CrawlLock {
            peer_id: peer.identity.fingerprint(),
            canonical_url: url.into(),
            acquired_at_ms: ts,
            ttl_secs: 300,
        })
    }

    #[test]
    fn test_valid_store_accepted() {
        let mut peer = test_peer(1);
        let mut validator = RecordValidator::new(8);
        validator.register_identity(peer.identity.clone());

        let url = "https://example.org/a";
        let payload = lock_payload(&peer, url, 1000);
        let bytes = signed(&mut peer, &payload, 1000);

        let verified = validator
            .validate_store(&Key::for_lock(url), &bytes, 1000)
            .unwrap();
        assert_eq!(verified.sender, peer.identity.fingerprint());
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let mut peer = test_peer(2);
        let mut validator = RecordValidator::new(8);

        let url = "https://example.org/b";
        let payload = lock_payload(&peer, url, 1000);
        let bytes = signed(&mut peer, &payload, 1000);

        assert!(matches!(
            validator.validate_store(&Key::for_lock(url), &bytes, 1000),
            Err(ValidatorError::UnknownSender(_))
        ));
        assert_eq!(validator.strikes(&peer.identity.fingerprint()), 1);
    }

    #[test]
    fn test_replay_rejected() {
        let mut peer = test_peer(3);
        let mut validator = RecordValidator::new(8);
        validator.register_identity(peer.identity.clone());

        let url = "https://example.org/c";
        let payload = lock_payload(&peer, url, 1000);
        let bytes = signed(&mut peer, &payload, 1000);
        let key = Key::for_lock(url);

        validator.validate_store(&key, &bytes, 1000).unwrap();
        assert!(matches!(
            validator.validate_store(&key, &bytes, 1001),
            Err(ValidatorError::Envelope(EnvelopeError::ReplayNonce { .. }))
        ));
    }

    #[test]
    fn test_lock_under_wrong_key_rejected() {
        let mut peer = test_peer(4);
        let mut validator = RecordValidator::new(8);
        validator.register_identity(peer.identity.clone());

        let payload = lock_payload(&peer, "https://example.org/d", 1000);
        let bytes = signed(&mut peer, &payload, 1000);

        assert!(matches!(
            validator.validate_store(&Key::for_lock("https://other.org"), &bytes, 1000),
            Err(ValidatorError::Constraint(_))
        ));
    }

    #[test]
    fn test_foreign_origin_rejected() {
        let mut mallory = test_peer(5);
        let victim = test_peer(6);
        let mut validator = RecordValidator::new(8);
        validator.register_identity(mallory.identity.clone());

        // Mallory signs a lock claiming to be the victim
        let url = "https://example.org/e";
        let payload = RecordPayload::CrawlLock(CrawlLock {
            peer_id: victim.identity.fingerprint(),
            canonical_url: url.into(),
            acquired_at_ms: 1000,
            ttl_secs: 300,
        });
        let bytes = signed(&mut mallory, &payload, 1000);

        assert!(matches!(
            validator.validate_store(&Key::for_lock(url), &bytes, 1000),
            Err(ValidatorError::Constraint("origin must match sender"))
        ));
    }

    #[test]
    fn test_keyword_rate_limit() {
        let mut peer = test_peer(7);
        let mut validator = RecordValidator::new(8);
        validator.register_identity(peer.identity.clone());

        let key = Key::for_keyword("rust");
        for i in 0..KEYWORD_RATE_PER_HOUR {
            let payload = RecordPayload::KeywordPointer(KeywordPointer {
                peer_id: peer.identity.fingerprint(),
                doc_id: u64::from(i),
                relevance_ppm: 500_000,
                content_hash: crate::crypto::ContentHash([0u8; 32]),
                published_at_ms: 1000,
            });
            let bytes = signed(&mut peer, &payload, 1000);
            validator.validate_store(&key, &bytes, 1000).unwrap();
        }

        let payload = RecordPayload::KeywordPointer(KeywordPointer {
            peer_id: peer.identity.fingerprint(),
            doc_id: 999,
            relevance_ppm: 500_000,
            content_hash: crate::crypto::ContentHash([0u8; 32]),
            published_at_ms: 1000,
        });
        let bytes = signed(&mut peer, &payload, 1000);
        assert!(matches!(
            validator.validate_store(&key, &bytes, 1000),
            Err(ValidatorError::RateLimited(_))
        ));
        // Rate limiting is not a strike
        assert_eq!(validator.strikes(&peer.identity.fingerprint()), 0);
    }

    #[test]
    fn test_malformed_never_panics() {
        let mut validator = RecordValidator::new(8);
        let key = Key::hash(b"whatever");
        for garbage in [&[][..], &[0u8; 10][..], &[0xFFu8; 200][..]] {
            assert!(validator.validate_store(&key, garbage, 1000).is_err());
        }
    }
}
