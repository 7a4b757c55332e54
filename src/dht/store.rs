//! Local slice of the replicated record store
//!
//! Holds the validated records this node is responsible for. A
//! `FIND_VALUE` returns the *set* of currently valid records at a key;
//! the caller applies the SELECT policy (highest trust tier, then
//! newest timestamp, then lexicographically smallest peer id).

use std::collections::HashMap;
use tracing::debug;

use super::keyspace::Key;
use super::records::{CrawlLock, RecordPayload, ATTESTATION_TTL_MS};
use super::validator::VerifiedRecord;
use crate::crypto::Fingerprint;
use crate::trust::score::TrustTier;

/// Cap on records served for one key in a single FIND_VALUE
pub const MAX_RECORDS_PER_KEY: usize = 256;

/// Default retention for records without their own TTL field
const DEFAULT_RECORD_TTL_MS: u64 = 7 * 24 * 3600 * 1000;

/// A record held by the store, with the raw signed envelope retained so
/// downstream peers can re-verify without trusting this node.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub sender: Fingerprint,
    pub payload: RecordPayload,
    pub timestamp_ms: u64,
    pub envelope_bytes: Vec<u8>,
}

impl StoredRecord {
    pub fn from_verified(rec: VerifiedRecord, envelope_bytes: Vec<u8>) -> Self {
        Self {
            sender: rec.sender,
            payload: rec.payload,
            timestamp_ms: rec.timestamp_ms,
            envelope_bytes,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        match &self.payload {
            RecordPayload::CrawlLock(lock) => lock.is_expired(now_ms),
            RecordPayload::ContentAttestation(att) => {
                now_ms.saturating_sub(att.crawl_time_ms) > ATTESTATION_TTL_MS
            }
            // Takedown and deletion obligations never age out here;
            // the durable store in trust::takedown owns their lifecycle.
            RecordPayload::Takedown(_) | RecordPayload::Deletion(_) => false,
            _ => now_ms.saturating_sub(self.timestamp_ms) > DEFAULT_RECORD_TTL_MS,
        }
    }
}

/// In-memory record store for this node's keyspace slice
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<Key, Vec<StoredRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated record under `key`.
    ///
    /// Family rules:
    /// - A lock release by the lock owner removes the lock.
    /// - A newer lock replaces an expired one; a live lock by another
    ///   peer is kept and the new lock rejected (first writer wins).
    /// - Attestations supersede older ones from the same (peer, url).
    /// - Ledger roots keep only the newest per peer.
    pub fn put(&mut self, key: Key, record: StoredRecord, now_ms: u64) -> bool {
        let slot = self.records.entry(key).or_default();
        slot.retain(|r| !r.is_expired(now_ms));

        match &record.payload {
            RecordPayload::CrawlLockRelease(release) => {
                let releaser = release.peer_id;
                let before = slot.len();
                slot.retain(|r| match &r.payload {
                    RecordPayload::CrawlLock(lock) => lock.peer_id != releaser,
                    _ => true,
                });
                let removed = before != slot.len();
                if !removed {
                    debug!(url = %release.canonical_url, "release without matching lock");
                }
                removed
            }
            RecordPayload::CrawlLock(_) => {
                let held = slot
                    .iter()
                    .any(|r| matches!(&r.payload, RecordPayload::CrawlLock(l) if !l.is_expired(now_ms)));
                if held {
                    return false;
                }
                slot.push(record);
                true
            }
            RecordPayload::ContentAttestation(att) => {
                let (peer, url) = (att.peer_id, att.canonical_url.clone());
                slot.retain(|r| match &r.payload {
                    RecordPayload::ContentAttestation(a) => {
                        !(a.peer_id == peer && a.canonical_url == url)
                    }
                    _ => true,
                });
                slot.push(record);
                true
            }
            RecordPayload::CreditLedgerRoot(root) => {
                let peer = root.peer_id;
                slot.retain(|r| match &r.payload {
                    RecordPayload::CreditLedgerRoot(x) => x.peer_id != peer,
                    _ => true,
                });
                slot.push(record);
                true
            }
            _ => {
                if slot.len() >= MAX_RECORDS_PER_KEY {
                    return false;
                }
                slot.push(record);
                true
            }
        }
    }

    /// All currently valid records at `key` (the FIND_VALUE answer)
    pub fn get(&self, key: &Key, now_ms: u64) -> Vec<&StoredRecord> {
        self.records
            .get(key)
            .map(|slot| {
                slot.iter()
                    .filter(|r| !r.is_expired(now_ms))
                    .take(MAX_RECORDS_PER_KEY)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The live crawl lock for a URL, if any
    pub fn active_lock(&self, canonical_url: &str, now_ms: u64) -> Option<CrawlLock> {
        let key = Key::for_lock(canonical_url);
        self.get(&key, now_ms).into_iter().find_map(|r| {
            if let RecordPayload::CrawlLock(lock) = &r.payload {
                (!lock.is_expired(now_ms)).then(|| lock.clone())
            } else {
                None
            }
        })
    }

    /// Drop records originated by an isolated peer (they are not served)
    pub fn purge_peer(&mut self, peer: &Fingerprint) {
        for slot in self.records.values_mut() {
            slot.retain(|r| r.sender != *peer && r.payload.origin() != *peer);
        }
    }

    /// Periodic expiry sweep; returns how many records were dropped
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let mut dropped = 0;
        self.records.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|r| !r.is_expired(now_ms));
            dropped += before - slot.len();
            !slot.is_empty()
        });
        dropped
    }

    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

/// SELECT policy over a FIND_VALUE result set: highest trust tier,
/// then newest timestamp, then smallest peer id for determinism.
pub fn select_record<'a>(
    records: &'a [StoredRecord],
    tier_of: impl Fn(&Fingerprint) -> TrustTier,
) -> Option<&'a StoredRecord> {
    records.iter().max_by(|a, b| {
        let tier_a = tier_of(&a.sender);
        let tier_b = tier_of(&b.sender);
        tier_a
            .cmp(&tier_b)
            .then(a.timestamp_ms.cmp(&b.timestamp_ms))
            // Smallest peer id wins: reverse the natural ordering
            .then(b.sender.as_bytes().cmp(a.sender.as_bytes()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::records::{ContentAttestation, CrawlLockRelease};
    use crate::crypto::ContentHash;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    fn stored(payload: RecordPayload, sender: Fingerprint, ts: u64) -> StoredRecord {
        StoredRecord {
            sender,
            payload,
            timestamp_ms: ts,
            envelope_bytes: vec![],
        }
    }

    fn lock(n: u8, url: &str, at: u64) -> RecordPayload {
        RecordPayload::CrawlLock(CrawlLock {
            peer_id: fp(n),
            canonical_url: url.into(),
            acquired_at_ms: at,
            ttl_secs: 300,
        })
    }

    #[test]
    fn test_live_lock_blocks_second_lock() {
        let mut store = RecordStore::new();
        let url = "https://example.org/x";
        let key = Key::for_lock(url);

        assert!(store.put(key, stored(lock(1, url, 1000), fp(1), 1000), 1000));
        assert!(!store.put(key, stored(lock(2, url, 1001), fp(2), 1001), 1001));
        assert_eq!(store.active_lock(url, 1001).unwrap().peer_id, fp(1));
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let mut store = RecordStore::new();
        let url = "https://example.org/y";
        let key = Key::for_lock(url);

        store.put(key, stored(lock(1, url, 0), fp(1), 0), 0);
        // 301 s later the first lock is expired
        let later = 301 * 1000;
        assert!(store.put(key, stored(lock(2, url, later), fp(2), later), later));
        assert_eq!(store.active_lock(url, later).unwrap().peer_id, fp(2));
    }

    #[test]
    fn test_owner_release_removes_lock() {
        let mut store = RecordStore::new();
        let url = "https://example.org/z";
        let key = Key::for_lock(url);

        store.put(key, stored(lock(1, url, 1000), fp(1), 1000), 1000);
        let release = RecordPayload::CrawlLockRelease(CrawlLockRelease {
            peer_id: fp(1),
            canonical_url: url.into(),
            released_at_ms: 2000,
        });
        assert!(store.put(key, stored(release, fp(1), 2000), 2000));
        assert!(store.active_lock(url, 2000).is_none());
    }

    #[test]
    fn test_foreign_release_keeps_lock() {
        let mut store = RecordStore::new();
        let url = "https://example.org/w";
        let key = Key::for_lock(url);

        store.put(key, stored(lock(1, url, 1000), fp(1), 1000), 1000);
        let release = RecordPayload::CrawlLockRelease(CrawlLockRelease {
            peer_id: fp(2),
            canonical_url: url.into(),
            released_at_ms: 2000,
        });
        store.put(key, stored(release, fp(2), 2000), 2000);
        assert!(store.active_lock(url, 2000).is_some());
    }

    #[test]
    fn test_attestation_superseded_by_newer() {
        let mut store = RecordStore::new();
        let url = "https://example.org/a";
        let key = Key::for_attestation(url);

        let att = |ts: u64, h: u8| {
            RecordPayload::ContentAttestation(ContentAttestation {
                peer_id: fp(1),
                canonical_url: url.into(),
                raw_hash: ContentHash([h; 32]),
                content_hash: ContentHash([h; 32]),
                crawl_time_ms: ts,
            })
        };

        store.put(key, stored(att(1000, 1), fp(1), 1000), 1000);
        store.put(key, stored(att(2000, 2), fp(1), 2000), 2000);

        let records = store.get(&key, 2000);
        assert_eq!(records.len(), 1);
        match &records[0].payload {
            RecordPayload::ContentAttestation(a) => assert_eq!(a.crawl_time_ms, 2000),
            _ => panic!("expected attestation"),
        }
    }

    #[test]
    fn test_select_prefers_tier_then_newness() {
        let records = vec![
            stored(lock(1, "https://e.org", 0), fp(1), 5000),
            stored(lock(2, "https://e.org", 0), fp(2), 9000),
            stored(lock(3, "https://e.org", 0), fp(3), 1000),
        ];
        let tier_of = |f: &Fingerprint| {
            if *f == fp(3) {
                TrustTier::Trusted
            } else {
                TrustTier::Normal
            }
        };
        // Trusted wins despite being oldest
        assert_eq!(select_record(&records, tier_of).unwrap().sender, fp(3));

        let all_normal = |_: &Fingerprint| TrustTier::Normal;
        // Newest wins among equal tiers
        assert_eq!(select_record(&records, all_normal).unwrap().sender, fp(2));
    }

    #[test]
    fn test_purge_peer_removes_records() {
        let mut store = RecordStore::new();
        let url = "https://example.org/p";
        let key = Key::for_lock(url);
        store.put(key, stored(lock(1, url, 1000), fp(1), 1000), 1000);

        store.purge_peer(&fp(1));
        assert!(store.get(&key, 1000).is_empty());
    }

    #[test]
    fn test_sweep_drops_expired() {
        let mut store = RecordStore::new();
        let url = "https://example.org/s";
        store.put(Key::for_lock(url), stored(lock(1, url, 0), fp(1), 0), 0);
        assert_eq!(store.sweep(400_000), 1);
        assert_eq!(store.record_count(), 0);
    }
}
