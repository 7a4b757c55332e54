//! Durable takedown and deletion obligations
//!
//! Accepted records are persisted so restarts never reopen a deletion
//! obligation. The block-list is applied to the local index at accept
//! time and consulted by search so blocked content never resurfaces.
//! Records propagate to replicas until every one acknowledges or the
//! 24-hour compliance window elapses.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::crypto::{ContentHash, Fingerprint};
use crate::dht::records::{TakedownRecord, TakedownTarget};

/// Compliance window for propagation
pub const COMPLIANCE_WINDOW_MS: u64 = 24 * 3600 * 1000;

#[derive(Error, Debug)]
pub enum TakedownError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt takedown entry")]
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTakedown {
    record: TakedownRecord,
    accepted_at_ms: u64,
    /// Replicas that acknowledged propagation
    acked_by: Vec<Fingerprint>,
    /// Fully propagated (all replicas acked, or window elapsed)
    settled: bool,
}

/// Sled-backed takedown store and block-list
pub struct TakedownStore {
    #[allow(dead_code)]
    db: Db,
    records: Tree,
    blocked_hashes: Tree,
    blocked_urls: Tree,
}

impl TakedownStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TakedownError> {
        let db = sled::open(path)?;
        let store = Self {
            records: db.open_tree("takedown_records")?,
            blocked_hashes: db.open_tree("blocked_hashes")?,
            blocked_urls: db.open_tree("blocked_urls")?,
            db,
        };
        info!(
            records = store.records.len(),
            blocked = store.blocked_hashes.len() + store.blocked_urls.len(),
            "takedown store opened"
        );
        Ok(store)
    }

    fn record_key(record: &TakedownRecord) -> [u8; 32] {
        let mut data = Vec::new();
        match &record.target {
            TakedownTarget::Url(url) => data.extend_from_slice(url.as_bytes()),
            TakedownTarget::Hash(hash) => data.extend_from_slice(hash.as_bytes()),
        }
        data.extend_from_slice(record.requester.as_bytes());
        *ContentHash::from_data(&data).as_bytes()
    }

    /// Accept a validated takedown record: persist it and add its
    /// target to the block-list. Unsigned records never reach here —
    /// the DHT validator rejects them outright.
    pub fn accept(&self, record: TakedownRecord, now_ms: u64) -> Result<(), TakedownError> {
        match &record.target {
            TakedownTarget::Url(url) => {
                self.blocked_urls
                    .insert(ContentHash::from_text(url).as_bytes(), &[1u8])?;
            }
            TakedownTarget::Hash(hash) => {
                self.blocked_hashes.insert(hash.as_bytes(), &[1u8])?;
            }
        }

        let stored = StoredTakedown {
            record: record.clone(),
            accepted_at_ms: now_ms,
            acked_by: Vec::new(),
            settled: false,
        };
        let bytes = serde_json::to_vec(&stored).map_err(|_| TakedownError::Corrupt)?;
        self.records.insert(Self::record_key(&record), bytes)?;
        info!(target = ?record.target, reason = %record.reason, "takedown accepted");
        Ok(())
    }

    pub fn is_hash_blocked(&self, hash: &ContentHash) -> bool {
        self.blocked_hashes
            .contains_key(hash.as_bytes())
            .unwrap_or(false)
    }

    pub fn is_url_blocked(&self, canonical_url: &str) -> bool {
        self.blocked_urls
            .contains_key(ContentHash::from_text(canonical_url).as_bytes())
            .unwrap_or(false)
    }

    /// Record one replica's propagation acknowledgment
    pub fn record_ack(
        &self,
        record: &TakedownRecord,
        replica: Fingerprint,
        replica_count: usize,
    ) -> Result<(), TakedownError> {
        let key = Self::record_key(record);
        let Some(bytes) = self.records.get(key)? else {
            return Ok(());
        };
        let mut stored: StoredTakedown =
            serde_json::from_slice(&bytes).map_err(|_| TakedownError::Corrupt)?;
        if !stored.acked_by.contains(&replica) {
            stored.acked_by.push(replica);
        }
        if stored.acked_by.len() >= replica_count {
            stored.settled = true;
        }
        let bytes = serde_json::to_vec(&stored).map_err(|_| TakedownError::Corrupt)?;
        self.records.insert(key, bytes)?;
        Ok(())
    }

    /// Records still needing propagation (unsettled, window open)
    pub fn pending(&self, now_ms: u64) -> Result<Vec<TakedownRecord>, TakedownError> {
        let mut out = Vec::new();
        for item in self.records.iter() {
            let (key, bytes) = item?;
            let mut stored: StoredTakedown =
                serde_json::from_slice(&bytes).map_err(|_| TakedownError::Corrupt)?;
            if stored.settled {
                continue;
            }
            // Window elapsed: obligation is locally final
            if now_ms.saturating_sub(stored.accepted_at_ms) > COMPLIANCE_WINDOW_MS {
                stored.settled = true;
                let bytes = serde_json::to_vec(&stored).map_err(|_| TakedownError::Corrupt)?;
                self.records.insert(key, bytes)?;
                continue;
            }
            out.push(stored.record);
        }
        Ok(out)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn flush(&self) -> Result<(), TakedownError> {
        self.records.flush()?;
        self.blocked_hashes.flush()?;
        self.blocked_urls.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    fn hash_record(n: u8) -> TakedownRecord {
        TakedownRecord {
            target: TakedownTarget::Hash(ContentHash([n; 32])),
            reason: "dmca".into(),
            requester: fp(1),
            issued_at_ms: 1000,
        }
    }

    #[test]
    fn test_accept_blocks_hash() {
        let dir = tempdir().unwrap();
        let store = TakedownStore::open(dir.path()).unwrap();
        let record = hash_record(5);

        assert!(!store.is_hash_blocked(&ContentHash([5u8; 32])));
        store.accept(record, 1000).unwrap();
        assert!(store.is_hash_blocked(&ContentHash([5u8; 32])));
    }

    #[test]
    fn test_accept_blocks_url() {
        let dir = tempdir().unwrap();
        let store = TakedownStore::open(dir.path()).unwrap();
        let record = TakedownRecord {
            target: TakedownTarget::Url("https://example.org/infringing".into()),
            reason: "gdpr".into(),
            requester: fp(2),
            issued_at_ms: 1000,
        };
        store.accept(record, 1000).unwrap();
        assert!(store.is_url_blocked("https://example.org/infringing"));
        assert!(!store.is_url_blocked("https://example.org/fine"));
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let store = TakedownStore::open(dir.path()).unwrap();
            store.accept(hash_record(7), 1000).unwrap();
            store.flush().unwrap();
        }
        let store = TakedownStore::open(dir.path()).unwrap();
        assert!(store.is_hash_blocked(&ContentHash([7u8; 32])));
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_pending_until_acked() {
        let dir = tempdir().unwrap();
        let store = TakedownStore::open(dir.path()).unwrap();
        let record = hash_record(9);
        store.accept(record.clone(), 1000).unwrap();

        assert_eq!(store.pending(2000).unwrap().len(), 1);

        store.record_ack(&record, fp(10), 2).unwrap();
        assert_eq!(store.pending(2000).unwrap().len(), 1);

        store.record_ack(&record, fp(11), 2).unwrap();
        assert!(store.pending(2000).unwrap().is_empty());
    }

    #[test]
    fn test_pending_settles_after_window() {
        let dir = tempdir().unwrap();
        let store = TakedownStore::open(dir.path()).unwrap();
        store.accept(hash_record(3), 1000).unwrap();

        let after_window = 1000 + COMPLIANCE_WINDOW_MS + 1;
        assert!(store.pending(after_window).unwrap().is_empty());
        // But the block itself is permanent
        assert!(store.is_hash_blocked(&ContentHash([3u8; 32])));
    }
}
