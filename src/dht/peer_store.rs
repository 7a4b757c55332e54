//! Persistent peer cache using sled
//!
//! Remembers peers across restarts so a node can rejoin the overlay
//! without fresh bootstrap seeds. Also tracks the latency EMA and
//! bandwidth class the search orchestrator uses for fan-out selection,
//! and enforces k-bucket subnet diversity (at most 2 entries per /16
//! IPv4 subnet per bucket).

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::{Fingerprint, PeerIdentity};

/// Smoothing factor for the latency EMA
const LATENCY_EMA_ALPHA: f64 = 0.3;
/// Max peers from one /16 IPv4 subnet in one bucket
pub const MAX_PER_SUBNET_PER_BUCKET: usize = 2;
/// Failed probes before a stale peer is evicted
pub const EVICT_AFTER_FAILED_PROBES: u32 = 3;

#[derive(Error, Debug)]
pub enum PeerStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt peer entry")]
    Corrupt,
}

/// Coarse bandwidth classification from observed transfer rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BandwidthClass {
    Low,
    #[default]
    Medium,
    High,
}

/// Everything we remember about a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerProfile {
    pub identity: PeerIdentity,
    pub addresses: Vec<String>,
    pub latency_ema_ms: f64,
    pub bandwidth_class: BandwidthClass,
    pub subnet: Option<[u8; 2]>,
    pub last_seen_ms: u64,
    pub failed_probes: u32,
}

impl PeerProfile {
    pub fn new(identity: PeerIdentity, now_ms: u64) -> Self {
        Self {
            identity,
            addresses: Vec::new(),
            latency_ema_ms: 0.0,
            bandwidth_class: BandwidthClass::default(),
            subnet: None,
            last_seen_ms: now_ms,
            failed_probes: 0,
        }
    }

    /// Fold a new round-trip sample into the EMA
    pub fn observe_latency(&mut self, rtt_ms: f64) {
        if self.latency_ema_ms == 0.0 {
            self.latency_ema_ms = rtt_ms;
        } else {
            self.latency_ema_ms =
                LATENCY_EMA_ALPHA * rtt_ms + (1.0 - LATENCY_EMA_ALPHA) * self.latency_ema_ms;
        }
    }
}

/// /16 prefix of an IPv4 address, for bucket diversity accounting
pub fn subnet16(ip: &IpAddr) -> Option<[u8; 2]> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Some([o[0], o[1]])
        }
        IpAddr::V6(_) => None,
    }
}

/// Sled-backed peer store
pub struct PeerStore {
    #[allow(dead_code)]
    db: Db,
    peers: Tree,
}

impl PeerStore {
    /// Open or create the peer store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PeerStoreError> {
        let db = sled::open(path)?;
        let peers = db.open_tree("peers")?;
        info!(count = peers.len(), "peer store opened");
        Ok(Self { db, peers })
    }

    /// Insert or update a peer profile
    pub fn upsert(&self, profile: &PeerProfile) -> Result<(), PeerStoreError> {
        let key = profile.identity.fingerprint();
        let value = serde_json::to_vec(profile).map_err(|_| PeerStoreError::Corrupt)?;
        self.peers.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, fp: &Fingerprint) -> Result<Option<PeerProfile>, PeerStoreError> {
        match self.peers.get(fp.as_bytes())? {
            Some(bytes) => {
                let profile =
                    serde_json::from_slice(&bytes).map_err(|_| PeerStoreError::Corrupt)?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, fp: &Fingerprint) -> Result<(), PeerStoreError> {
        self.peers.remove(fp.as_bytes())?;
        Ok(())
    }

    /// All stored profiles (corrupt entries skipped, not fatal)
    pub fn all(&self) -> Result<Vec<PeerProfile>, PeerStoreError> {
        let mut out = Vec::new();
        for item in self.peers.iter() {
            let (_, value) = item?;
            match serde_json::from_slice::<PeerProfile>(&value) {
                Ok(p) => out.push(p),
                Err(_) => debug!("skipping corrupt peer entry"),
            }
        }
        Ok(out)
    }

    /// Record a failed probe; evicts after [`EVICT_AFTER_FAILED_PROBES`]
    pub fn record_failed_probe(&self, fp: &Fingerprint) -> Result<bool, PeerStoreError> {
        if let Some(mut profile) = self.get(fp)? {
            profile.failed_probes += 1;
            if profile.failed_probes >= EVICT_AFTER_FAILED_PROBES {
                self.remove(fp)?;
                debug!(peer = %fp, "peer evicted after failed probes");
                return Ok(true);
            }
            self.upsert(&profile)?;
        }
        Ok(false)
    }

    /// Record a successful contact: resets probe counter, bumps last_seen
    pub fn record_contact(&self, fp: &Fingerprint, now_ms: u64) -> Result<(), PeerStoreError> {
        if let Some(mut profile) = self.get(fp)? {
            profile.failed_probes = 0;
            profile.last_seen_ms = now_ms;
            self.upsert(&profile)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn flush(&self) -> Result<(), PeerStoreError> {
        self.peers.flush()?;
        Ok(())
    }
}

/// Bucket-level subnet diversity check.
///
/// `bucket_subnets` maps bucket index → subnet → occupant count.
pub struct SubnetDiversity {
    buckets: HashMap<usize, HashMap<[u8; 2], usize>>,
}

impl SubnetDiversity {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    /// Whether a peer from `subnet` may join `bucket`
    pub fn admit(&mut self, bucket: usize, subnet: Option<[u8; 2]>) -> bool {
        let Some(subnet) = subnet else {
            return true; // IPv6 peers are not subnet-limited
        };
        let count = self
            .buckets
            .entry(bucket)
            .or_default()
            .entry(subnet)
            .or_insert(0);
        if *count >= MAX_PER_SUBNET_PER_BUCKET {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release(&mut self, bucket: usize, subnet: Option<[u8; 2]>) {
        if let Some(subnet) = subnet {
            if let Some(counts) = self.buckets.get_mut(&bucket) {
                if let Some(count) = counts.get_mut(&subnet) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }
}

impl Default for SubnetDiversity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile(n: u8) -> PeerProfile {
        let identity = PeerIdentity::mine([n; 32], 4, 0);
        PeerProfile::new(identity, 1000)
    }

    #[test]
    fn test_upsert_and_get() {
        let dir = tempdir().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();

        let p = profile(1);
        let fp = p.identity.fingerprint();
        store.upsert(&p).unwrap();

        let loaded = store.get(&fp).unwrap().unwrap();
        assert_eq!(loaded.identity, p.identity);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let p = profile(2);
        let fp = p.identity.fingerprint();

        {
            let store = PeerStore::open(dir.path()).unwrap();
            store.upsert(&p).unwrap();
            store.flush().unwrap();
        }

        let store = PeerStore::open(dir.path()).unwrap();
        assert!(store.get(&fp).unwrap().is_some());
    }

    #[test]
    fn test_evict_after_three_failed_probes() {
        let dir = tempdir().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();
        let p = profile(3);
        let fp = p.identity.fingerprint();
        store.upsert(&p).unwrap();

        assert!(!store.record_failed_probe(&fp).unwrap());
        assert!(!store.record_failed_probe(&fp).unwrap());
        assert!(store.record_failed_probe(&fp).unwrap());
        assert!(store.get(&fp).unwrap().is_none());
    }

    #[test]
    fn test_contact_resets_probes() {
        let dir = tempdir().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();
        let p = profile(4);
        let fp = p.identity.fingerprint();
        store.upsert(&p).unwrap();

        store.record_failed_probe(&fp).unwrap();
        store.record_contact(&fp, 2000).unwrap();
        let loaded = store.get(&fp).unwrap().unwrap();
        assert_eq!(loaded.failed_probes, 0);
        assert_eq!(loaded.last_seen_ms, 2000);
    }

    #[test]
    fn test_latency_ema() {
        let mut p = profile(5);
        p.observe_latency(100.0);
        assert!((p.latency_ema_ms - 100.0).abs() < 1e-9);
        p.observe_latency(200.0);
        // 0.3 * 200 + 0.7 * 100 = 130
        assert!((p.latency_ema_ms - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_subnet_diversity_cap() {
        let mut div = SubnetDiversity::new();
        let subnet = Some([10, 1]);
        assert!(div.admit(3, subnet));
        assert!(div.admit(3, subnet));
        assert!(!div.admit(3, subnet));
        // Different bucket is unaffected
        assert!(div.admit(4, subnet));
        // Release frees a slot
        div.release(3, subnet);
        assert!(div.admit(3, subnet));
    }

    #[test]
    fn test_subnet16() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(subnet16(&ip), Some([203, 0]));
        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(subnet16(&v6), None);
    }
}
