//! Unified trust scores
//!
//! ```text
//! trust = 0.15·uptime + 0.25·contribution + 0.40·audit_pass_rate
//!       + 0.20·summary_quality
//! ```
//!
//! Tiers: Trusted ≥ 0.8, Normal 0.5–0.8, Suspect 0.3–0.5, Untrusted
//! < 0.3. Three consecutive audit failures isolate a peer: its messages
//! are dropped and its DHT records are no longer served.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::Fingerprint;

pub const W_UPTIME: f64 = 0.15;
pub const W_CONTRIBUTION: f64 = 0.25;
pub const W_AUDIT: f64 = 0.40;
pub const W_SUMMARY: f64 = 0.20;

/// Uptime window for the windowed fraction
pub const UPTIME_WINDOW_MS: u64 = 7 * 24 * 3600 * 1000;
/// Contribution normalizer (raw score at which the signal saturates)
pub const MAX_CONTRIBUTION: f64 = 5000.0;
/// Consecutive audit failures that trigger isolation
pub const ISOLATION_THRESHOLD: u32 = 3;

/// Audit pass-rate deltas
pub const AUDIT_PASS_DELTA: f64 = 0.01;
pub const AUDIT_FAIL_DELTA: f64 = 0.2;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt trust entry")]
    Corrupt,
}

/// Trust tier classification. Ordered so that a later variant outranks
/// an earlier one (used by the DHT SELECT policy).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum TrustTier {
    Untrusted,
    Suspect,
    #[default]
    Normal,
    Trusted,
}

/// Map a numeric trust score to its tier
pub fn tier_of(score: f64) -> TrustTier {
    if score >= 0.8 {
        TrustTier::Trusted
    } else if score >= 0.5 {
        TrustTier::Normal
    } else if score >= 0.3 {
        TrustTier::Suspect
    } else {
        TrustTier::Untrusted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerRecord {
    /// (sample timestamp, seconds online since previous sample)
    uptime_samples: Vec<(u64, u64)>,
    contribution_raw: f64,
    audit_pass_rate: f64,
    summary_sum: f64,
    summary_count: u64,
    consecutive_audit_failures: u32,
    isolated: bool,
    strikes: u32,
    updated_at_ms: u64,
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self {
            uptime_samples: Vec::new(),
            contribution_raw: 0.0,
            // Unknown peers start at the neutral midpoint
            audit_pass_rate: 0.5,
            summary_sum: 0.0,
            summary_count: 0,
            consecutive_audit_failures: 0,
            isolated: false,
            strikes: 0,
            updated_at_ms: 0,
        }
    }
}

/// Computed trust profile for one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerTrust {
    pub peer: Fingerprint,
    pub uptime_fraction: f64,
    pub contribution: f64,
    pub audit_pass_rate: f64,
    pub summary_quality: f64,
    pub score: f64,
    pub tier: TrustTier,
    pub consecutive_audit_failures: u32,
    pub isolated: bool,
}

/// Pure score computation from the four signals
pub fn compute_score(
    uptime_fraction: f64,
    contribution_norm: f64,
    audit_pass_rate: f64,
    summary_quality: f64,
) -> f64 {
    W_UPTIME * uptime_fraction.clamp(0.0, 1.0)
        + W_CONTRIBUTION * contribution_norm.clamp(0.0, 1.0)
        + W_AUDIT * audit_pass_rate.clamp(0.0, 1.0)
        + W_SUMMARY * summary_quality.clamp(0.0, 1.0)
}

/// Sled-backed trust store
pub struct TrustStore {
    #[allow(dead_code)]
    db: Db,
    peers: Tree,
}

impl TrustStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrustError> {
        let db = sled::open(path)?;
        let peers = db.open_tree("peer_trust")?;
        Ok(Self { db, peers })
    }

    fn load(&self, peer: &Fingerprint) -> Result<PeerRecord, TrustError> {
        match self.peers.get(peer.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| TrustError::Corrupt),
            None => Ok(PeerRecord::default()),
        }
    }

    fn save(&self, peer: &Fingerprint, record: &PeerRecord) -> Result<(), TrustError> {
        let bytes = serde_json::to_vec(record).map_err(|_| TrustError::Corrupt)?;
        self.peers.insert(peer.as_bytes(), bytes)?;
        Ok(())
    }

    /// Record an uptime heartbeat: `online_secs` since the last sample
    pub fn record_uptime(
        &self,
        peer: &Fingerprint,
        online_secs: u64,
        now_ms: u64,
    ) -> Result<(), TrustError> {
        let mut record = self.load(peer)?;
        record.uptime_samples.push((now_ms, online_secs));
        record
            .uptime_samples
            .retain(|(ts, _)| now_ms.saturating_sub(*ts) <= UPTIME_WINDOW_MS);
        record.updated_at_ms = now_ms;
        self.save(peer, &record)
    }

    pub fn record_contribution(
        &self,
        peer: &Fingerprint,
        raw_score: f64,
        now_ms: u64,
    ) -> Result<(), TrustError> {
        let mut record = self.load(peer)?;
        record.contribution_raw = raw_score;
        record.updated_at_ms = now_ms;
        self.save(peer, &record)
    }

    pub fn record_summary_quality(
        &self,
        peer: &Fingerprint,
        quality: f64,
        now_ms: u64,
    ) -> Result<(), TrustError> {
        let mut record = self.load(peer)?;
        record.summary_sum += quality.clamp(0.0, 1.0);
        record.summary_count += 1;
        record.updated_at_ms = now_ms;
        self.save(peer, &record)
    }

    /// Outcome of one audit cycle against this peer
    pub fn record_audit_outcome(
        &self,
        peer: &Fingerprint,
        outcome: AuditOutcome,
        now_ms: u64,
    ) -> Result<PeerTrust, TrustError> {
        let mut record = self.load(peer)?;
        match outcome {
            AuditOutcome::Pass => {
                record.audit_pass_rate = (record.audit_pass_rate + AUDIT_PASS_DELTA).min(1.0);
                record.consecutive_audit_failures = 0;
            }
            AuditOutcome::Neutral => {}
            AuditOutcome::Fail => {
                record.audit_pass_rate = (record.audit_pass_rate - AUDIT_FAIL_DELTA).max(0.0);
                record.consecutive_audit_failures += 1;
                if record.consecutive_audit_failures >= ISOLATION_THRESHOLD && !record.isolated {
                    record.isolated = true;
                    warn!(peer = %peer, "peer isolated after consecutive audit failures");
                }
            }
        }
        record.updated_at_ms = now_ms;
        self.save(peer, &record)?;
        Ok(self.profile_from(*peer, &record, now_ms))
    }

    /// Protocol-violation strike; heavy strikers sink toward isolation
    pub fn record_strike(&self, peer: &Fingerprint, now_ms: u64) -> Result<u32, TrustError> {
        let mut record = self.load(peer)?;
        record.strikes += 1;
        record.updated_at_ms = now_ms;
        let strikes = record.strikes;
        self.save(peer, &record)?;
        Ok(strikes)
    }

    pub fn isolate(&self, peer: &Fingerprint, now_ms: u64) -> Result<(), TrustError> {
        let mut record = self.load(peer)?;
        record.isolated = true;
        record.updated_at_ms = now_ms;
        self.save(peer, &record)?;
        info!(peer = %peer, "peer isolated");
        Ok(())
    }

    /// Lift isolation after a successful re-audit
    pub fn unisolate(&self, peer: &Fingerprint, now_ms: u64) -> Result<(), TrustError> {
        let mut record = self.load(peer)?;
        record.isolated = false;
        record.consecutive_audit_failures = 0;
        record.updated_at_ms = now_ms;
        self.save(peer, &record)
    }

    pub fn is_isolated(&self, peer: &Fingerprint) -> bool {
        self.load(peer).map(|r| r.isolated).unwrap_or(false)
    }

    fn profile_from(&self, peer: Fingerprint, record: &PeerRecord, now_ms: u64) -> PeerTrust {
        let online_ms: u64 = record
            .uptime_samples
            .iter()
            .filter(|(ts, _)| now_ms.saturating_sub(*ts) <= UPTIME_WINDOW_MS)
            .map(|(_, secs)| secs * 1000)
            .sum();
        let uptime_fraction = (online_ms as f64 / UPTIME_WINDOW_MS as f64).min(1.0);
        let contribution = (record.contribution_raw / MAX_CONTRIBUTION).min(1.0);
        let summary_quality = if record.summary_count > 0 {
            record.summary_sum / record.summary_count as f64
        } else {
            0.5
        };
        let score = compute_score(
            uptime_fraction,
            contribution,
            record.audit_pass_rate,
            summary_quality,
        );
        PeerTrust {
            peer,
            uptime_fraction,
            contribution,
            audit_pass_rate: record.audit_pass_rate,
            summary_quality,
            score,
            tier: tier_of(score),
            consecutive_audit_failures: record.consecutive_audit_failures,
            isolated: record.isolated,
        }
    }

    /// The computed trust profile for a peer (defaults for strangers)
    pub fn profile(&self, peer: &Fingerprint, now_ms: u64) -> PeerTrust {
        let record = self.load(peer).unwrap_or_default();
        self.profile_from(*peer, &record, now_ms)
    }

    pub fn tier(&self, peer: &Fingerprint, now_ms: u64) -> TrustTier {
        self.profile(peer, now_ms).tier
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn flush(&self) -> Result<(), TrustError> {
        self.peers.flush()?;
        Ok(())
    }
}

/// How a completed audit cycle lands on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// All auditors matched the attestation
    Pass,
    /// Majority matched; re-check next cycle
    Neutral,
    /// Majority disagreed with the attestation
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    #[test]
    fn test_stranger_defaults_to_suspect_boundary() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let profile = store.profile(&fp(1), 1000);
        // 0.40·0.5 + 0.20·0.5 = 0.30 → Suspect boundary
        assert!((profile.score - 0.30).abs() < 1e-9);
        assert_eq!(profile.tier, TrustTier::Suspect);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(tier_of(0.85), TrustTier::Trusted);
        assert_eq!(tier_of(0.8), TrustTier::Trusted);
        assert_eq!(tier_of(0.6), TrustTier::Normal);
        assert_eq!(tier_of(0.5), TrustTier::Normal);
        assert_eq!(tier_of(0.4), TrustTier::Suspect);
        assert_eq!(tier_of(0.1), TrustTier::Untrusted);
    }

    #[test]
    fn test_tier_ordering_for_select() {
        assert!(TrustTier::Trusted > TrustTier::Normal);
        assert!(TrustTier::Normal > TrustTier::Suspect);
        assert!(TrustTier::Suspect > TrustTier::Untrusted);
    }

    #[test]
    fn test_audit_pass_raises_capped() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let peer = fp(2);

        for i in 0..60 {
            store
                .record_audit_outcome(&peer, AuditOutcome::Pass, 1000 + i)
                .unwrap();
        }
        let profile = store.profile(&peer, 10_000);
        assert!((profile.audit_pass_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_three_consecutive_fails_isolate() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let peer = fp(3);

        store
            .record_audit_outcome(&peer, AuditOutcome::Fail, 1)
            .unwrap();
        store
            .record_audit_outcome(&peer, AuditOutcome::Fail, 2)
            .unwrap();
        assert!(!store.is_isolated(&peer));

        let profile = store
            .record_audit_outcome(&peer, AuditOutcome::Fail, 3)
            .unwrap();
        assert!(profile.isolated);
        assert!(store.is_isolated(&peer));
    }

    #[test]
    fn test_pass_resets_failure_streak() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let peer = fp(4);

        store
            .record_audit_outcome(&peer, AuditOutcome::Fail, 1)
            .unwrap();
        store
            .record_audit_outcome(&peer, AuditOutcome::Fail, 2)
            .unwrap();
        store
            .record_audit_outcome(&peer, AuditOutcome::Pass, 3)
            .unwrap();
        store
            .record_audit_outcome(&peer, AuditOutcome::Fail, 4)
            .unwrap();
        assert!(!store.is_isolated(&peer));
    }

    #[test]
    fn test_uptime_window() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let peer = fp(5);

        let now = UPTIME_WINDOW_MS * 2;
        // Half the window online
        store
            .record_uptime(&peer, UPTIME_WINDOW_MS / 2000, now)
            .unwrap();
        let profile = store.profile(&peer, now);
        assert!((profile.uptime_fraction - 0.5).abs() < 0.01);

        // Old samples age out of the window
        let later = now + UPTIME_WINDOW_MS + 1000;
        store.record_uptime(&peer, 0, later).unwrap();
        let profile = store.profile(&peer, later);
        assert!(profile.uptime_fraction < 0.01);
    }

    #[test]
    fn test_unisolate_resets() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let peer = fp(6);
        for i in 0..3 {
            store
                .record_audit_outcome(&peer, AuditOutcome::Fail, i)
                .unwrap();
        }
        assert!(store.is_isolated(&peer));
        store.unisolate(&peer, 100).unwrap();
        assert!(!store.is_isolated(&peer));
        assert_eq!(store.profile(&peer, 100).consecutive_audit_failures, 0);
    }

    #[test]
    fn test_isolation_survives_reopen() {
        let dir = tempdir().unwrap();
        let peer = fp(7);
        {
            let store = TrustStore::open(dir.path()).unwrap();
            store.isolate(&peer, 1).unwrap();
            store.flush().unwrap();
        }
        let store = TrustStore::open(dir.path()).unwrap();
        assert!(store.is_isolated(&peer));
    }
}
