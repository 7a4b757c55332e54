//! Random audits — re-crawl and compare attestations
//!
//! About once an hour (jittered), a random (peer, url) target is drawn
//! from known attestations. Three auditors are elected by XOR closeness
//! to `H(target ‖ epoch)`; each re-crawls the URL independently and
//! signs what it observed. The majority observation is compared against
//! the target's attested hash:
//!
//! - 3/3 match → pass (+0.01 audit pass rate, capped)
//! - 2/3 match → neutral, re-check next cycle
//! - ≤1/3 match → fail (−0.2); three consecutive fails isolate

use rand::rngs::OsRng;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use super::score::AuditOutcome;
use crate::crypto::{keys::verify_with_key, ContentHash, Fingerprint, NodeKeys, PeerIdentity};
use crate::dht::keyspace::{closest_n, Key};
use crate::dht::records::{AuditReport, AuditorObservation};

/// Auditors elected per cycle
pub const AUDITORS_PER_CYCLE: usize = 3;
/// Base audit interval
pub const AUDIT_INTERVAL: Duration = Duration::from_secs(3600);
/// Jitter fraction applied to the interval (secure RNG)
pub const AUDIT_JITTER: f64 = 0.2;

/// An attestation eligible for auditing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTarget {
    pub peer: Fingerprint,
    pub canonical_url: String,
    pub attested_hash: ContentHash,
}

/// Next audit delay with ±20 % jitter from the OS RNG
pub fn next_audit_delay() -> Duration {
    let jitter = OsRng.gen_range(-AUDIT_JITTER..=AUDIT_JITTER);
    AUDIT_INTERVAL.mul_f64(1.0 + jitter)
}

/// Pick a random audit target with the OS RNG
pub fn pick_target(candidates: &[AuditTarget]) -> Option<AuditTarget> {
    if candidates.is_empty() {
        return None;
    }
    let index = OsRng.gen_range(0..candidates.len());
    Some(candidates[index].clone())
}

/// Elect the auditors for a target at an epoch: the peers closest to
/// `H(target_peer ‖ url ‖ epoch)`, excluding the target itself.
pub fn elect_auditors(
    target: &AuditTarget,
    epoch: u64,
    known_peers: &[Fingerprint],
) -> Vec<Fingerprint> {
    let election_key = Key::for_audit_election(&target.peer, &target.canonical_url, epoch);
    let eligible: Vec<Fingerprint> = known_peers
        .iter()
        .copied()
        .filter(|p| *p != target.peer)
        .collect();
    closest_n(&election_key, &eligible, AUDITORS_PER_CYCLE)
}

/// Canonical bytes an auditor signs over its observation
fn observation_bytes(
    target_peer: &Fingerprint,
    url: &str,
    observed: &ContentHash,
    epoch: u64,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(target_peer.as_bytes());
    buf.extend_from_slice(url.as_bytes());
    buf.extend_from_slice(observed.as_bytes());
    buf.extend_from_slice(&epoch.to_le_bytes());
    buf
}

/// Sign this node's observation of a target URL
pub fn sign_observation(
    keys: &NodeKeys,
    identity: &PeerIdentity,
    target: &AuditTarget,
    observed: ContentHash,
    epoch: u64,
) -> AuditorObservation {
    let bytes = observation_bytes(&target.peer, &target.canonical_url, &observed, epoch);
    AuditorObservation {
        auditor: identity.fingerprint(),
        observed_hash: observed,
        signature: keys.sign(&bytes),
    }
}

/// Verify one observation signature against its auditor's public key
pub fn verify_observation(
    observation: &AuditorObservation,
    auditor_pubkey: &[u8; 32],
    target: &AuditTarget,
    epoch: u64,
) -> bool {
    let bytes = observation_bytes(
        &target.peer,
        &target.canonical_url,
        &observation.observed_hash,
        epoch,
    );
    verify_with_key(auditor_pubkey, &bytes, &observation.signature)
}

/// Result of evaluating a completed audit cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvaluation {
    pub majority_hash: ContentHash,
    pub matching: usize,
    pub total: usize,
    pub outcome: AuditOutcome,
    /// Auditors (or the target) whose observation disagreed with the
    /// majority — marked suspect for bias tracking
    pub outliers: Vec<Fingerprint>,
}

/// Evaluate observations against the target's attested hash.
///
/// The majority is the mode of at least [`AUDITORS_PER_CYCLE`]
/// independent observations; fewer observations yield no verdict.
pub fn evaluate(
    attested_hash: &ContentHash,
    target_peer: &Fingerprint,
    observations: &[AuditorObservation],
) -> Option<AuditEvaluation> {
    if observations.len() < AUDITORS_PER_CYCLE {
        return None;
    }

    let mut counts: HashMap<ContentHash, usize> = HashMap::new();
    for obs in observations {
        *counts.entry(obs.observed_hash).or_insert(0) += 1;
    }
    // Mode; deterministic tie-break on the hash bytes
    let (majority_hash, _) = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(h, c)| (*h, *c))?;

    let matching = observations
        .iter()
        .filter(|o| o.observed_hash == *attested_hash)
        .count();
    let total = observations.len();

    let outcome = if matching == total {
        AuditOutcome::Pass
    } else if matching * 3 >= total * 2 {
        AuditOutcome::Neutral
    } else {
        AuditOutcome::Fail
    };

    let mut outliers: Vec<Fingerprint> = observations
        .iter()
        .filter(|o| o.observed_hash != majority_hash)
        .map(|o| o.auditor)
        .collect();
    if *attested_hash != majority_hash {
        outliers.push(*target_peer);
    }

    Some(AuditEvaluation {
        majority_hash,
        matching,
        total,
        outcome,
        outliers,
    })
}

/// Assemble the publishable report from a completed cycle
pub fn build_report(
    target: &AuditTarget,
    evaluation: &AuditEvaluation,
    observations: Vec<AuditorObservation>,
    timestamp_ms: u64,
) -> AuditReport {
    AuditReport {
        target_peer: target.peer,
        target_url: target.canonical_url.clone(),
        attested_hash: target.attested_hash,
        majority_hash: evaluation.majority_hash,
        observations,
        timestamp_ms,
    }
}

/// Collects observations for cycles this node aggregates.
///
/// The lowest-fingerprint elected auditor acts as aggregator: the other
/// auditors deliver their signed observations to it, and once the
/// quorum is complete the evaluation fires.
#[derive(Debug, Default)]
pub struct AuditCollector {
    cycles: std::sync::Mutex<
        std::collections::HashMap<(Fingerprint, String, u64), (AuditTarget, Vec<AuditorObservation>)>,
    >,
}

impl AuditCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cycle this node aggregates
    pub fn open_cycle(&self, target: AuditTarget, epoch: u64) {
        let mut cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        cycles
            .entry((target.peer, target.canonical_url.clone(), epoch))
            .or_insert((target, Vec::new()));
    }

    /// Add an observation; returns the completed evaluation once the
    /// quorum is reached, and None before (or for unknown cycles).
    pub fn add_observation(
        &self,
        target_peer: Fingerprint,
        target_url: &str,
        epoch: u64,
        observation: AuditorObservation,
    ) -> Option<(AuditTarget, AuditEvaluation, Vec<AuditorObservation>)> {
        let mut cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        let key = (target_peer, target_url.to_string(), epoch);
        let (target, observations) = cycles.get_mut(&key)?;

        if observations.iter().any(|o| o.auditor == observation.auditor) {
            return None;
        }
        observations.push(observation);

        if observations.len() < AUDITORS_PER_CYCLE {
            return None;
        }
        let evaluation = evaluate(&target.attested_hash, &target.peer, observations)?;
        let (target, observations) = cycles.remove(&key)?;
        Some((target, evaluation, observations))
    }

    /// Drop cycles that never reached quorum
    pub fn expire(&self) {
        // Cycles are keyed by epoch; a new epoch simply opens new keys.
        // Bound memory by clearing everything older than the map cap.
        let mut cycles = self.cycles.lock().unwrap_or_else(|e| e.into_inner());
        if cycles.len() > 1024 {
            cycles.clear();
        }
    }
}
