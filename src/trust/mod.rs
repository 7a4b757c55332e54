//! Trust and incentive kernel
//!
//! Content attestations, random three-auditor re-crawl audits, the
//! unified trust score with tier-driven isolation, and durable
//! takedown/deletion obligations.

pub mod attestation;
pub mod audit;
pub mod score;
pub mod takedown;

pub use attestation::{build_attestation, AttestationCache};
pub use audit::{
    build_report, elect_auditors, evaluate, next_audit_delay, pick_target, sign_observation,
    verify_observation, AuditCollector, AuditEvaluation, AuditTarget, AUDITORS_PER_CYCLE,
};
pub use score::{
    compute_score, tier_of, AuditOutcome, PeerTrust, TrustError, TrustStore, TrustTier,
    ISOLATION_THRESHOLD,
};
pub use takedown::{TakedownError, TakedownStore, COMPLIANCE_WINDOW_MS};
