//! Credit ledger and incentive accounting
//!
//! Signed append-only chain of credit entries, Merkle challenges, the
//! contributor cost tiers, and the NORMAL/GRACE/DEBT state machine.

pub mod ledger;
pub mod merkle;
pub mod scheduling;

pub use ledger::{
    ActionType, CreditEntry, CreditLedger, CreditState, LedgerError, LedgerStats, SearchCharge,
    DEBT_COST_MULTIPLIER, GRACE_PERIOD_MS, LLM_CREDIT_CAP_RATIO,
};
pub use merkle::{merkle_proof, merkle_root, verify_proof, MerkleProof, ProofStep};
pub use scheduling::{llm_multiplier, GeoCheck, OffPeakWindow, OFF_PEAK_MULTIPLIER};
