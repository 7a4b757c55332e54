//! Signed, append-only credit ledger
//!
//! Credits are tracked locally — no blockchain, no global consensus.
//! Each entry links to its predecessor by hash and carries an Ed25519
//! signature, forming a linear chain any peer can challenge via the
//! published Merkle root.
//!
//! Earning formula: `credits = weight × quantity × multiplier`.
//!
//! Search is **never refused** for lack of credits — only its cost
//! changes through the NORMAL → GRACE → DEBT state machine.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use super::merkle::{self, MerkleProof};
use crate::crypto::{ContentHash, NodeKeys};

/// Grace window before debt mode begins
pub const GRACE_PERIOD_MS: u64 = 72 * 3600 * 1000;
/// Cost multiplier while in debt
pub const DEBT_COST_MULTIPLIER: f64 = 2.0;
/// LLM actions may contribute at most this share of total earnings
pub const LLM_CREDIT_CAP_RATIO: f64 = 0.60;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt ledger entry at sequence {0}")]
    Corrupt(u64),
    #[error("Ledger chain broken at sequence {0}")]
    ChainBroken(u64),
    #[error("Serialization failed")]
    Serde,
}

/// Creditable actions with their resource weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// Reference unit: one crawled page
    Crawl,
    /// Processing a remote peer's query
    QueryProcess,
    /// Hosting documents, per hour
    DocHosting,
    /// Network uptime, per hour
    NetworkUptime,
    /// Summarizing own pages, per page
    LlmOwn,
    /// Serving summaries to peers, per request
    LlmServe,
}

impl ActionType {
    pub fn weight(&self) -> f64 {
        match self {
            Self::Crawl => 1.0,
            Self::QueryProcess => 0.5,
            Self::DocHosting => 0.1,
            Self::NetworkUptime => 0.5,
            Self::LlmOwn => 1.5,
            Self::LlmServe => 2.0,
        }
    }

    pub fn is_llm(&self) -> bool {
        matches!(self, Self::LlmOwn | Self::LlmServe)
    }
}

/// Node credit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditState {
    Normal,
    Grace,
    Debt,
}

/// One chained ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEntry {
    pub seq: u64,
    pub action: ActionType,
    pub quantity: f64,
    pub weight: f64,
    pub multiplier: f64,
    /// Positive = earned, negative = spent
    pub credits: f64,
    pub timestamp_ms: u64,
    pub note: String,
    pub prev_hash: ContentHash,
    pub entry_hash: ContentHash,
    pub signature: Vec<u8>,
}

impl CreditEntry {
    /// Canonical bytes covered by the entry hash and signature
    fn signing_bytes(
        seq: u64,
        action: ActionType,
        quantity: f64,
        weight: f64,
        multiplier: f64,
        credits: f64,
        timestamp_ms: u64,
        note: &str,
        prev_hash: &ContentHash,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.push(match action {
            ActionType::Crawl => 0,
            ActionType::QueryProcess => 1,
            ActionType::DocHosting => 2,
            ActionType::NetworkUptime => 3,
            ActionType::LlmOwn => 4,
            ActionType::LlmServe => 5,
        });
        buf.extend_from_slice(&quantity.to_le_bytes());
        buf.extend_from_slice(&weight.to_le_bytes());
        buf.extend_from_slice(&multiplier.to_le_bytes());
        buf.extend_from_slice(&credits.to_le_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&(note.len() as u32).to_le_bytes());
        buf.extend_from_slice(note.as_bytes());
        buf.extend_from_slice(prev_hash.as_bytes());
        buf
    }
}

/// What a search costs right now
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchCharge {
    pub state: CreditState,
    pub cost: f64,
    pub balance_after: f64,
}

/// Ledger summary for the status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_earned: f64,
    pub total_spent: f64,
    pub balance: f64,
    pub contribution_score: f64,
    pub base_search_cost: f64,
    pub state: CreditState,
    pub grace_remaining_ms: Option<u64>,
    pub entry_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct Totals {
    earned: f64,
    spent: f64,
    llm_earned: f64,
    grace_start_ms: Option<u64>,
}

/// Sled-backed signed credit chain; single-task appender
pub struct CreditLedger {
    #[allow(dead_code)]
    db: Db,
    entries: Tree,
    meta: Tree,
    keys: std::sync::Arc<NodeKeys>,
    append_lock: Mutex<()>,
}

impl CreditLedger {
    pub fn open(path: impl AsRef<Path>, keys: std::sync::Arc<NodeKeys>) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        let entries = db.open_tree("entries")?;
        let meta = db.open_tree("meta")?;
        let ledger = Self {
            db,
            entries,
            meta,
            keys,
            append_lock: Mutex::new(()),
        };
        info!(entries = ledger.entries.len(), "credit ledger opened");
        Ok(ledger)
    }

    fn totals(&self) -> Totals {
        self.meta
            .get(b"totals")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_slice(&v).ok())
            .unwrap_or_default()
    }

    fn put_totals(&self, totals: Totals) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(&totals).map_err(|_| LedgerError::Serde)?;
        self.meta.insert(b"totals", bytes)?;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn entry(&self, seq: u64) -> Result<Option<CreditEntry>, LedgerError> {
        match self.entries.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|_| LedgerError::Corrupt(seq))?,
            )),
            None => Ok(None),
        }
    }

    fn last_hash(&self) -> Result<ContentHash, LedgerError> {
        let count = self.entry_count();
        if count == 0 {
            return Ok(ContentHash([0u8; 32]));
        }
        self.entry(count - 1)?
            .map(|e| e.entry_hash)
            .ok_or(LedgerError::ChainBroken(count - 1))
    }

    /// Append a signed entry for `credits` (positive earned, negative
    /// spent), updating the running totals
    fn append(
        &self,
        action: ActionType,
        quantity: f64,
        multiplier: f64,
        credits: f64,
        note: &str,
        now_ms: u64,
    ) -> Result<CreditEntry, LedgerError> {
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());

        let seq = self.entry_count();
        let prev_hash = self.last_hash()?;
        let weight = action.weight();

        let to_hash = CreditEntry::signing_bytes(
            seq, action, quantity, weight, multiplier, credits, now_ms, note, &prev_hash,
        );
        let entry_hash = ContentHash::from_data(&to_hash);
        let signature = self.keys.sign(entry_hash.as_bytes());

        let entry = CreditEntry {
            seq,
            action,
            quantity,
            weight,
            multiplier,
            credits,
            timestamp_ms: now_ms,
            note: note.to_string(),
            prev_hash,
            entry_hash,
            signature,
        };

        let bytes = serde_json::to_vec(&entry).map_err(|_| LedgerError::Serde)?;
        self.entries.insert(seq.to_be_bytes(), bytes)?;

        let mut totals = self.totals();
        if credits >= 0.0 {
            totals.earned += credits;
            if action.is_llm() {
                totals.llm_earned += credits;
            }
        } else {
            totals.spent += -credits;
        }
        // A positive balance clears grace and debt
        if totals.earned - totals.spent > 0.0 {
            totals.grace_start_ms = None;
        } else if totals.grace_start_ms.is_none() {
            totals.grace_start_ms = Some(now_ms);
        }
        self.put_totals(totals)?;

        Ok(entry)
    }

    /// Record an earning action.
    ///
    /// LLM earnings are capped so they never exceed
    /// [`LLM_CREDIT_CAP_RATIO`] of total earnings.
    pub fn record_action(
        &self,
        action: ActionType,
        quantity: f64,
        multiplier: f64,
        note: &str,
        now_ms: u64,
    ) -> Result<CreditEntry, LedgerError> {
        let mut credits = action.weight() * quantity * multiplier;

        if action.is_llm() {
            let totals = self.totals();
            // Largest c with (llm + c) ≤ ratio · (earned + c)
            let allowed = ((LLM_CREDIT_CAP_RATIO * totals.earned - totals.llm_earned)
                / (1.0 - LLM_CREDIT_CAP_RATIO))
                .max(0.0);
            if credits > allowed {
                warn!(
                    requested = credits,
                    allowed, "LLM credit share capped"
                );
                credits = allowed;
            }
        }

        self.append(action, quantity, multiplier, credits, note, now_ms)
    }

    pub fn balance(&self) -> f64 {
        let totals = self.totals();
        totals.earned - totals.spent
    }

    /// Cumulative contribution score (lifetime earnings)
    pub fn contribution_score(&self) -> f64 {
        self.totals().earned
    }

    /// Base search cost from the contributor tier
    pub fn base_search_cost(&self) -> f64 {
        let score = self.contribution_score();
        if score >= 1000.0 {
            0.033
        } else if score >= 100.0 {
            0.050
        } else {
            0.100
        }
    }

    /// Current credit state; GRACE times out into DEBT
    pub fn state(&self, now_ms: u64) -> CreditState {
        let totals = self.totals();
        if totals.earned - totals.spent > 0.0 {
            return CreditState::Normal;
        }
        match totals.grace_start_ms {
            Some(start) if now_ms.saturating_sub(start) <= GRACE_PERIOD_MS => CreditState::Grace,
            Some(_) => CreditState::Debt,
            // Balance exactly zero with no spend history yet
            None => CreditState::Normal,
        }
    }

    /// Charge one search. Never refuses; debt doubles the cost.
    pub fn charge_search(&self, now_ms: u64) -> Result<SearchCharge, LedgerError> {
        let state = self.state(now_ms);
        let cost = match state {
            CreditState::Debt => self.base_search_cost() * DEBT_COST_MULTIPLIER,
            _ => self.base_search_cost(),
        };
        self.append(
            ActionType::QueryProcess,
            1.0,
            1.0,
            -cost,
            "search",
            now_ms,
        )?;
        Ok(SearchCharge {
            state,
            cost,
            balance_after: self.balance(),
        })
    }

    pub fn stats(&self, now_ms: u64) -> LedgerStats {
        let totals = self.totals();
        let state = self.state(now_ms);
        let grace_remaining_ms = match (state, totals.grace_start_ms) {
            (CreditState::Grace, Some(start)) => {
                Some(GRACE_PERIOD_MS.saturating_sub(now_ms.saturating_sub(start)))
            }
            _ => None,
        };
        LedgerStats {
            total_earned: totals.earned,
            total_spent: totals.spent,
            balance: totals.earned - totals.spent,
            contribution_score: totals.earned,
            base_search_cost: self.base_search_cost(),
            state,
            grace_remaining_ms,
            entry_count: self.entry_count(),
        }
    }

    /// Verify the whole chain: hashes link, signatures verify
    pub fn verify_chain(&self) -> Result<(), LedgerError> {
        let mut prev = ContentHash([0u8; 32]);
        for seq in 0..self.entry_count() {
            let entry = self.entry(seq)?.ok_or(LedgerError::ChainBroken(seq))?;
            if entry.prev_hash != prev {
                return Err(LedgerError::ChainBroken(seq));
            }
            let to_hash = CreditEntry::signing_bytes(
                entry.seq,
                entry.action,
                entry.quantity,
                entry.weight,
                entry.multiplier,
                entry.credits,
                entry.timestamp_ms,
                &entry.note,
                &entry.prev_hash,
            );
            if ContentHash::from_data(&to_hash) != entry.entry_hash {
                return Err(LedgerError::ChainBroken(seq));
            }
            if !self.keys.verify(entry.entry_hash.as_bytes(), &entry.signature) {
                return Err(LedgerError::ChainBroken(seq));
            }
            prev = entry.entry_hash;
        }
        Ok(())
    }

    fn leaf_hashes(&self) -> Result<Vec<ContentHash>, LedgerError> {
        (0..self.entry_count())
            .map(|seq| {
                self.entry(seq)?
                    .map(|e| e.entry_hash)
                    .ok_or(LedgerError::ChainBroken(seq))
            })
            .collect()
    }

    /// Merkle root over the chain, for DHT publication
    pub fn merkle_root(&self) -> Result<Option<ContentHash>, LedgerError> {
        Ok(merkle::merkle_root(&self.leaf_hashes()?))
    }

    /// Inclusion proof answering a peer's challenge for entry `seq`
    pub fn merkle_proof(&self, seq: u64) -> Result<Option<MerkleProof>, LedgerError> {
        Ok(merkle::merkle_proof(&self.leaf_hashes()?, seq))
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.entries.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ledger() -> (tempfile::TempDir, CreditLedger) {
        let dir = tempdir().unwrap();
        let keys = Arc::new(NodeKeys::from_secret_bytes([1u8; 32]).unwrap());
        let ledger = CreditLedger::open(dir.path(), keys).unwrap();
        (dir, ledger)
    }

    #[test]
    fn test_crawl_earns_one_credit() {
        let (_dir, ledger) = ledger();
        ledger
            .record_action(ActionType::Crawl, 1.0, 1.0, "crawl page", 1000)
            .unwrap();
        assert!((ledger.balance() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_chain_links_and_verifies() {
        let (_dir, ledger) = ledger();
        for i in 0..5 {
            ledger
                .record_action(ActionType::Crawl, 1.0, 1.0, "crawl", 1000 + i)
                .unwrap();
        }
        ledger.verify_chain().unwrap();

        let e0 = ledger.entry(0).unwrap().unwrap();
        let e1 = ledger.entry(1).unwrap().unwrap();
        assert_eq!(e1.prev_hash, e0.entry_hash);
        assert_eq!(e0.prev_hash, ContentHash([0u8; 32]));
    }

    #[test]
    fn test_search_cost_tiers() {
        let (_dir, ledger) = ledger();
        assert!((ledger.base_search_cost() - 0.100).abs() < 1e-9);

        ledger
            .record_action(ActionType::Crawl, 150.0, 1.0, "bulk", 1000)
            .unwrap();
        assert!((ledger.base_search_cost() - 0.050).abs() < 1e-9);

        ledger
            .record_action(ActionType::Crawl, 900.0, 1.0, "bulk", 2000)
            .unwrap();
        assert!((ledger.base_search_cost() - 0.033).abs() < 1e-9);
    }

    #[test]
    fn test_grace_then_debt_then_recovery() {
        let (_dir, ledger) = ledger();
        let t0 = 1_000_000u64;

        // Zero balance, first search drives it negative → GRACE
        let charge = ledger.charge_search(t0).unwrap();
        assert!(charge.balance_after < 0.0);
        assert_eq!(ledger.state(t0 + 1), CreditState::Grace);

        // 72 h later without earning → DEBT, cost doubles
        let t1 = t0 + GRACE_PERIOD_MS + 1000;
        assert_eq!(ledger.state(t1), CreditState::Debt);
        let debt_charge = ledger.charge_search(t1).unwrap();
        assert_eq!(debt_charge.state, CreditState::Debt);
        assert!((debt_charge.cost - 0.2).abs() < 1e-9);

        // One crawl brings the balance positive → NORMAL
        ledger
            .record_action(ActionType::Crawl, 1.0, 1.0, "recovery", t1 + 1000)
            .unwrap();
        assert!(ledger.balance() > 0.0);
        assert_eq!(ledger.state(t1 + 2000), CreditState::Normal);
    }

    #[test]
    fn test_search_never_refused() {
        let (_dir, ledger) = ledger();
        // Deep in debt, searches still succeed
        for i in 0..50 {
            ledger.charge_search(1000 + i).unwrap();
        }
        assert!(ledger.balance() < 0.0);
        assert!(ledger.charge_search(100_000_000_000).is_ok());
    }

    #[test]
    fn test_llm_cap() {
        let (_dir, ledger) = ledger();
        ledger
            .record_action(ActionType::Crawl, 4.0, 1.0, "crawl", 1000)
            .unwrap();
        // Try to earn far beyond the 60 % share with LLM serving
        ledger
            .record_action(ActionType::LlmServe, 100.0, 1.0, "llm", 2000)
            .unwrap();

        let stats = ledger.stats(3000);
        let llm_share = (stats.total_earned - 4.0) / stats.total_earned;
        assert!(
            llm_share <= LLM_CREDIT_CAP_RATIO + 1e-9,
            "llm share {llm_share} exceeds cap"
        );
    }

    #[test]
    fn test_merkle_root_and_proof() {
        let (_dir, ledger) = ledger();
        for i in 0..7 {
            ledger
                .record_action(ActionType::Crawl, 1.0, 1.0, "crawl", 1000 + i)
                .unwrap();
        }
        let root = ledger.merkle_root().unwrap().unwrap();
        let proof = ledger.merkle_proof(3).unwrap().unwrap();
        let leaf = ledger.entry(3).unwrap().unwrap().entry_hash;
        assert!(merkle::verify_proof(&leaf, &proof, &root));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(NodeKeys::from_secret_bytes([2u8; 32]).unwrap());
        {
            let ledger = CreditLedger::open(dir.path(), Arc::clone(&keys)).unwrap();
            ledger
                .record_action(ActionType::Crawl, 3.0, 1.0, "crawl", 1000)
                .unwrap();
            ledger.flush().unwrap();
        }
        let ledger = CreditLedger::open(dir.path(), keys).unwrap();
        assert!((ledger.balance() - 3.0).abs() < 1e-9);
        ledger.verify_chain().unwrap();
    }
}
