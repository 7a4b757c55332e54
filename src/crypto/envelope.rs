//! Signed record envelopes — the canonical wire wrapper
//!
//! Every record that crosses the network travels inside an `Envelope`
//! with a fixed binary layout:
//!
//! ```text
//! magic(4 = "IMSH") || ver(1) || peer_id(32) || nonce(u64 LE)
//!   || timestamp_ms(u64 LE) || payload_len(u32 LE) || payload || sig(64)
//! ```
//!
//! The Ed25519 signature covers `magic..payload`. Encoding is fully
//! deterministic — fixed field order, little-endian integers, explicit
//! length prefix — and never produced by a generic serializer.

use std::collections::HashMap;
use thiserror::Error;

use super::keys::{verify_with_key, NodeKeys};
use super::pow::{Fingerprint, PeerIdentity};

/// Wire magic: `IMSH`
pub const MAGIC: [u8; 4] = [0x49, 0x4D, 0x53, 0x48];
/// Wire format version
pub const WIRE_VERSION: u8 = 1;
/// Hard cap on a whole envelope
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;
/// Maximum tolerated clock skew between peers
pub const MAX_CLOCK_SKEW_MS: u64 = 300_000;

/// Fixed byte overhead of an envelope around its payload
pub const ENVELOPE_OVERHEAD: usize = 4 + 1 + 32 + 8 + 8 + 4 + 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Signature does not verify")]
    InvalidSignature,
    #[error("Envelope timestamp outside skew window ({age_ms} ms)")]
    StaleEnvelope { age_ms: u64 },
    #[error("Nonce {got} not greater than last accepted {last}")]
    ReplayNonce { got: u64, last: u64 },
    #[error("Peer identity fails proof-of-work difficulty {0}")]
    InsufficientPow(u32),
    #[error("Envelope exceeds {MAX_ENVELOPE_BYTES} bytes")]
    Oversize,
    #[error("Malformed envelope: {0}")]
    Malformed(&'static str),
}

/// A decoded signed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub peer_id: Fingerprint,
    pub nonce: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
}

impl Envelope {
    /// The byte span the signature covers
    fn signing_bytes(
        peer_id: &Fingerprint,
        nonce: u64,
        timestamp_ms: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_OVERHEAD - 64 + payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(peer_id.as_bytes());
        buf.extend_from_slice(&nonce.to_le_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Sign `payload` as `identity`, producing a wire-ready envelope
    pub fn sign(
        keys: &NodeKeys,
        identity: &PeerIdentity,
        nonce: u64,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Result<Self, EnvelopeError> {
        if ENVELOPE_OVERHEAD + payload.len() > MAX_ENVELOPE_BYTES {
            return Err(EnvelopeError::Oversize);
        }
        let peer_id = identity.fingerprint();
        let to_sign = Self::signing_bytes(&peer_id, nonce, timestamp_ms, &payload);
        let sig = keys.sign(&to_sign);
        let signature: [u8; 64] = sig
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::Malformed("signature length"))?;
        Ok(Self {
            peer_id,
            nonce,
            timestamp_ms,
            payload,
            signature,
        })
    }

    /// Serialize to canonical wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Self::signing_bytes(&self.peer_id, self.nonce, self.timestamp_ms, &self.payload);
        buf.extend_from_slice(&self.signature);
        buf
    }

    /// Parse canonical wire bytes. Applies the hard size cap before any
    /// allocation driven by attacker-controlled lengths.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(EnvelopeError::Oversize);
        }
        if bytes.len() < ENVELOPE_OVERHEAD {
            return Err(EnvelopeError::Malformed("short envelope"));
        }
        if bytes[0..4] != MAGIC {
            return Err(EnvelopeError::Malformed("bad magic"));
        }
        if bytes[4] != WIRE_VERSION {
            return Err(EnvelopeError::Malformed("unknown version"));
        }

        let mut peer = [0u8; 32];
        peer.copy_from_slice(&bytes[5..37]);

        let nonce = u64::from_le_bytes(bytes[37..45].try_into().unwrap());
        let timestamp_ms = u64::from_le_bytes(bytes[45..53].try_into().unwrap());
        let payload_len = u32::from_le_bytes(bytes[53..57].try_into().unwrap()) as usize;

        if ENVELOPE_OVERHEAD + payload_len != bytes.len() {
            return Err(EnvelopeError::Malformed("payload length mismatch"));
        }

        let payload = bytes[57..57 + payload_len].to_vec();
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[57 + payload_len..]);

        Ok(Self {
            peer_id: Fingerprint(peer),
            nonce,
            timestamp_ms,
            payload,
            signature,
        })
    }

    /// Verify signature, freshness, and PoW against the sender identity.
    ///
    /// Nonce monotonicity is the caller's job (see [`NonceTracker`]) so
    /// that verification stays side-effect free.
    pub fn verify(
        &self,
        sender: &PeerIdentity,
        pow_difficulty: u32,
        now_ms: u64,
    ) -> Result<(), EnvelopeError> {
        if sender.fingerprint() != self.peer_id {
            return Err(EnvelopeError::Malformed("peer id mismatch"));
        }
        if !sender.verify_pow(pow_difficulty) {
            return Err(EnvelopeError::InsufficientPow(pow_difficulty));
        }

        let age_ms = now_ms.abs_diff(self.timestamp_ms);
        if age_ms > MAX_CLOCK_SKEW_MS {
            return Err(EnvelopeError::StaleEnvelope { age_ms });
        }

        let to_verify =
            Self::signing_bytes(&self.peer_id, self.nonce, self.timestamp_ms, &self.payload);
        if !verify_with_key(&sender.public_key, &to_verify, &self.signature) {
            return Err(EnvelopeError::InvalidSignature);
        }
        Ok(())
    }
}

/// Monotonic nonce generator for outbound envelopes
#[derive(Debug, Default)]
pub struct NonceCounter {
    value: u64,
}

impl NonceCounter {
    pub fn new(start: u64) -> Self {
        Self { value: start }
    }

    pub fn next(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    pub fn current(&self) -> u64 {
        self.value
    }
}

/// Per-peer highest-nonce tracker for replay rejection
#[derive(Debug, Default)]
pub struct NonceTracker {
    highest: HashMap<Fingerprint, u64>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept iff `nonce > highest_seen(peer)`; records on success
    pub fn check_and_record(
        &mut self,
        peer: Fingerprint,
        nonce: u64,
    ) -> Result<(), EnvelopeError> {
        let last = self.highest.get(&peer).copied().unwrap_or(0);
        if nonce <= last {
            return Err(EnvelopeError::ReplayNonce { got: nonce, last });
        }
        self.highest.insert(peer, nonce);
        Ok(())
    }

    pub fn highest(&self, peer: &Fingerprint) -> u64 {
        self.highest.get(peer).copied().unwrap_or(0)
    }
}
