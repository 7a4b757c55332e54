//! Proof-of-work bound peer identities
//!
//! A peer fingerprint is `SHA-256(pubkey || nonce_le)` and must show at
//! least `difficulty` leading zero bits. Admission cost makes Sybil
//! identities expensive while verification stays a single hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Default difficulty: 20 leading zero bits (~1M hash attempts)
pub const DEFAULT_POW_DIFFICULTY: u32 = 20;

/// 256-bit peer fingerprint; the first 160 bits double as the DHT node key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Count leading zero bits
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", &self.to_hex()[..8])
    }
}

/// A peer identity: public key plus the PoW nonce that admits it.
///
/// A peer is never created without a valid PoW; any record signed by an
/// unverified peer is discarded by the DHT validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub public_key: [u8; 32],
    pub pow_nonce: u64,
    pub created_at_ms: u64,
}

impl PeerIdentity {
    /// Derive the fingerprint for a (pubkey, nonce) pair
    pub fn derive_fingerprint(public_key: &[u8; 32], nonce: u64) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        hasher.update(nonce.to_le_bytes());
        Fingerprint(hasher.finalize().into())
    }

    /// This identity's fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        Self::derive_fingerprint(&self.public_key, self.pow_nonce)
    }

    /// Check the proof-of-work against a difficulty target
    pub fn verify_pow(&self, difficulty: u32) -> bool {
        self.fingerprint().leading_zero_bits() >= difficulty
    }

    /// Search for a nonce meeting `difficulty`.
    ///
    /// CPU-bound: callers on the async runtime must wrap this in
    /// `spawn_blocking`. At difficulty 20 this is ~1M hashes.
    pub fn mine(public_key: [u8; 32], difficulty: u32, created_at_ms: u64) -> Self {
        let mut nonce: u64 = 0;
        loop {
            let fp = Self::derive_fingerprint(&public_key, nonce);
            if fp.leading_zero_bits() >= difficulty {
                return Self {
                    public_key,
                    pow_nonce: nonce,
                    created_at_ms,
                };
            }
            nonce = nonce.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zero_bits() {
        let mut bytes = [0xFFu8; 32];
        assert_eq!(Fingerprint(bytes).leading_zero_bits(), 0);

        bytes[0] = 0x00;
        bytes[1] = 0x0F;
        assert_eq!(Fingerprint(bytes).leading_zero_bits(), 12);

        assert_eq!(Fingerprint([0u8; 32]).leading_zero_bits(), 256);
    }

    #[test]
    fn test_mine_meets_difficulty() {
        // Low difficulty keeps the test fast
        let identity = PeerIdentity::mine([7u8; 32], 8, 0);
        assert!(identity.verify_pow(8));
        assert!(identity.fingerprint().leading_zero_bits() >= 8);
    }

    #[test]
    fn test_wrong_nonce_fails_pow() {
        let mut identity = PeerIdentity::mine([9u8; 32], 8, 0);
        identity.pow_nonce = identity.pow_nonce.wrapping_add(1);
        // Overwhelmingly unlikely that the next nonce also meets 8 bits
        // and produces the same fingerprint the validator stored.
        let fp = identity.fingerprint();
        assert_ne!(fp, PeerIdentity::mine([9u8; 32], 8, 0).fingerprint());
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let identity = PeerIdentity::mine([1u8; 32], 4, 0);
        let fp = identity.fingerprint();
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
    }
}
