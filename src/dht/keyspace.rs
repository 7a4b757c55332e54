//! 160-bit DHT keyspace: key derivation and XOR distance
//!
//! Keys are the first 160 bits of a SHA-256 digest. Keyword pointers
//! live under `H(keyword)`; attestations and crawl locks under
//! `H(canonical_url)` with a domain-separating suffix so the three
//! record families never collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::crypto::Fingerprint;

/// Kademlia key width in bytes (160 bits)
pub const KEY_BYTES: usize = 20;

/// A point in the 160-bit keyspace
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub [u8; KEY_BYTES]);

impl Key {
    /// Hash arbitrary bytes into the keyspace
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; KEY_BYTES];
        out.copy_from_slice(&digest[..KEY_BYTES]);
        Self(out)
    }

    /// Key for a keyword's pointer set (term is lowercased first)
    pub fn for_keyword(term: &str) -> Self {
        Self::hash(term.to_lowercase().as_bytes())
    }

    /// Key for a URL's attestation records
    pub fn for_attestation(canonical_url: &str) -> Self {
        let mut data = canonical_url.as_bytes().to_vec();
        data.extend_from_slice(b"::attest");
        Self::hash(&data)
    }

    /// Key for a URL's crawl lock
    pub fn for_lock(canonical_url: &str) -> Self {
        let mut data = canonical_url.as_bytes().to_vec();
        data.extend_from_slice(b"::lock");
        Self::hash(&data)
    }

    /// Key for an audit election epoch: `H(target_peer || url || epoch)`
    pub fn for_audit_election(target_peer: &Fingerprint, url: &str, epoch: u64) -> Self {
        let mut data = target_peer.as_bytes().to_vec();
        data.extend_from_slice(url.as_bytes());
        data.extend_from_slice(&epoch.to_le_bytes());
        Self::hash(&data)
    }

    /// Key under which a peer publishes its credit ledger root
    pub fn for_ledger_root(peer: &Fingerprint) -> Self {
        let mut data = peer.as_bytes().to_vec();
        data.extend_from_slice(b"::ledger");
        Self::hash(&data)
    }

    /// A peer's own location in the keyspace (first 160 bits of its
    /// fingerprint)
    pub fn from_fingerprint(fp: &Fingerprint) -> Self {
        let mut out = [0u8; KEY_BYTES];
        out.copy_from_slice(&fp.as_bytes()[..KEY_BYTES]);
        Self(out)
    }

    /// XOR distance to another key
    pub fn distance(&self, other: &Key) -> Distance {
        let mut out = [0u8; KEY_BYTES];
        for i in 0..KEY_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}...)", &self.to_hex()[..8])
    }
}

/// XOR distance between two keys; compares as a big-endian integer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; KEY_BYTES]);

impl Distance {
    /// Index of the highest set bit (0..160), or None for zero distance.
    /// This is the classic Kademlia bucket index.
    pub fn bucket_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((KEY_BYTES - 1 - i) * 8 + bit);
            }
        }
        None
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({}...)", &hex::encode(self.0)[..8])
    }
}

/// Sort `peers` by XOR distance to `target` and keep the closest `n`.
///
/// Ownership rule: a peer owns a URL iff it appears among the N closest
/// fingerprints to the URL's key.
pub fn closest_n(target: &Key, peers: &[Fingerprint], n: usize) -> Vec<Fingerprint> {
    let mut sorted: Vec<(Distance, Fingerprint)> = peers
        .iter()
        .map(|fp| (Key::from_fingerprint(fp).distance(target), *fp))
        .collect();
    sorted.sort();
    sorted.into_iter().take(n).map(|(_, fp)| fp).collect()
}

/// Whether `own` is among the `n` closest of `peers ∪ {own}` to `target`
pub fn owns_key(target: &Key, own: &Fingerprint, peers: &[Fingerprint], n: usize) -> bool {
    let mut all = peers.to_vec();
    if !all.contains(own) {
        all.push(*own);
    }
    closest_n(target, &all, n).contains(own)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let k = Key::hash(b"x");
        assert_eq!(k.distance(&k), Distance([0u8; KEY_BYTES]));
        assert_eq!(k.distance(&k).bucket_index(), None);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Key::hash(b"a");
        let b = Key::hash(b"b");
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_keyword_and_attest_keys_differ() {
        let url = "https://example.org/page";
        assert_ne!(Key::for_attestation(url), Key::for_lock(url));
        assert_ne!(Key::for_keyword(url), Key::for_attestation(url));
    }

    #[test]
    fn test_keyword_key_case_insensitive() {
        assert_eq!(Key::for_keyword("Rust"), Key::for_keyword("rust"));
    }

    #[test]
    fn test_closest_n_orders_by_distance() {
        let target = Key::from_fingerprint(&fp(0));
        let peers = vec![fp(0x01), fp(0x80), fp(0x02)];
        let closest = closest_n(&target, &peers, 2);
        assert_eq!(closest.len(), 2);
        // 0x01.. and 0x02.. are closer to 0x00.. than 0x80..
        assert!(closest.contains(&fp(0x01)));
        assert!(closest.contains(&fp(0x02)));
    }

    #[test]
    fn test_owns_key() {
        let target = Key::from_fingerprint(&fp(0));
        let own = fp(0x01);
        let peers = vec![fp(0x80), fp(0x81), fp(0x82)];
        assert!(owns_key(&target, &own, &peers, 3));

        let far = fp(0xFF);
        let near_peers = vec![fp(0x01), fp(0x02), fp(0x03)];
        assert!(!owns_key(&target, &far, &near_peers, 3));
    }

    #[test]
    fn test_bucket_index() {
        let zero = Key([0u8; KEY_BYTES]);
        let mut one = [0u8; KEY_BYTES];
        one[KEY_BYTES - 1] = 1;
        assert_eq!(zero.distance(&Key(one)).bucket_index(), Some(0));

        let mut top = [0u8; KEY_BYTES];
        top[0] = 0x80;
        assert_eq!(zero.distance(&Key(top)).bucket_index(), Some(159));
    }
}
