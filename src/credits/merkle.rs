//! Merkle tree over ledger entries
//!
//! The ledger's Merkle root is periodically published to the DHT so any
//! peer can challenge it by requesting an inclusion proof for a
//! specific entry index. Proof verification is a pure function.

use crate::crypto::ContentHash;
use sha2::{Digest, Sha256};

/// One step in an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: ContentHash,
    /// Whether the sibling sits to the left of the running hash
    pub sibling_is_left: bool,
}

/// An inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub steps: Vec<ProofStep>,
}

fn hash_pair(left: &ContentHash, right: &ContentHash) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    ContentHash(hasher.finalize().into())
}

/// Compute the Merkle root of a list of leaf hashes.
///
/// Odd nodes are promoted unchanged (no duplication), so a single leaf
/// is its own root.
pub fn merkle_root(leaves: &[ContentHash]) -> Option<ContentHash> {
    if leaves.is_empty() {
        return None;
    }
    let mut level: Vec<ContentHash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(hash_pair(left, right)),
                [single] => next.push(*single),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    Some(level[0])
}

/// Build the inclusion proof for `leaf_index`
pub fn merkle_proof(leaves: &[ContentHash], leaf_index: u64) -> Option<MerkleProof> {
    let mut index = usize::try_from(leaf_index).ok()?;
    if index >= leaves.len() {
        return None;
    }

    let mut steps = Vec::new();
    let mut level: Vec<ContentHash> = leaves.to_vec();

    while level.len() > 1 {
        let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
        if sibling_index < level.len() {
            steps.push(ProofStep {
                sibling: level[sibling_index],
                sibling_is_left: sibling_index < index,
            });
        }

        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(hash_pair(left, right)),
                [single] => next.push(*single),
                _ => unreachable!(),
            }
        }
        index /= 2;
        level = next;
    }

    Some(MerkleProof { leaf_index, steps })
}

/// Verify an inclusion proof against a root
pub fn verify_proof(leaf: &ContentHash, proof: &MerkleProof, root: &ContentHash) -> bool {
    let mut running = *leaf;
    for step in &proof.steps {
        running = if step.sibling_is_left {
            hash_pair(&step.sibling, &running)
        } else {
            hash_pair(&running, &step.sibling)
        };
    }
    running == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<ContentHash> {
        (0..n).map(|i| ContentHash::from_data(&[i])).collect()
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l), Some(l[0]));
    }

    #[test]
    fn test_empty_has_no_root() {
        assert_eq!(merkle_root(&[]), None);
    }

    #[test]
    fn test_root_changes_with_any_leaf() {
        let a = leaves(4);
        let mut b = a.clone();
        b[2] = ContentHash::from_data(b"tampered");
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn test_all_proofs_verify() {
        for n in [1u8, 2, 3, 4, 5, 8, 13] {
            let l = leaves(n);
            let root = merkle_root(&l).unwrap();
            for i in 0..n as u64 {
                let proof = merkle_proof(&l, i).unwrap();
                assert!(
                    verify_proof(&l[i as usize], &proof, &root),
                    "proof failed for leaf {i} of {n}"
                );
            }
        }
    }

    #[test]
    fn test_tampered_leaf_fails_proof() {
        let l = leaves(8);
        let root = merkle_root(&l).unwrap();
        let proof = merkle_proof(&l, 3).unwrap();
        let fake = ContentHash::from_data(b"forged entry");
        assert!(!verify_proof(&fake, &proof, &root));
    }

    #[test]
    fn test_out_of_range_proof() {
        let l = leaves(4);
        assert!(merkle_proof(&l, 4).is_none());
    }
}
