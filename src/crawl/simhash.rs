//! SimHash near-duplicate fingerprints
//!
//! Charikar's algorithm over 3-word shingles: hash each shingle to 64
//! bits, accumulate a weighted bit vector, collapse by majority vote.
//! Two documents are near-duplicates when the Hamming distance between
//! their fingerprints is at most [`HAMMING_THRESHOLD`].

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Near-duplicate threshold
pub const HAMMING_THRESHOLD: u32 = 3;
/// Words per shingle
const SHINGLE_WIDTH: usize = 3;
/// In-memory index cap; oldest fingerprints evicted beyond this
const MAX_INDEX_ENTRIES: usize = 500_000;

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn shingles(words: &[String]) -> Vec<String> {
    if words.is_empty() {
        return Vec::new();
    }
    if words.len() < SHINGLE_WIDTH {
        return vec![words.join(" ")];
    }
    words
        .windows(SHINGLE_WIDTH)
        .map(|w| w.join(" "))
        .collect()
}

/// Hash a shingle to 64 bits (first 8 bytes of SHA-256)
fn hash64(data: &str) -> u64 {
    let digest = Sha256::digest(data.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// Compute the 64-bit SimHash fingerprint of a text
pub fn simhash(text: &str) -> u64 {
    let words = tokenize(text);
    let shingles = shingles(&words);
    if shingles.is_empty() {
        return 0;
    }

    let mut vector = [0i64; 64];
    for shingle in &shingles {
        let h = hash64(shingle);
        for (i, slot) in vector.iter_mut().enumerate() {
            if h & (1 << i) != 0 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }

    let mut fingerprint = 0u64;
    for (i, weight) in vector.iter().enumerate() {
        if *weight >= 0 {
            fingerprint |= 1 << i;
        }
    }
    fingerprint
}

/// Number of differing bits between two fingerprints
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Whether two fingerprints are near-duplicates
pub fn is_near_duplicate(a: u64, b: u64) -> bool {
    hamming_distance(a, b) <= HAMMING_THRESHOLD
}

/// In-memory fingerprint index for near-duplicate lookups.
///
/// Linear scan over unique fingerprints; fast enough below ~1M docs.
#[derive(Debug, Default)]
pub struct SimHashIndex {
    entries: HashMap<u64, Vec<u64>>,
    insertion_order: Vec<u64>,
}

impl SimHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a document's fingerprint; evicts oldest beyond the cap
    pub fn add(&mut self, doc_id: u64, fingerprint: u64) {
        while self.entries.len() >= MAX_INDEX_ENTRIES {
            if let Some(oldest) = self.insertion_order.first().copied() {
                self.insertion_order.remove(0);
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
        let slot = self.entries.entry(fingerprint).or_insert_with(|| {
            self.insertion_order.push(fingerprint);
            Vec::new()
        });
        slot.push(doc_id);
    }

    pub fn remove(&mut self, doc_id: u64, fingerprint: u64) {
        if let Some(ids) = self.entries.get_mut(&fingerprint) {
            ids.retain(|id| *id != doc_id);
            if ids.is_empty() {
                self.entries.remove(&fingerprint);
                self.insertion_order.retain(|fp| *fp != fingerprint);
            }
        }
    }

    /// Doc ids whose fingerprints are within the Hamming threshold
    pub fn find_near(&self, fingerprint: u64) -> Vec<u64> {
        let mut matches = Vec::new();
        for (stored, ids) in &self.entries {
            if hamming_distance(fingerprint, *stored) <= HAMMING_THRESHOLD {
                matches.extend(ids.iter().copied());
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_text_same_fingerprint() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(simhash(text), simhash(text));
    }

    #[test]
    fn test_similar_text_near_duplicate() {
        let a = simhash(
            "The quick brown fox jumps over the lazy dog and runs far away into the green forest \
             where tall trees grow beside the quiet river bank all day long",
        );
        let b = simhash(
            "The quick brown fox jumps over the lazy dog and runs far away into the green forest \
             where tall trees grow beside the quiet river bank all night long",
        );
        assert!(
            hamming_distance(a, b) <= 16,
            "one-word change should stay close, got {}",
            hamming_distance(a, b)
        );
    }

    #[test]
    fn test_different_text_far_apart() {
        let a = simhash("rust async programming with tokio executors and futures");
        let b = simhash("gardening tips for growing tomatoes in cold climates");
        assert!(hamming_distance(a, b) > HAMMING_THRESHOLD);
    }

    #[test]
    fn test_empty_text_zero() {
        assert_eq!(simhash(""), 0);
        assert_eq!(simhash("   \n\t "), 0);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0b1011, 0b0010), 2);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
    }

    #[test]
    fn test_index_finds_exact() {
        let mut index = SimHashIndex::new();
        let fp = simhash("some document text here");
        index.add(1, fp);
        assert_eq!(index.find_near(fp), vec![1]);
    }

    #[test]
    fn test_index_finds_within_threshold() {
        let mut index = SimHashIndex::new();
        let fp = 0b1111_0000u64;
        index.add(7, fp);
        // Flip three bits: still within threshold
        assert_eq!(index.find_near(fp ^ 0b0000_0111), vec![7]);
        // Four bits: out of range
        assert!(index.find_near(fp ^ 0b0000_1111).is_empty());
    }

    #[test]
    fn test_index_remove() {
        let mut index = SimHashIndex::new();
        index.add(1, 42);
        index.remove(1, 42);
        assert!(index.find_near(42).is_empty());
        assert!(index.is_empty());
    }
}
