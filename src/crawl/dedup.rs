//! Three-layer deduplication pipeline
//!
//! Applied in order, each layer short-circuiting on a hit:
//! 1. canonical URL already indexed
//! 2. exact content hash already seen (locally; the crawl engine also
//!    consults DHT attestations for remote copies)
//! 3. SimHash near-duplicate (Hamming ≤ 3) — the document is kept but
//!    grouped under the earliest copy and its keyword publications are
//!    suppressed
//!
//! Seen-state is persisted in sled; the SimHash index is rebuilt from
//! the persisted fingerprints on open.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use super::simhash::SimHashIndex;
use crate::crypto::ContentHash;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt dedup entry")]
    Corrupt,
}

/// Outcome of the dedup pipeline for a candidate document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// New content: index and publish
    Fresh,
    /// Canonical URL already indexed
    AlreadyIndexedUrl,
    /// Same content hash exists (reference pointer only, no new doc)
    ExactDuplicate { original_doc: u64 },
    /// Near-duplicate of an existing document: store grouped, suppress
    /// keyword publications
    NearDuplicate { group_doc: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct SeenUrl {
    canonical_url: String,
    content_hash: ContentHash,
    simhash: u64,
    doc_id: u64,
    crawled_at_ms: u64,
}

/// Persistent dedup state
pub struct DedupStore {
    #[allow(dead_code)]
    db: Db,
    /// url key hash → SeenUrl
    urls: Tree,
    /// content hash → doc id
    hashes: Tree,
    simhash_index: Mutex<SimHashIndex>,
}

impl DedupStore {
    /// Open the store and rebuild the in-memory SimHash index
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DedupError> {
        let db = sled::open(path)?;
        let urls = db.open_tree("seen_urls")?;
        let hashes = db.open_tree("content_hashes")?;

        let mut index = SimHashIndex::new();
        for item in urls.iter() {
            let (_, value) = item?;
            if let Ok(seen) = serde_json::from_slice::<SeenUrl>(&value) {
                if seen.simhash != 0 {
                    index.add(seen.doc_id, seen.simhash);
                }
            }
        }
        info!(urls = urls.len(), fingerprints = index.len(), "dedup store opened");

        Ok(Self {
            db,
            urls,
            hashes,
            simhash_index: Mutex::new(index),
        })
    }

    fn url_key(canonical_url: &str) -> [u8; 32] {
        *ContentHash::from_text(canonical_url).as_bytes()
    }

    /// Layer 1: has this canonical URL been indexed?
    pub fn is_url_seen(&self, canonical_url: &str) -> Result<bool, DedupError> {
        Ok(self.urls.contains_key(Self::url_key(canonical_url))?)
    }

    /// Layer 2: which document carries this exact content hash?
    pub fn doc_for_content(&self, hash: &ContentHash) -> Result<Option<u64>, DedupError> {
        match self.hashes.get(hash.as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| DedupError::Corrupt)?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Run layers 2–3 for content about to be indexed (layer 1 runs
    /// before fetch so duplicate URLs cost no bandwidth)
    pub fn check_content(
        &self,
        content_hash: &ContentHash,
        simhash: u64,
    ) -> Result<DedupVerdict, DedupError> {
        if let Some(original_doc) = self.doc_for_content(content_hash)? {
            return Ok(DedupVerdict::ExactDuplicate { original_doc });
        }

        if simhash != 0 {
            let index = self.simhash_index.lock().unwrap_or_else(|e| e.into_inner());
            let near = index.find_near(simhash);
            // Group under the earliest (smallest id) near-duplicate
            if let Some(group_doc) = near.into_iter().min() {
                return Ok(DedupVerdict::NearDuplicate { group_doc });
            }
        }

        Ok(DedupVerdict::Fresh)
    }

    /// Record an indexed document in all layers
    pub fn mark_indexed(
        &self,
        canonical_url: &str,
        content_hash: ContentHash,
        simhash: u64,
        doc_id: u64,
        crawled_at_ms: u64,
    ) -> Result<(), DedupError> {
        let seen = SeenUrl {
            canonical_url: canonical_url.to_string(),
            content_hash,
            simhash,
            doc_id,
            crawled_at_ms,
        };
        let value = serde_json::to_vec(&seen).map_err(|_| DedupError::Corrupt)?;
        self.urls.insert(Self::url_key(canonical_url), value)?;
        self.hashes
            .insert(content_hash.as_bytes(), &doc_id.to_le_bytes())?;

        if simhash != 0 {
            self.simhash_index
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add(doc_id, simhash);
        }
        Ok(())
    }

    /// Remove a document from all layers (takedown / purge)
    pub fn forget(&self, canonical_url: &str, content_hash: &ContentHash) -> Result<(), DedupError> {
        let key = Self::url_key(canonical_url);
        if let Some(bytes) = self.urls.get(key)? {
            if let Ok(seen) = serde_json::from_slice::<SeenUrl>(&bytes) {
                self.simhash_index
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(seen.doc_id, seen.simhash);
            }
        }
        self.urls.remove(key)?;
        self.hashes.remove(content_hash.as_bytes())?;
        Ok(())
    }

    pub fn url_count(&self) -> usize {
        self.urls.len()
    }

    pub fn flush(&self) -> Result<(), DedupError> {
        self.urls.flush()?;
        self.hashes.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::simhash::simhash;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_then_url_seen() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path()).unwrap();

        let url = "https://docs.example.org/intro";
        assert!(!store.is_url_seen(url).unwrap());

        let hash = ContentHash::from_text("body");
        store.mark_indexed(url, hash, 0, 1, 1000).unwrap();
        assert!(store.is_url_seen(url).unwrap());
    }

    #[test]
    fn test_exact_duplicate_detected() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path()).unwrap();

        let hash = ContentHash::from_text("identical body");
        store
            .mark_indexed("https://a.org/1", hash, 0, 10, 1000)
            .unwrap();

        let verdict = store.check_content(&hash, 0).unwrap();
        assert_eq!(verdict, DedupVerdict::ExactDuplicate { original_doc: 10 });
    }

    #[test]
    fn test_near_duplicate_groups_under_earliest() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path()).unwrap();

        let text = "a long enough piece of text about rust and distributed search engines";
        let fp = simhash(text);
        store
            .mark_indexed(
                "https://a.org/x",
                ContentHash::from_text(text),
                fp,
                5,
                1000,
            )
            .unwrap();

        // Same fingerprint, different content hash
        let other_hash = ContentHash::from_text("slightly different");
        let verdict = store.check_content(&other_hash, fp).unwrap();
        assert_eq!(verdict, DedupVerdict::NearDuplicate { group_doc: 5 });
    }

    #[test]
    fn test_fresh_content_passes() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path()).unwrap();
        let verdict = store
            .check_content(&ContentHash::from_text("new"), simhash("completely new text"))
            .unwrap();
        assert_eq!(verdict, DedupVerdict::Fresh);
    }

    #[test]
    fn test_simhash_index_rebuilt_on_open() {
        let dir = tempdir().unwrap();
        let text = "persistent fingerprint text for rebuild check across reopen";
        let fp = simhash(text);
        {
            let store = DedupStore::open(dir.path()).unwrap();
            store
                .mark_indexed(
                    "https://a.org/p",
                    ContentHash::from_text(text),
                    fp,
                    3,
                    1000,
                )
                .unwrap();
            store.flush().unwrap();
        }

        let store = DedupStore::open(dir.path()).unwrap();
        let verdict = store
            .check_content(&ContentHash::from_text("different"), fp)
            .unwrap();
        assert_eq!(verdict, DedupVerdict::NearDuplicate { group_doc: 3 });
    }

    #[test]
    fn test_forget_clears_all_layers() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path()).unwrap();

        let url = "https://a.org/gone";
        let text = "text to be taken down later on request";
        let hash = ContentHash::from_text(text);
        let fp = simhash(text);
        store.mark_indexed(url, hash, fp, 9, 1000).unwrap();

        store.forget(url, &hash).unwrap();
        assert!(!store.is_url_seen(url).unwrap());
        assert_eq!(store.check_content(&hash, fp).unwrap(), DedupVerdict::Fresh);
    }
}
