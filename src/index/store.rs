//! Local full-text index
//!
//! Sled-backed inverted index with single-writer / many-reader
//! concurrency. Sled's log-structured tree gives WAL-style durability;
//! a mutex serializes writers while readers run against consistent
//! snapshots and never block.
//!
//! Per-document checksums catch on-disk corruption: a damaged document
//! is quarantined and the rest of the index keeps serving.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use super::bm25;
use super::tokenizer::Tokenizer;
use crate::crypto::ContentHash;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Document {0} not found")]
    NotFound(u64),
    #[error("Index entry checksum mismatch for document {0}; quarantined")]
    Corrupt(u64),
    #[error("Serialization failed")]
    Serde,
}

/// A locally indexed document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: u64,
    pub canonical_url: String,
    pub content_hash: ContentHash,
    pub raw_hash: ContentHash,
    pub title: String,
    pub text: String,
    pub language: String,
    pub crawl_time_ms: u64,
    pub simhash: u64,
    pub authority_score: f64,
    pub link_out: Vec<String>,
}

/// One search hit before ranking
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub doc_id: u64,
    pub bm25_score: f64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Posting {
    doc_id: u64,
    tf: u32,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy)]
struct IndexStats {
    doc_count: u64,
    total_tokens: u64,
}

/// The local index
pub struct LocalIndex {
    #[allow(dead_code)]
    db: Db,
    docs: Tree,
    postings: Tree,
    checksums: Tree,
    recent: Tree,
    urls: Tree,
    meta: Tree,
    tokenizer: Tokenizer,
    writer: Mutex<()>,
    quarantined: Mutex<HashSet<u64>>,
}

impl LocalIndex {
    /// Open or create the index at the given path
    pub fn open(path: impl AsRef<Path>, tokenizer: Tokenizer) -> Result<Self, IndexError> {
        let db = sled::open(path)?;
        let index = Self {
            docs: db.open_tree("docs")?,
            postings: db.open_tree("postings")?,
            checksums: db.open_tree("checksums")?,
            recent: db.open_tree("recent")?,
            urls: db.open_tree("urls")?,
            meta: db.open_tree("meta")?,
            db,
            tokenizer,
            writer: Mutex::new(()),
            quarantined: Mutex::new(HashSet::new()),
        };
        info!(
            docs = index.docs.len(),
            tokenizer = %tokenizer,
            "local index opened"
        );
        Ok(index)
    }

    fn stats(&self) -> IndexStats {
        self.meta
            .get(b"stats")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_slice(&v).ok())
            .unwrap_or_default()
    }

    fn put_stats(&self, stats: IndexStats) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec(&stats).map_err(|_| IndexError::Serde)?;
        self.meta.insert(b"stats", bytes)?;
        Ok(())
    }

    /// Allocate the next document id
    pub fn next_doc_id(&self) -> Result<u64, IndexError> {
        let id = self
            .meta
            .update_and_fetch(b"next_doc_id", |old| {
                let next = old
                    .and_then(|v| v.try_into().ok().map(u64::from_le_bytes))
                    .unwrap_or(0)
                    + 1;
                Some(next.to_le_bytes().to_vec())
            })?
            .and_then(|v| v.as_ref().try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(1);
        Ok(id)
    }

    /// Insert or replace a document and its postings.
    ///
    /// Upserting the same (doc_id, content_hash) twice is equivalent to
    /// once: old postings are removed before the new ones land.
    pub fn upsert(&self, doc: &Document) -> Result<(), IndexError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let tokens = self.tokenizer.tokenize(&doc.text);
        let token_count = tokens.len() as u64;

        let mut stats = self.stats();
        if let Some(old) = self.load_doc_unchecked(doc.doc_id)? {
            self.remove_postings(doc.doc_id, &old.text)?;
            self.recent.remove(recent_key(old.crawl_time_ms, old.doc_id))?;
            let old_tokens = self.tokenizer.tokenize(&old.text).len() as u64;
            stats.total_tokens = stats.total_tokens.saturating_sub(old_tokens);
        } else {
            stats.doc_count += 1;
        }
        stats.total_tokens += token_count;

        let doc_bytes = serde_json::to_vec(doc).map_err(|_| IndexError::Serde)?;
        let checksum = ContentHash::from_data(&doc_bytes);
        self.docs.insert(doc.doc_id.to_le_bytes(), doc_bytes)?;
        self.checksums
            .insert(doc.doc_id.to_le_bytes(), checksum.as_bytes())?;
        self.recent
            .insert(recent_key(doc.crawl_time_ms, doc.doc_id), &doc.doc_id.to_le_bytes())?;
        self.urls.insert(
            ContentHash::from_text(&doc.canonical_url).as_bytes(),
            &doc.doc_id.to_le_bytes(),
        )?;

        // Postings: term → [(doc_id, tf)]
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *tf.entry(token).or_insert(0) += 1;
        }
        for (term, count) in tf {
            let mut list = self.load_postings(&term)?;
            list.retain(|p| p.doc_id != doc.doc_id);
            list.push(Posting {
                doc_id: doc.doc_id,
                tf: count,
            });
            self.store_postings(&term, &list)?;
        }

        self.put_stats(stats)?;
        Ok(())
    }

    /// BM25 keyword search over the inverted index
    pub fn search_keywords(&self, terms: &[String], limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let stats = self.stats();
        if stats.doc_count == 0 {
            return Ok(Vec::new());
        }
        let avg_len = stats.total_tokens as f64 / stats.doc_count as f64;

        let mut scores: HashMap<u64, f64> = HashMap::new();
        for raw_term in terms {
            // Query terms pass through the same tokenizer as documents
            for term in self.tokenizer.tokenize(raw_term) {
                let postings = self.load_postings(&term)?;
                let df = postings.len() as u64;
                if df == 0 {
                    continue;
                }
                for posting in &postings {
                    let doc_len = self.doc_length(posting.doc_id)?;
                    let score = bm25::term_score(
                        posting.tf,
                        doc_len,
                        avg_len,
                        stats.doc_count,
                        df,
                    );
                    *scores.entry(posting.doc_id).or_insert(0.0) += score;
                }
            }
        }

        let quarantined = self.quarantined.lock().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<SearchHit> = scores
            .into_iter()
            .filter(|(doc_id, _)| !quarantined.contains(doc_id))
            .map(|(doc_id, bm25_score)| SearchHit { doc_id, bm25_score })
            .collect();
        hits.sort_by(|a, b| {
            b.bm25_score
                .partial_cmp(&a.bm25_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Fetch a document, verifying its checksum.
    ///
    /// A mismatch quarantines the entry ([`IndexError::Corrupt`]); the
    /// rest of the index keeps serving and the document is marked for
    /// re-crawl.
    pub fn get_doc(&self, doc_id: u64) -> Result<Document, IndexError> {
        let bytes = self
            .docs
            .get(doc_id.to_le_bytes())?
            .ok_or(IndexError::NotFound(doc_id))?;

        if let Some(stored) = self.checksums.get(doc_id.to_le_bytes())? {
            let actual = ContentHash::from_data(&bytes);
            if stored.as_ref() != actual.as_bytes() {
                warn!(doc_id, "checksum mismatch, quarantining document");
                self.quarantined
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(doc_id);
                return Err(IndexError::Corrupt(doc_id));
            }
        }

        serde_json::from_slice(&bytes).map_err(|_| IndexError::Corrupt(doc_id))
    }

    fn load_doc_unchecked(&self, doc_id: u64) -> Result<Option<Document>, IndexError> {
        match self.docs.get(doc_id.to_le_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            None => Ok(None),
        }
    }

    /// Look up a document by canonical URL
    pub fn get_by_url(&self, canonical_url: &str) -> Result<Option<Document>, IndexError> {
        let key = ContentHash::from_text(canonical_url);
        match self.urls.get(key.as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| IndexError::Serde)?;
                let doc_id = u64::from_le_bytes(arr);
                match self.get_doc(doc_id) {
                    Ok(doc) => Ok(Some(doc)),
                    Err(IndexError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            None => Ok(None),
        }
    }

    /// Document ids crawled at or after `since_ms`, oldest first
    pub fn iter_recent(&self, since_ms: u64) -> Result<Vec<u64>, IndexError> {
        let mut out = Vec::new();
        for item in self.recent.range(recent_key(since_ms, 0)..) {
            let (_, value) = item?;
            let arr: [u8; 8] = value.as_ref().try_into().map_err(|_| IndexError::Serde)?;
            out.push(u64::from_le_bytes(arr));
        }
        Ok(out)
    }

    /// Remove a document and its postings (takedown / purge)
    pub fn remove_doc(&self, doc_id: u64) -> Result<(), IndexError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let Some(doc) = self.load_doc_unchecked(doc_id)? else {
            return Ok(());
        };
        self.remove_postings(doc_id, &doc.text)?;
        self.docs.remove(doc_id.to_le_bytes())?;
        self.checksums.remove(doc_id.to_le_bytes())?;
        self.recent.remove(recent_key(doc.crawl_time_ms, doc_id))?;
        self.urls
            .remove(ContentHash::from_text(&doc.canonical_url).as_bytes())?;

        let mut stats = self.stats();
        stats.doc_count = stats.doc_count.saturating_sub(1);
        stats.total_tokens = stats
            .total_tokens
            .saturating_sub(self.tokenizer.tokenize(&doc.text).len() as u64);
        self.put_stats(stats)?;
        Ok(())
    }

    fn remove_postings(&self, doc_id: u64, text: &str) -> Result<(), IndexError> {
        let mut terms: HashSet<String> = HashSet::new();
        for token in self.tokenizer.tokenize(text) {
            terms.insert(token);
        }
        for term in terms {
            let mut list = self.load_postings(&term)?;
            list.retain(|p| p.doc_id != doc_id);
            if list.is_empty() {
                self.postings.remove(term.as_bytes())?;
            } else {
                self.store_postings(&term, &list)?;
            }
        }
        Ok(())
    }

    fn load_postings(&self, term: &str) -> Result<Vec<Posting>, IndexError> {
        match self.postings.get(term.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| IndexError::Serde),
            None => Ok(Vec::new()),
        }
    }

    fn store_postings(&self, term: &str, list: &[Posting]) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec(list).map_err(|_| IndexError::Serde)?;
        self.postings.insert(term.as_bytes(), bytes)?;
        Ok(())
    }

    fn doc_length(&self, doc_id: u64) -> Result<u32, IndexError> {
        // Cheap approximation: token count of the stored text
        match self.load_doc_unchecked(doc_id)? {
            Some(doc) => Ok(self.tokenizer.tokenize(&doc.text).len() as u32),
            None => Ok(0),
        }
    }

    /// Top-k terms of a document weighted by tf-idf against this index
    pub fn top_keywords(&self, text: &str, k: usize) -> Result<Vec<(String, f64)>, IndexError> {
        let stats = self.stats();
        let doc_count = stats.doc_count.max(1);

        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in self.tokenizer.tokenize(text) {
            *tf.entry(token).or_insert(0) += 1;
        }

        let mut weighted: Vec<(String, f64)> = tf
            .into_iter()
            .map(|(term, count)| {
                let df = self.load_postings(&term).map(|p| p.len() as u64).unwrap_or(0);
                let weight = f64::from(count) * bm25::idf(doc_count, df.max(1));
                (term, weight)
            })
            .collect();
        weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        weighted.truncate(k);
        Ok(weighted)
    }

    pub fn doc_count(&self) -> u64 {
        self.stats().doc_count
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn flush(&self) -> Result<(), IndexError> {
        self.docs.flush()?;
        self.postings.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}

fn recent_key(crawl_time_ms: u64, doc_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&crawl_time_ms.to_be_bytes());
    key[8..].copy_from_slice(&doc_id.to_be_bytes());
    key
}

/// Extract a snippet around the first matching term
pub fn make_snippet(text: &str, terms: &[String], max_len: usize) -> String {
    let lower = text.to_lowercase();
    let pos = terms
        .iter()
        .filter_map(|t| lower.find(&t.to_lowercase()))
        .min()
        .unwrap_or(0);

    // Window centered on the first hit, snapped to char boundaries
    let start_target = pos.saturating_sub(max_len / 4);
    let start = (0..=start_target)
        .rev()
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0);
    let end_target = (start + max_len).min(text.len());
    let end = (end_target..=text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());

    let mut snippet = text[start..end].trim().to_string();
    if start > 0 {
        snippet = format!("…{snippet}");
    }
    if end < text.len() {
        snippet = format!("{snippet}…");
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn doc(id: u64, url: &str, text: &str, crawled: u64) -> Document {
        Document {
            doc_id: id,
            canonical_url: url.to_string(),
            content_hash: ContentHash::from_text(text),
            raw_hash: ContentHash::from_text(text),
            title: format!("doc {id}"),
            text: text.to_string(),
            language: "en".into(),
            crawl_time_ms: crawled,
            simhash: 0,
            authority_score: 0.0,
            link_out: vec![],
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        let d = doc(1, "https://a.org/1", "rust async programming", 1000);
        index.upsert(&d).unwrap();

        let loaded = index.get_doc(1).unwrap();
        assert_eq!(loaded.canonical_url, d.canonical_url);
        assert_eq!(index.doc_count(), 1);
    }

    #[test]
    fn test_search_finds_relevant_doc() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        index
            .upsert(&doc(1, "https://a.org/rust", "rust systems programming language", 1000))
            .unwrap();
        index
            .upsert(&doc(2, "https://a.org/cook", "baking bread at home", 1000))
            .unwrap();

        let hits = index
            .search_keywords(&["rust".to_string()], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, 1);
        assert!(hits[0].bm25_score > 0.0);
    }

    #[test]
    fn test_upsert_idempotent() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        let d = doc(1, "https://a.org/1", "repeated upsert text", 1000);
        index.upsert(&d).unwrap();
        index.upsert(&d).unwrap();

        assert_eq!(index.doc_count(), 1);
        let hits = index
            .search_keywords(&["repeated".to_string()], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_remove_doc_clears_postings() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        index
            .upsert(&doc(1, "https://a.org/1", "ephemeral content here", 1000))
            .unwrap();
        index.remove_doc(1).unwrap();

        assert_eq!(index.doc_count(), 0);
        assert!(index
            .search_keywords(&["ephemeral".to_string()], 10)
            .unwrap()
            .is_empty());
        assert!(matches!(index.get_doc(1), Err(IndexError::NotFound(1))));
    }

    #[test]
    fn test_iter_recent_ordering() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        index.upsert(&doc(1, "https://a.org/1", "one", 1000)).unwrap();
        index.upsert(&doc(2, "https://a.org/2", "two", 3000)).unwrap();
        index.upsert(&doc(3, "https://a.org/3", "three", 2000)).unwrap();

        assert_eq!(index.iter_recent(2000).unwrap(), vec![3, 2]);
        assert_eq!(index.iter_recent(0).unwrap(), vec![1, 3, 2]);
    }

    #[test]
    fn test_get_by_url() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();
        index
            .upsert(&doc(7, "https://a.org/find-me", "locatable", 1000))
            .unwrap();

        assert_eq!(
            index.get_by_url("https://a.org/find-me").unwrap().unwrap().doc_id,
            7
        );
        assert!(index.get_by_url("https://a.org/missing").unwrap().is_none());
    }

    #[test]
    fn test_top_keywords() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        let top = index
            .top_keywords("rust rust rust tokio tokio sled", 2)
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "rust");
    }

    #[test]
    fn test_corruption_quarantine() {
        let dir = tempdir().unwrap();
        let index = LocalIndex::open(dir.path(), Tokenizer::Unicode61).unwrap();

        index
            .upsert(&doc(1, "https://a.org/1", "will be corrupted", 1000))
            .unwrap();
        index
            .upsert(&doc(2, "https://a.org/2", "stays healthy", 1000))
            .unwrap();

        // Corrupt doc 1 behind the checksum's back
        index
            .docs
            .insert(1u64.to_le_bytes(), b"{garbage".to_vec())
            .unwrap();

        assert!(matches!(index.get_doc(1), Err(IndexError::Corrupt(1))));
        // The rest of the index still serves
        assert!(index.get_doc(2).is_ok());
        assert_eq!(index.quarantined_count(), 1);
        // Quarantined docs drop out of search results
        let hits = index.search_keywords(&["corrupted".to_string()], 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_snippet() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let snippet = make_snippet(text, &["delta".to_string()], 20);
        assert!(snippet.contains("delta"));

        // No match: snippet from the start
        let fallback = make_snippet(text, &["missing".to_string()], 20);
        assert!(fallback.starts_with("alpha"));
    }
}
