//! Query parsing and fingerprinting
//!
//! Queries are normalized, fingerprinted, and reduced to at most 16
//! keyword terms with English stop-words removed. Raw query strings
//! never leave the node — only keyword key hashes cross the network,
//! and logs record the fingerprint alone.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::crypto::ContentHash;
use crate::dht::Key;

/// Keyword terms extracted per query
pub const MAX_QUERY_TERMS: usize = 16;

/// English stop-words (the closed language set for stop-wording)
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have",
        "he", "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not",
        "of", "on", "or", "our", "she", "so", "that", "the", "their", "them", "then", "there",
        "these", "they", "this", "to", "was", "we", "were", "what", "when", "where", "which",
        "who", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// The cache key: `H(normalized_query)`. Queries themselves never
/// traverse the DHT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFingerprint(pub [u8; 32]);

impl QueryFingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

/// A parsed query ready for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub normalized: String,
    pub fingerprint: QueryFingerprint,
    pub terms: Vec<String>,
}

impl ParsedQuery {
    /// Keyword DHT keys for the fan-out (never the raw terms)
    pub fn keyword_keys(&self) -> Vec<Key> {
        self.terms.iter().map(|t| Key::for_keyword(t)).collect()
    }
}

/// Lowercase and collapse whitespace
pub fn normalize(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a raw query string
pub fn parse(query: &str) -> ParsedQuery {
    let normalized = normalize(query);
    let fingerprint = QueryFingerprint(*ContentHash::from_text(&normalized).as_bytes());

    let mut seen = HashSet::new();
    let terms: Vec<String> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .filter(|w| !STOP_WORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .take(MAX_QUERY_TERMS)
        .map(str::to_string)
        .collect();

    ParsedQuery {
        normalized,
        fingerprint,
        terms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_stable() {
        assert_eq!(normalize("  Python   ASYNCIO "), "python asyncio");
        assert_eq!(
            parse("Python Asyncio").fingerprint,
            parse("python  asyncio").fingerprint
        );
    }

    #[test]
    fn test_fingerprint_is_hash_of_normalized() {
        let parsed = parse("python asyncio");
        assert_eq!(
            parsed.fingerprint.0,
            *ContentHash::from_text("python asyncio").as_bytes()
        );
    }

    #[test]
    fn test_stop_words_removed() {
        let parsed = parse("the quick brown fox and the lazy dog");
        assert!(!parsed.terms.contains(&"the".to_string()));
        assert!(!parsed.terms.contains(&"and".to_string()));
        assert!(parsed.terms.contains(&"quick".to_string()));
        assert!(parsed.terms.contains(&"fox".to_string()));
    }

    #[test]
    fn test_term_cap_and_dedup() {
        let long: String = (0..40).map(|i| format!("term{i} ")).collect();
        assert_eq!(parse(&long).terms.len(), MAX_QUERY_TERMS);

        let dup = parse("rust rust rust tokio");
        assert_eq!(dup.terms, vec!["rust", "tokio"]);
    }

    #[test]
    fn test_keyword_keys_match_terms() {
        let parsed = parse("python asyncio");
        let keys = parsed.keyword_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], Key::for_keyword("python"));
        assert_eq!(keys[1], Key::for_keyword("asyncio"));
    }
}
