//! External tool surface
//!
//! The typed request/response boundary consumed by the MCP adapter and
//! admin tooling. Only contracts live here — transport belongs to the
//! external adapter.

use serde::{Deserialize, Serialize};

use crate::credits::CreditState;
use crate::governor::DegradationLevel;
use crate::index::RankedResult;

/// Hard cap on requested result counts
pub const MAX_SEARCH_LIMIT: usize = 50;
/// Maximum text returned by `fetch_page`
pub const MAX_FETCH_TEXT_BYTES: usize = 100 * 1024;
/// Crawl depth range accepted by `crawl_url`
pub const MAX_CRAWL_DEPTH: u8 = 3;

/// `search` / `search_local` input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
}

impl SearchRequest {
    /// Clamp the limit into [1, MAX_SEARCH_LIMIT]
    pub fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, MAX_SEARCH_LIMIT)
    }
}

/// Per-signal score breakdown, included on request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub bm25: f64,
    pub freshness: f64,
    pub trust: f64,
    pub authority: f64,
}

/// One search result on the tool surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores_breakdown: Option<ScoreBreakdown>,
}

impl SearchResultItem {
    pub fn from_ranked(result: &RankedResult, with_breakdown: bool) -> Self {
        Self {
            url: result.url.clone(),
            title: result.title.clone(),
            snippet: result.snippet.clone(),
            score: result.combined_score,
            scores_breakdown: with_breakdown.then(|| ScoreBreakdown {
                bm25: result.bm25_score,
                freshness: result.freshness_score,
                trust: result.trust_score,
                authority: result.authority_score,
            }),
        }
    }
}

/// `search` / `search_local` output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReply {
    pub results: Vec<SearchResultItem>,
    /// Some responders were unavailable; the list may be incomplete
    pub partial: bool,
}

/// `fetch_page` output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPageReply {
    /// Extracted text, truncated to [`MAX_FETCH_TEXT_BYTES`]
    pub text: String,
    pub is_cached: bool,
    pub crawl_time_ms: u64,
    pub source_url: String,
}

/// `crawl_url` input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: String,
    pub depth: u8,
    pub force: bool,
}

impl CrawlRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.depth > MAX_CRAWL_DEPTH {
            return Err(format!("depth {} exceeds {MAX_CRAWL_DEPTH}", self.depth));
        }
        Ok(())
    }
}

/// `crawl_url` output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlAck {
    pub accepted: bool,
    pub detail: String,
}

/// `status` output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub index_size: u64,
    pub peer_count: usize,
    pub credit_balance: f64,
    pub contribution_score: f64,
    pub credit_state: CreditState,
    pub degradation_level: DegradationLevel,
}

/// Truncate extracted text to the fetch_page cap on a char boundary
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let end = (0..=max_bytes)
        .rev()
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0);
    text[..end].to_string()
}
