//! Distributed search
//!
//! Query parsing and fingerprinting, the LRU/TTL result cache, and the
//! orchestrator that merges local and remote candidates under strict
//! deadlines.

pub mod cache;
pub mod orchestrator;
pub mod query;

pub use cache::{QueryCache, CACHE_CAPACITY, CACHE_TTL};
pub use orchestrator::{
    SearchConfig, SearchOrchestrator, SearchResponse, DEFAULT_FANOUT, QUERY_DEADLINE, RPC_DEADLINE,
};
pub use query::{normalize, parse, ParsedQuery, QueryFingerprint, MAX_QUERY_TERMS};
