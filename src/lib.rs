//! meshseek — decentralized peer-to-peer web search
//!
//! Every peer is simultaneously a crawler, an indexer, a search
//! responder, and a routing node:
//! - Pages are crawled politely under advisory DHT locks and attested
//!   with signed content hashes
//! - A Kademlia-style overlay carries signed index pointers, crawl
//!   locks, attestations, takedown records, and ledger roots
//! - Search runs local-first with latency-aware remote fan-out, BM25 +
//!   freshness + trust + authority ranking, and an LRU/TTL cache
//! - A trust kernel audits attestations by random re-crawl quorums and
//!   isolates peers that fail repeatedly
//! - Contribution is accounted in a signed local credit ledger with
//!   Merkle-root challenges; search is never refused, only repriced

pub mod api;
pub mod config;
pub mod crawl;
pub mod credits;
pub mod crypto;
pub mod dht;
pub mod errors;
pub mod governor;
pub mod index;
pub mod node;
pub mod search;
pub mod trust;

// Re-export commonly used types
pub use api::{CrawlAck, CrawlRequest, FetchPageReply, SearchReply, SearchRequest, StatusReply};
pub use config::{ConfigError, MeshConfig};
pub use crypto::{ContentHash, Fingerprint, NodeKeys, PeerIdentity};
pub use errors::MeshError;
pub use node::MeshNode;

// Re-export subsystem surfaces
pub use crawl::{CrawlEngine, CrawlOutcome};
pub use credits::{CreditLedger, CreditState};
pub use dht::{DhtHandle, Key, RecordPayload};
pub use governor::{DegradationLevel, Profile};
pub use index::{Document, LocalIndex, RankedResult, Tokenizer};
pub use search::{SearchOrchestrator, SearchResponse};
pub use trust::{TrustStore, TrustTier};
