//! The closed crate-level error sum
//!
//! Every failure surfaced across a component boundary is one of these
//! kinds; callers dispatch on the kind, never on message text. Raw
//! internal diagnostics are never exposed to remote peers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    /// SSRF, URL scheme, robots-deny, size overflow, unsupported
    /// content. Logged, surfaced, never retried.
    #[error("Input rejected: {0}")]
    InputRejected(String),

    /// HTTP 5xx, connection reset, stream timeout. Retried with
    /// backoff up to the cap.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Bad signature, stale envelope, replay, schema failure. The
    /// message is dropped and the peer penalized; never a crash.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// QPM, concurrency, bandwidth, or disk exhaustion. Rejected with
    /// BUSY; the caller may retry later.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Peer isolated or tier too low. Dropped silently inbound; empty
    /// result outbound.
    #[error("Trust denied")]
    TrustDenied,

    /// Index checksum failure. The affected range is quarantined and
    /// the rest keeps serving.
    #[error("Local corruption: {0}")]
    LocalCorruption(String),

    /// Identity key lost, ledger chain broken. Refuse to start, or
    /// halt gracefully after persisting state.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl From<crate::crawl::SsrfError> for MeshError {
    fn from(e: crate::crawl::SsrfError) -> Self {
        Self::InputRejected(e.to_string())
    }
}

impl From<crate::crawl::CanonicalError> for MeshError {
    fn from(e: crate::crawl::CanonicalError) -> Self {
        Self::InputRejected(e.to_string())
    }
}

impl From<crate::crawl::FetchError> for MeshError {
    fn from(e: crate::crawl::FetchError) -> Self {
        if e.is_transient() {
            Self::TransientIo(e.to_string())
        } else {
            Self::InputRejected(e.to_string())
        }
    }
}

impl From<crate::crypto::EnvelopeError> for MeshError {
    fn from(e: crate::crypto::EnvelopeError) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

impl From<crate::dht::ValidatorError> for MeshError {
    fn from(e: crate::dht::ValidatorError) -> Self {
        match e {
            crate::dht::ValidatorError::RateLimited(_) => Self::ResourceExhausted(e.to_string()),
            _ => Self::ProtocolViolation(e.to_string()),
        }
    }
}

impl From<crate::dht::RecordError> for MeshError {
    fn from(e: crate::dht::RecordError) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

impl From<crate::index::IndexError> for MeshError {
    fn from(e: crate::index::IndexError) -> Self {
        match e {
            crate::index::IndexError::Corrupt(_) => Self::LocalCorruption(e.to_string()),
            _ => Self::TransientIo(e.to_string()),
        }
    }
}

impl From<crate::crypto::KeyError> for MeshError {
    fn from(e: crate::crypto::KeyError) -> Self {
        Self::Fatal(e.to_string())
    }
}

impl From<crate::credits::LedgerError> for MeshError {
    fn from(e: crate::credits::LedgerError) -> Self {
        match e {
            crate::credits::LedgerError::ChainBroken(_) => Self::Fatal(e.to_string()),
            _ => Self::TransientIo(e.to_string()),
        }
    }
}

impl From<crate::governor::GuardVerdict> for MeshError {
    fn from(_: crate::governor::GuardVerdict) -> Self {
        Self::ResourceExhausted("admission rejected".into())
    }
}

impl From<crate::dht::NodeError> for MeshError {
    fn from(e: crate::dht::NodeError) -> Self {
        match e {
            crate::dht::NodeError::InsufficientBootstrap => Self::Fatal(e.to_string()),
            _ => Self::TransientIo(e.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for MeshError {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::Fatal(e.to_string())
    }
}
