//! DHT overlay
//!
//! Kademlia-routed record coordination layer:
//! - 160-bit keyspace with XOR distance and closest-N ownership
//! - Signed record families (pointers, attestations, locks, takedowns,
//!   audit reports, ledger roots) with a canonical wire format
//! - A six-step STORE validation funnel; malformed input never crashes
//! - Replication factor 3; persisted peer cache for rejoin
//! - Request-response probes for distributed search

pub mod behaviour;
pub mod keyspace;
pub mod node;
pub mod peer_store;
pub mod protocol;
pub mod records;
pub mod store;
pub mod validator;

pub use behaviour::{MeshBehaviour, REPLICATION_FACTOR};
pub use keyspace::{closest_n, owns_key, Distance, Key};
pub use node::{
    Admission, DhtConfig, DhtEvent, DhtHandle, DhtNode, DhtStats, LookupBackend, NodeError,
    MIN_BOOTSTRAP_SEEDS,
};
pub use peer_store::{BandwidthClass, PeerProfile, PeerStore, SubnetDiversity};
pub use protocol::{DocMetaEntry, RpcRequest, RpcResponse};
pub use records::{
    AuditReport, AuditorObservation, ContentAttestation, CrawlLock, CrawlLockRelease,
    CreditLedgerRoot, KeywordPointer, RecordError, RecordPayload, RecordTag, TakedownRecord,
    TakedownTarget, ATTESTATION_TTL_MS, LOCK_TTL_SECS,
};
pub use store::{select_record, RecordStore, StoredRecord};
pub use validator::{IdentityRegistry, RecordValidator, ValidatorError, VerifiedRecord};
