//! Identity and cryptography
//!
//! Ed25519 keypair lifecycle, proof-of-work bound peer identities,
//! SHA-256 content addressing, and the canonical signed envelope that
//! wraps every record on the wire.

pub mod envelope;
pub mod hashing;
pub mod keys;
pub mod pow;

pub use envelope::{Envelope, EnvelopeError, NonceCounter, NonceTracker, MAX_ENVELOPE_BYTES};
pub use hashing::{verify_content, ContentHash};
pub use keys::{KeyError, KeyHandover, NodeKeys};
pub use pow::{Fingerprint, PeerIdentity, DEFAULT_POW_DIFFICULTY};
