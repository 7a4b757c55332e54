//! Ed25519 node keypair lifecycle
//!
//! The node keypair is the root of every ownership chain: it signs DHT
//! records, attestations, audit reports, and credit entries. Keys are
//! stored under `<data_dir>/keys/` with 0600 permissions on the secret.

use libp2p::identity::{self, ed25519};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroize;

use super::hashing::ContentHash;

/// File name for the raw 32-byte Ed25519 secret
const SECRET_FILE: &str = "node.key";
/// File name for the raw 32-byte public key
const PUBLIC_FILE: &str = "node.pub";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Secret key not found at {0}")]
    NotFound(String),
    #[error("Malformed key material")]
    Malformed,
    #[error("Handover signature does not verify")]
    BadHandover,
}

/// Node signing keypair (Ed25519)
pub struct NodeKeys {
    keypair: ed25519::Keypair,
}

impl NodeKeys {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let keypair = ed25519::Keypair::generate();
        let keys = Self { keypair };
        info!(fingerprint = %keys.short_fingerprint(), "keypair generated");
        keys
    }

    /// Build a keypair from a fixed 32-byte secret (tests and tools)
    pub fn from_secret_bytes(mut bytes: [u8; 32]) -> Result<Self, KeyError> {
        let secret =
            ed25519::SecretKey::try_from_bytes(&mut bytes).map_err(|_| KeyError::Malformed)?;
        Ok(Self {
            keypair: ed25519::Keypair::from(secret),
        })
    }

    /// Load the keypair from `<keys_dir>/node.key`
    pub fn load(keys_dir: &Path) -> Result<Self, KeyError> {
        let secret_path = keys_dir.join(SECRET_FILE);
        if !secret_path.exists() {
            return Err(KeyError::NotFound(secret_path.display().to_string()));
        }

        let mut bytes = fs::read(&secret_path)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Malformed)?;
        bytes.zeroize();

        let keys = Self::from_secret_bytes(arr)?;
        info!(keys_dir = %keys_dir.display(), "keypair loaded");
        Ok(keys)
    }

    /// Save the keypair under `keys_dir` (secret written 0600)
    pub fn save(&self, keys_dir: &Path) -> Result<(), KeyError> {
        fs::create_dir_all(keys_dir)?;

        let secret_path = keys_dir.join(SECRET_FILE);
        let mut secret_bytes = self.keypair.secret().as_ref().to_vec();
        fs::write(&secret_path, &secret_bytes)?;
        secret_bytes.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::write(keys_dir.join(PUBLIC_FILE), self.public_key_bytes())?;

        info!(keys_dir = %keys_dir.display(), "keypair saved");
        Ok(())
    }

    /// Load existing keys or generate and persist new ones on first run
    pub fn ensure(keys_dir: &Path) -> Result<Self, KeyError> {
        match Self::load(keys_dir) {
            Ok(keys) => Ok(keys),
            Err(KeyError::NotFound(_)) => {
                let keys = Self::generate();
                keys.save(keys_dir)?;
                Ok(keys)
            }
            Err(e) => Err(e),
        }
    }

    /// Sign raw bytes, returning a 64-byte Ed25519 signature
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keypair.sign(data)
    }

    /// Verify a signature against this node's own public key
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.keypair.public().verify(data, signature)
    }

    /// Raw 32-byte public key
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public().to_bytes()
    }

    /// The public half, usable for standalone verification
    pub fn public(&self) -> ed25519::PublicKey {
        self.keypair.public()
    }

    /// Convert into a libp2p identity for swarm construction
    pub fn to_libp2p(&self) -> identity::Keypair {
        identity::Keypair::from(self.keypair.clone())
    }

    /// Short fingerprint of the public key for logging
    pub fn short_fingerprint(&self) -> String {
        let h = ContentHash::from_data(&self.public_key_bytes());
        h.to_hex()[..16].to_string()
    }
}

/// Verify a signature given a raw 32-byte public key
pub fn verify_with_key(public_key: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    match ed25519::PublicKey::try_from_bytes(public_key) {
        Ok(pk) => pk.verify(data, signature),
        Err(_) => false,
    }
}

/// Key rotation handover: the old key vouches for the new one.
///
/// The old key must be published as revoked on the DHT within one hour
/// of rotation; receivers treat records signed by a revoked key as
/// invalid from the revocation timestamp onward.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyHandover {
    pub old_public_key: [u8; 32],
    pub new_public_key: [u8; 32],
    pub issued_at_ms: u64,
    /// Ed25519 by the OLD key over `old_pub || new_pub || issued_at_le`
    pub signature: Vec<u8>,
}

impl KeyHandover {
    fn signing_bytes(old: &[u8; 32], new: &[u8; 32], issued_at_ms: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(72);
        buf.extend_from_slice(old);
        buf.extend_from_slice(new);
        buf.extend_from_slice(&issued_at_ms.to_le_bytes());
        buf
    }

    /// Produce a handover from `old_keys` to `new_keys`
    pub fn create(old_keys: &NodeKeys, new_keys: &NodeKeys, issued_at_ms: u64) -> Self {
        let old_pub = old_keys.public_key_bytes();
        let new_pub = new_keys.public_key_bytes();
        let signature = old_keys.sign(&Self::signing_bytes(&old_pub, &new_pub, issued_at_ms));
        Self {
            old_public_key: old_pub,
            new_public_key: new_pub,
            issued_at_ms,
            signature,
        }
    }

    /// Check that the old key really signed this handover
    pub fn verify(&self) -> Result<(), KeyError> {
        let bytes =
            Self::signing_bytes(&self.old_public_key, &self.new_public_key, self.issued_at_ms);
        if verify_with_key(&self.old_public_key, &bytes, &self.signature) {
            Ok(())
        } else {
            Err(KeyError::BadHandover)
        }
    }
}

/// Fill a buffer with OS randomness (PoW nonces, audit jitter seeds)
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeys({})", self.short_fingerprint())
    }
}
