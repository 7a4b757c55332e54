//! DHT record payloads and their canonical body encoding
//!
//! Each record family has a one-byte tag; bodies are fixed-order,
//! little-endian, length-prefixed. Decoding enforces hard caps before
//! allocating anything sized by remote input.
//!
//! ```text
//! payload := tag(1) || body
//!   0x10 KeywordPointer    0x20 ContentAttestation
//!   0x30 CrawlLock         0x31 CrawlLockRelease
//!   0x40 Takedown          0x41 Deletion
//!   0x50 AuditReport       0x60 CreditLedgerRoot
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{ContentHash, Fingerprint};

/// Maximum elements in any decoded array
pub const MAX_ARRAY_LEN: usize = 10_000;
/// Maximum entries in any decoded map-shaped structure
pub const MAX_MAP_LEN: usize = 1_000;
/// Maximum URL / reason string length on the wire
pub const MAX_STRING_LEN: usize = 4096;
/// Auditor sets are small quorums, never bulk arrays
pub const MAX_AUDITORS: usize = 16;

/// Crawl lock lifetime
pub const LOCK_TTL_SECS: u32 = 300;
/// Attestations go stale after seven days unless renewed
pub const ATTESTATION_TTL_MS: u64 = 7 * 24 * 3600 * 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Unknown record tag {0:#04x}")]
    UnknownTag(u8),
    #[error("Truncated record body")]
    Truncated,
    #[error("Field out of range: {0}")]
    OutOfRange(&'static str),
    #[error("String field is not UTF-8")]
    BadUtf8,
    #[error("Array length {got} exceeds cap {cap}")]
    ArrayTooLong { got: usize, cap: usize },
}

/// Record family tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordTag {
    KeywordPointer = 0x10,
    ContentAttestation = 0x20,
    CrawlLock = 0x30,
    CrawlLockRelease = 0x31,
    Takedown = 0x40,
    Deletion = 0x41,
    AuditReport = 0x50,
    CreditLedgerRoot = 0x60,
}

impl RecordTag {
    pub fn from_byte(b: u8) -> Result<Self, RecordError> {
        match b {
            0x10 => Ok(Self::KeywordPointer),
            0x20 => Ok(Self::ContentAttestation),
            0x30 => Ok(Self::CrawlLock),
            0x31 => Ok(Self::CrawlLockRelease),
            0x40 => Ok(Self::Takedown),
            0x41 => Ok(Self::Deletion),
            0x50 => Ok(Self::AuditReport),
            0x60 => Ok(Self::CreditLedgerRoot),
            other => Err(RecordError::UnknownTag(other)),
        }
    }
}

/// Pointer from a keyword key to a document on some peer.
/// Relevance is carried as parts-per-million for a canonical encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordPointer {
    pub peer_id: Fingerprint,
    pub doc_id: u64,
    pub relevance_ppm: u32,
    pub content_hash: ContentHash,
    pub published_at_ms: u64,
}

impl KeywordPointer {
    pub fn relevance(&self) -> f64 {
        f64::from(self.relevance_ppm) / 1_000_000.0
    }

    pub fn from_relevance(score: f64) -> u32 {
        (score.clamp(0.0, 1.0) * 1_000_000.0).round() as u32
    }
}

/// A peer's signed claim that it observed a URL with the given hashes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAttestation {
    pub peer_id: Fingerprint,
    pub canonical_url: String,
    pub raw_hash: ContentHash,
    pub content_hash: ContentHash,
    pub crawl_time_ms: u64,
}

impl ContentAttestation {
    /// Stale attestations are not authoritative for audits or search
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.crawl_time_ms) > ATTESTATION_TTL_MS
    }
}

/// Advisory crawl lock; expires after [`LOCK_TTL_SECS`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlLock {
    pub peer_id: Fingerprint,
    pub canonical_url: String,
    pub acquired_at_ms: u64,
    pub ttl_secs: u32,
}

impl CrawlLock {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) > u64::from(self.ttl_secs) * 1000
    }
}

/// Signed release of a crawl lock; only the owner may release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlLockRelease {
    pub peer_id: Fingerprint,
    pub canonical_url: String,
    pub released_at_ms: u64,
}

/// Target of a takedown or deletion record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakedownTarget {
    Url(String),
    Hash(ContentHash),
}

/// Durable takedown/deletion record; propagates until every replica
/// acknowledges or 24 h elapses, and survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakedownRecord {
    pub target: TakedownTarget,
    pub reason: String,
    pub requester: Fingerprint,
    pub issued_at_ms: u64,
}

/// One auditor's signed observation inside an audit report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorObservation {
    pub auditor: Fingerprint,
    pub observed_hash: ContentHash,
    pub signature: Vec<u8>,
}

/// Outcome of a three-auditor re-crawl of an attested URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub target_peer: Fingerprint,
    pub target_url: String,
    pub attested_hash: ContentHash,
    pub majority_hash: ContentHash,
    pub observations: Vec<AuditorObservation>,
    pub timestamp_ms: u64,
}

/// Periodic publication of a ledger's Merkle root for challenges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLedgerRoot {
    pub peer_id: Fingerprint,
    pub entry_count: u64,
    pub merkle_root: ContentHash,
    pub published_at_ms: u64,
}

/// The tagged union of everything a peer may STORE on the DHT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPayload {
    KeywordPointer(KeywordPointer),
    ContentAttestation(ContentAttestation),
    CrawlLock(CrawlLock),
    CrawlLockRelease(CrawlLockRelease),
    Takedown(TakedownRecord),
    Deletion(TakedownRecord),
    AuditReport(AuditReport),
    CreditLedgerRoot(CreditLedgerRoot),
}

impl RecordPayload {
    pub fn tag(&self) -> RecordTag {
        match self {
            Self::KeywordPointer(_) => RecordTag::KeywordPointer,
            Self::ContentAttestation(_) => RecordTag::ContentAttestation,
            Self::CrawlLock(_) => RecordTag::CrawlLock,
            Self::CrawlLockRelease(_) => RecordTag::CrawlLockRelease,
            Self::Takedown(_) => RecordTag::Takedown,
            Self::Deletion(_) => RecordTag::Deletion,
            Self::AuditReport(_) => RecordTag::AuditReport,
            Self::CreditLedgerRoot(_) => RecordTag::CreditLedgerRoot,
        }
    }

    /// The peer this payload claims to originate from
    pub fn origin(&self) -> Fingerprint {
        match self {
            Self::KeywordPointer(p) => p.peer_id,
            Self::ContentAttestation(a) => a.peer_id,
            Self::CrawlLock(l) => l.peer_id,
            Self::CrawlLockRelease(r) => r.peer_id,
            Self::Takedown(t) | Self::Deletion(t) => t.requester,
            Self::AuditReport(r) => r.target_peer,
            Self::CreditLedgerRoot(r) => r.peer_id,
        }
    }

    /// Canonical payload bytes: `tag || body`
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.tag() as u8);
        match self {
            Self::KeywordPointer(p) => {
                w.fingerprint(&p.peer_id);
                w.u64(p.doc_id);
                w.u32(p.relevance_ppm);
                w.hash(&p.content_hash);
                w.u64(p.published_at_ms);
            }
            Self::ContentAttestation(a) => {
                w.fingerprint(&a.peer_id);
                w.string(&a.canonical_url);
                w.hash(&a.raw_hash);
                w.hash(&a.content_hash);
                w.u64(a.crawl_time_ms);
            }
            Self::CrawlLock(l) => {
                w.fingerprint(&l.peer_id);
                w.string(&l.canonical_url);
                w.u64(l.acquired_at_ms);
                w.u32(l.ttl_secs);
            }
            Self::CrawlLockRelease(r) => {
                w.fingerprint(&r.peer_id);
                w.string(&r.canonical_url);
                w.u64(r.released_at_ms);
            }
            Self::Takedown(t) | Self::Deletion(t) => {
                match &t.target {
                    TakedownTarget::Url(u) => {
                        w.u8(0);
                        w.string(u);
                    }
                    TakedownTarget::Hash(h) => {
                        w.u8(1);
                        w.hash(h);
                    }
                }
                w.string(&t.reason);
                w.fingerprint(&t.requester);
                w.u64(t.issued_at_ms);
            }
            Self::AuditReport(r) => {
                w.fingerprint(&r.target_peer);
                w.string(&r.target_url);
                w.hash(&r.attested_hash);
                w.hash(&r.majority_hash);
                w.u32(r.observations.len() as u32);
                for obs in &r.observations {
                    w.fingerprint(&obs.auditor);
                    w.hash(&obs.observed_hash);
                    w.bytes(&obs.signature);
                }
                w.u64(r.timestamp_ms);
            }
            Self::CreditLedgerRoot(r) => {
                w.fingerprint(&r.peer_id);
                w.u64(r.entry_count);
                w.hash(&r.merkle_root);
                w.u64(r.published_at_ms);
            }
        }
        w.into_inner()
    }

    /// Parse canonical payload bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let tag = RecordTag::from_byte(r.u8()?)?;
        let payload = match tag {
            RecordTag::KeywordPointer => {
                let p = KeywordPointer {
                    peer_id: r.fingerprint()?,
                    doc_id: r.u64()?,
                    relevance_ppm: r.u32()?,
                    content_hash: r.hash()?,
                    published_at_ms: r.u64()?,
                };
                if p.relevance_ppm > 1_000_000 {
                    return Err(RecordError::OutOfRange("relevance"));
                }
                Self::KeywordPointer(p)
            }
            RecordTag::ContentAttestation => Self::ContentAttestation(ContentAttestation {
                peer_id: r.fingerprint()?,
                canonical_url: r.string()?,
                raw_hash: r.hash()?,
                content_hash: r.hash()?,
                crawl_time_ms: r.u64()?,
            }),
            RecordTag::CrawlLock => {
                let lock = CrawlLock {
                    peer_id: r.fingerprint()?,
                    canonical_url: r.string()?,
                    acquired_at_ms: r.u64()?,
                    ttl_secs: r.u32()?,
                };
                if lock.ttl_secs > LOCK_TTL_SECS {
                    return Err(RecordError::OutOfRange("lock ttl"));
                }
                Self::CrawlLock(lock)
            }
            RecordTag::CrawlLockRelease => Self::CrawlLockRelease(CrawlLockRelease {
                peer_id: r.fingerprint()?,
                canonical_url: r.string()?,
                released_at_ms: r.u64()?,
            }),
            RecordTag::Takedown | RecordTag::Deletion => {
                let target = match r.u8()? {
                    0 => TakedownTarget::Url(r.string()?),
                    1 => TakedownTarget::Hash(r.hash()?),
                    _ => return Err(RecordError::OutOfRange("takedown target kind")),
                };
                let rec = TakedownRecord {
                    target,
                    reason: r.string()?,
                    requester: r.fingerprint()?,
                    issued_at_ms: r.u64()?,
                };
                if tag == RecordTag::Takedown {
                    Self::Takedown(rec)
                } else {
                    Self::Deletion(rec)
                }
            }
            RecordTag::AuditReport => {
                let target_peer = r.fingerprint()?;
                let target_url = r.string()?;
                let attested_hash = r.hash()?;
                let majority_hash = r.hash()?;
                let count = r.array_len(MAX_AUDITORS)?;
                let mut observations = Vec::with_capacity(count);
                for _ in 0..count {
                    observations.push(AuditorObservation {
                        auditor: r.fingerprint()?,
                        observed_hash: r.hash()?,
                        signature: r.bytes()?,
                    });
                }
                Self::AuditReport(AuditReport {
                    target_peer,
                    target_url,
                    attested_hash,
                    majority_hash,
                    observations,
                    timestamp_ms: r.u64()?,
                })
            }
            RecordTag::CreditLedgerRoot => Self::CreditLedgerRoot(CreditLedgerRoot {
                peer_id: r.fingerprint()?,
                entry_count: r.u64()?,
                merkle_root: r.hash()?,
                published_at_ms: r.u64()?,
            }),
        };
        r.finish()?;
        Ok(payload)
    }
}

// --- Canonical byte writer/reader ---------------------------------------
// Shared with the RPC protocol codec; never replaced by a generic
// serializer so the wire form stays deterministic.

pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn fingerprint(&mut self, fp: &Fingerprint) {
        self.buf.extend_from_slice(fp.as_bytes());
    }

    pub(crate) fn hash(&mut self, h: &ContentHash) {
        self.buf.extend_from_slice(h.as_bytes());
    }

    pub(crate) fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    pub(crate) fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    pub(crate) fn raw(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        if self.rest.len() < n {
            return Err(RecordError::Truncated);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, RecordError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, RecordError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn fingerprint(&mut self) -> Result<Fingerprint, RecordError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(Fingerprint(out))
    }

    pub(crate) fn hash(&mut self) -> Result<ContentHash, RecordError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(ContentHash(out))
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>, RecordError> {
        self.bytes_capped(MAX_STRING_LEN)
    }

    /// Length-prefixed bytes with an explicit cap (envelope blobs)
    pub(crate) fn bytes_capped(&mut self, cap: usize) -> Result<Vec<u8>, RecordError> {
        let len = self.u32()? as usize;
        if len > cap {
            return Err(RecordError::ArrayTooLong { got: len, cap });
        }
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn string(&mut self) -> Result<String, RecordError> {
        String::from_utf8(self.bytes()?).map_err(|_| RecordError::BadUtf8)
    }

    pub(crate) fn array_len(&mut self, cap: usize) -> Result<usize, RecordError> {
        let len = self.u32()? as usize;
        if len > cap.min(MAX_ARRAY_LEN) {
            return Err(RecordError::ArrayTooLong { got: len, cap });
        }
        Ok(len)
    }

    pub(crate) fn finish(&self) -> Result<(), RecordError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(RecordError::OutOfRange("trailing bytes"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    fn hash(n: u8) -> ContentHash {
        ContentHash([n; 32])
    }

    #[test]
    fn test_keyword_pointer_roundtrip() {
        let p = RecordPayload::KeywordPointer(KeywordPointer {
            peer_id: fp(1),
            doc_id: 42,
            relevance_ppm: KeywordPointer::from_relevance(0.87),
            content_hash: hash(2),
            published_at_ms: 1_700_000_000_000,
        });
        let bytes = p.encode();
        let decoded = RecordPayload::decode(&bytes).unwrap();
        assert_eq!(p, decoded);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_attestation_roundtrip() {
        let a = RecordPayload::ContentAttestation(ContentAttestation {
            peer_id: fp(3),
            canonical_url: "https://example.org/docs".into(),
            raw_hash: hash(4),
            content_hash: hash(5),
            crawl_time_ms: 1000,
        });
        assert_eq!(RecordPayload::decode(&a.encode()).unwrap(), a);
    }

    #[test]
    fn test_lock_ttl_capped() {
        let l = RecordPayload::CrawlLock(CrawlLock {
            peer_id: fp(6),
            canonical_url: "https://example.org".into(),
            acquired_at_ms: 0,
            ttl_secs: 9999,
        });
        assert!(matches!(
            RecordPayload::decode(&l.encode()),
            Err(RecordError::OutOfRange("lock ttl"))
        ));
    }

    #[test]
    fn test_takedown_both_target_kinds() {
        for target in [
            TakedownTarget::Url("https://example.org/x".into()),
            TakedownTarget::Hash(hash(7)),
        ] {
            let t = RecordPayload::Takedown(TakedownRecord {
                target,
                reason: "dmca".into(),
                requester: fp(8),
                issued_at_ms: 12,
            });
            assert_eq!(RecordPayload::decode(&t.encode()).unwrap(), t);
        }
    }

    #[test]
    fn test_audit_report_roundtrip() {
        let r = RecordPayload::AuditReport(AuditReport {
            target_peer: fp(9),
            target_url: "https://example.org/a".into(),
            attested_hash: hash(1),
            majority_hash: hash(1),
            observations: vec![
                AuditorObservation {
                    auditor: fp(10),
                    observed_hash: hash(1),
                    signature: vec![0u8; 64],
                },
                AuditorObservation {
                    auditor: fp(11),
                    observed_hash: hash(1),
                    signature: vec![1u8; 64],
                },
                AuditorObservation {
                    auditor: fp(12),
                    observed_hash: hash(2),
                    signature: vec![2u8; 64],
                },
            ],
            timestamp_ms: 99,
        });
        assert_eq!(RecordPayload::decode(&r.encode()).unwrap(), r);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            RecordPayload::decode(&[0xEE, 0, 0]),
            Err(RecordError::UnknownTag(0xEE))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let p = RecordPayload::CreditLedgerRoot(CreditLedgerRoot {
            peer_id: fp(13),
            entry_count: 5,
            merkle_root: hash(14),
            published_at_ms: 1,
        });
        let bytes = p.encode();
        assert!(RecordPayload::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let p = RecordPayload::CrawlLockRelease(CrawlLockRelease {
            peer_id: fp(15),
            canonical_url: "https://example.org".into(),
            released_at_ms: 7,
        });
        let mut bytes = p.encode();
        bytes.push(0);
        assert!(RecordPayload::decode(&bytes).is_err());
    }

    #[test]
    fn test_oversize_string_rejected() {
        let mut bytes = vec![0x20]; // attestation tag
        bytes.extend_from_slice(&[0u8; 32]); // peer
        bytes.extend_from_slice(&(u32::MAX).to_le_bytes()); // absurd string len
        assert!(matches!(
            RecordPayload::decode(&bytes),
            Err(RecordError::ArrayTooLong { .. })
        ));
    }
}
