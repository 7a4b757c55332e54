//! Record exchange protocol definitions
//!
//! Request/response messages between peers, carried over authenticated
//! noise streams. Signed records travel as raw envelope bytes so
//! receivers re-verify signatures themselves; raw query strings never
//! appear here — keyword lookups carry key hashes only.

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{request_response::Codec, StreamProtocol};
use std::io;

use super::keyspace::{Key, KEY_BYTES};
use super::records::{Reader, RecordError, Writer, MAX_ARRAY_LEN};
use crate::crypto::{ContentHash, Fingerprint, PeerIdentity, MAX_ENVELOPE_BYTES};

/// Protocol name for record exchange
pub const RECORD_PROTOCOL: StreamProtocol = StreamProtocol::new("/meshseek/record/1.0.0");

/// Cap on one whole RPC message (request or response)
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
/// Cap on keys in one keyword lookup
pub const MAX_LOOKUP_KEYS: usize = 16;
/// Cap on doc ids in one metadata request
pub const MAX_META_DOCS: usize = 64;
/// Cap on records returned for one key
pub const MAX_RESPONSE_RECORDS: usize = 256;

/// Requests a peer may send
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    /// Identity handshake: present our PoW-bound identity
    Hello { identity: PeerIdentity },
    /// Replicate a signed record to this peer
    Store { key: Key, envelope: Vec<u8> },
    /// Fetch the set of valid records at a key
    FindValue { key: Key },
    /// Distributed search probe: keyword key hashes, never raw terms
    KeywordLookup { keyword_keys: Vec<Key>, limit: u32 },
    /// Fetch display metadata for documents surfaced by a lookup
    DocMeta { doc_ids: Vec<u64> },
    /// Deliver a signed audit observation to the cycle's aggregator
    AuditObservation {
        target_peer: Fingerprint,
        target_url: String,
        attested_hash: ContentHash,
        epoch: u64,
        auditor: Fingerprint,
        observed_hash: ContentHash,
        signature: Vec<u8>,
    },
}

/// Display metadata for one document, served by its indexing peer
#[derive(Debug, Clone, PartialEq)]
pub struct DocMetaEntry {
    pub doc_id: u64,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub content_hash: ContentHash,
    pub crawl_time_ms: u64,
}

/// Responses
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    Hello { identity: PeerIdentity },
    Stored { accepted: bool },
    Records { envelopes: Vec<Vec<u8>>, truncated: bool },
    Pointers { envelopes: Vec<Vec<u8>>, partial: bool },
    DocMetas { docs: Vec<DocMetaEntry> },
    /// Plain acknowledgment (audit observations)
    Ack,
    /// Admission rejected; caller may retry later
    Busy,
    /// Sender's trust standing is too low to be served
    Denied,
}

// --- Request encoding ----------------------------------------------------

const REQ_HELLO: u8 = 0x01;
const REQ_STORE: u8 = 0x02;
const REQ_FIND_VALUE: u8 = 0x03;
const REQ_KEYWORD_LOOKUP: u8 = 0x04;
const REQ_DOC_META: u8 = 0x05;
const REQ_AUDIT_OBS: u8 = 0x06;

const RESP_HELLO: u8 = 0x81;
const RESP_STORED: u8 = 0x82;
const RESP_RECORDS: u8 = 0x83;
const RESP_POINTERS: u8 = 0x84;
const RESP_DOC_METAS: u8 = 0x85;
const RESP_ACK: u8 = 0x86;
const RESP_BUSY: u8 = 0xFE;
const RESP_DENIED: u8 = 0xFF;

fn write_identity(w: &mut Writer, identity: &PeerIdentity) {
    w.raw(&identity.public_key);
    w.u64(identity.pow_nonce);
    w.u64(identity.created_at_ms);
}

fn read_identity(r: &mut Reader<'_>) -> Result<PeerIdentity, RecordError> {
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(r.take(32)?);
    Ok(PeerIdentity {
        public_key,
        pow_nonce: r.u64()?,
        created_at_ms: r.u64()?,
    })
}

fn write_key(w: &mut Writer, key: &Key) {
    w.raw(key.as_bytes());
}

fn read_key(r: &mut Reader<'_>) -> Result<Key, RecordError> {
    let mut out = [0u8; KEY_BYTES];
    out.copy_from_slice(r.take(KEY_BYTES)?);
    Ok(Key(out))
}

impl RpcRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Hello { identity } => {
                w.u8(REQ_HELLO);
                write_identity(&mut w, identity);
            }
            Self::Store { key, envelope } => {
                w.u8(REQ_STORE);
                write_key(&mut w, key);
                w.bytes(envelope);
            }
            Self::FindValue { key } => {
                w.u8(REQ_FIND_VALUE);
                write_key(&mut w, key);
            }
            Self::KeywordLookup { keyword_keys, limit } => {
                w.u8(REQ_KEYWORD_LOOKUP);
                w.u32(keyword_keys.len() as u32);
                for key in keyword_keys {
                    write_key(&mut w, key);
                }
                w.u32(*limit);
            }
            Self::DocMeta { doc_ids } => {
                w.u8(REQ_DOC_META);
                w.u32(doc_ids.len() as u32);
                for id in doc_ids {
                    w.u64(*id);
                }
            }
            Self::AuditObservation {
                target_peer,
                target_url,
                attested_hash,
                epoch,
                auditor,
                observed_hash,
                signature,
            } => {
                w.u8(REQ_AUDIT_OBS);
                w.fingerprint(target_peer);
                w.string(target_url);
                w.hash(attested_hash);
                w.u64(*epoch);
                w.fingerprint(auditor);
                w.hash(observed_hash);
                w.bytes(signature);
            }
        }
        w.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let req = match r.u8()? {
            REQ_HELLO => Self::Hello {
                identity: read_identity(&mut r)?,
            },
            REQ_STORE => Self::Store {
                key: read_key(&mut r)?,
                envelope: r.bytes_capped(MAX_ENVELOPE_BYTES)?,
            },
            REQ_FIND_VALUE => Self::FindValue {
                key: read_key(&mut r)?,
            },
            REQ_KEYWORD_LOOKUP => {
                let count = r.array_len(MAX_LOOKUP_KEYS)?;
                let mut keyword_keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keyword_keys.push(read_key(&mut r)?);
                }
                Self::KeywordLookup {
                    keyword_keys,
                    limit: r.u32()?,
                }
            }
            REQ_DOC_META => {
                let count = r.array_len(MAX_META_DOCS)?;
                let mut doc_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    doc_ids.push(r.u64()?);
                }
                Self::DocMeta { doc_ids }
            }
            REQ_AUDIT_OBS => Self::AuditObservation {
                target_peer: r.fingerprint()?,
                target_url: r.string()?,
                attested_hash: r.hash()?,
                epoch: r.u64()?,
                auditor: r.fingerprint()?,
                observed_hash: r.hash()?,
                signature: r.bytes()?,
            },
            other => return Err(RecordError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(req)
    }
}

impl RpcResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Hello { identity } => {
                w.u8(RESP_HELLO);
                write_identity(&mut w, identity);
            }
            Self::Stored { accepted } => {
                w.u8(RESP_STORED);
                w.u8(u8::from(*accepted));
            }
            Self::Records { envelopes, truncated } => {
                w.u8(RESP_RECORDS);
                w.u8(u8::from(*truncated));
                w.u32(envelopes.len() as u32);
                for env in envelopes {
                    w.bytes(env);
                }
            }
            Self::Pointers { envelopes, partial } => {
                w.u8(RESP_POINTERS);
                w.u8(u8::from(*partial));
                w.u32(envelopes.len() as u32);
                for env in envelopes {
                    w.bytes(env);
                }
            }
            Self::DocMetas { docs } => {
                w.u8(RESP_DOC_METAS);
                w.u32(docs.len() as u32);
                for doc in docs {
                    w.u64(doc.doc_id);
                    w.string(&doc.url);
                    w.string(&doc.title);
                    w.string(&doc.snippet);
                    w.hash(&doc.content_hash);
                    w.u64(doc.crawl_time_ms);
                }
            }
            Self::Ack => w.u8(RESP_ACK),
            Self::Busy => w.u8(RESP_BUSY),
            Self::Denied => w.u8(RESP_DENIED),
        }
        w.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let resp = match r.u8()? {
            RESP_HELLO => Self::Hello {
                identity: read_identity(&mut r)?,
            },
            RESP_STORED => Self::Stored {
                accepted: r.u8()? != 0,
            },
            RESP_RECORDS => {
                let truncated = r.u8()? != 0;
                let count = r.array_len(MAX_RESPONSE_RECORDS)?;
                let mut envelopes = Vec::with_capacity(count);
                for _ in 0..count {
                    envelopes.push(r.bytes_capped(MAX_ENVELOPE_BYTES)?);
                }
                Self::Records { envelopes, truncated }
            }
            RESP_POINTERS => {
                let partial = r.u8()? != 0;
                let count = r.array_len(MAX_ARRAY_LEN)?;
                let mut envelopes = Vec::with_capacity(count.min(MAX_RESPONSE_RECORDS));
                for _ in 0..count {
                    envelopes.push(r.bytes_capped(MAX_ENVELOPE_BYTES)?);
                }
                Self::Pointers { envelopes, partial }
            }
            RESP_DOC_METAS => {
                let count = r.array_len(MAX_META_DOCS)?;
                let mut docs = Vec::with_capacity(count);
                for _ in 0..count {
                    docs.push(DocMetaEntry {
                        doc_id: r.u64()?,
                        url: r.string()?,
                        title: r.string()?,
                        snippet: r.string()?,
                        content_hash: r.hash()?,
                        crawl_time_ms: r.u64()?,
                    });
                }
                Self::DocMetas { docs }
            }
            RESP_ACK => Self::Ack,
            RESP_BUSY => Self::Busy,
            RESP_DENIED => Self::Denied,
            other => return Err(RecordError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(resp)
    }
}

// --- libp2p codec --------------------------------------------------------

/// Canonical-bytes codec for the record exchange protocol
#[derive(Debug, Clone, Default)]
pub struct MeshCodec;

async fn read_framed<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    io.take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > MAX_MESSAGE_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    Ok(buf)
}

#[async_trait]
impl Codec for MeshCodec {
    type Protocol = StreamProtocol;
    type Request = RpcRequest;
    type Response = RpcResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_framed(io).await?;
        RpcRequest::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_framed(io).await?;
        RpcResponse::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&req.encode()).await?;
        io.close().await?;
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&res.encode()).await?;
        io.close().await?;
        Ok(())
    }
}
