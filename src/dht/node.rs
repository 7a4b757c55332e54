//! Overlay node: swarm construction and event loop
//!
//! Owns the libp2p swarm, the record validator, the local record store
//! slice, and the persisted peer cache. All mutation happens inside one
//! task; other components talk to it through a cloneable [`DhtHandle`]
//! of message-passing commands, so readers never contend on locks.

use futures::StreamExt;
use libp2p::{
    kad, noise,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::SwarmEvent,
    yamux, Multiaddr, PeerId, Swarm,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::behaviour::{MeshBehaviour, MeshBehaviourEvent, REPLICATION_FACTOR};
use super::keyspace::{closest_n, Key};
use super::peer_store::{subnet16, PeerStore, SubnetDiversity};
use super::protocol::{DocMetaEntry, RpcRequest, RpcResponse, MAX_RESPONSE_RECORDS};
use super::records::RecordPayload;
use super::store::{RecordStore, StoredRecord};
use super::validator::RecordValidator;
use crate::crypto::{Fingerprint, NodeKeys, PeerIdentity};

/// Minimum independent seed endpoints for a cold bootstrap
pub const MIN_BOOTSTRAP_SEEDS: usize = 3;
/// Bucket refresh cadence
const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Record store expiry sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Extract the IP component of a multiaddr, if any
fn multiaddr_ip(addr: &Multiaddr) -> Option<std::net::IpAddr> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::Ip4(ip) => Some(std::net::IpAddr::V4(ip)),
        libp2p::multiaddr::Protocol::Ip6(ip) => Some(std::net::IpAddr::V6(ip)),
        _ => None,
    })
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Dial error: {0}")]
    Dial(String),
    #[error("Bootstrap requires {MIN_BOOTSTRAP_SEEDS} seeds or a persisted peer store")]
    InsufficientBootstrap,
    #[error("Peer {0} is not connected")]
    NotConnected(Fingerprint),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Node task stopped")]
    Stopped,
}

/// Node configuration
#[derive(Clone)]
pub struct DhtConfig {
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Bootstrap peers to connect to
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    /// Proof-of-work difficulty demanded of peers
    pub pow_difficulty: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_peers: vec![],
            pow_difficulty: crate::crypto::DEFAULT_POW_DIFFICULTY,
        }
    }
}

/// Events emitted by the node for the trust kernel and governor
#[derive(Debug, Clone)]
pub enum DhtEvent {
    /// Node started listening
    Listening { address: Multiaddr },
    /// A peer completed the identity handshake
    PeerAdmitted { peer: Fingerprint },
    /// Disconnected from a peer
    PeerDisconnected { peer: Fingerprint },
    /// A record passed validation and was stored
    RecordAccepted { key: Key, sender: Fingerprint },
    /// A takedown or deletion obligation arrived
    TakedownReceived { record: super::records::TakedownRecord },
    /// An audit report arrived
    AuditReceived { report: super::records::AuditReport },
    /// A protocol violation strike was recorded
    StrikeRecorded { peer: Fingerprint, strikes: u32 },
}

/// Admission decision for inbound search probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Busy,
    Denied,
}

/// What the overlay needs from the rest of the node to answer probes.
/// Implementations must not block: they are called on the node task.
/// Keyword pointers themselves are served from the node's own record
/// store slice.
pub trait LookupBackend: Send + Sync {
    /// Display metadata for locally indexed documents
    fn doc_metas(&self, doc_ids: &[u64]) -> Vec<DocMetaEntry>;
    /// Load-guard and trust admission for an inbound caller
    fn admit(&self, peer: Option<&Fingerprint>) -> Admission;
    /// Whether a peer is isolated (its records are not served)
    fn is_isolated(&self, peer: &Fingerprint) -> bool;
    /// A remote lookup was served (credit accounting hook)
    fn lookup_served(&self, peer: Option<&Fingerprint>);
    /// An audit observation arrived for a cycle this node aggregates;
    /// returns false when the observation is unwanted
    fn audit_observation(&self, request: &RpcRequest) -> bool;
}

enum Command {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Publish {
        key: Key,
        envelope: Vec<u8>,
        reply: oneshot::Sender<Result<bool, NodeError>>,
    },
    FindValue {
        key: Key,
        reply: oneshot::Sender<Vec<Vec<u8>>>,
    },
    KeywordLookup {
        peer: Fingerprint,
        keys: Vec<Key>,
        limit: u32,
        reply: oneshot::Sender<Result<RpcResponse, NodeError>>,
    },
    DocMeta {
        peer: Fingerprint,
        doc_ids: Vec<u64>,
        reply: oneshot::Sender<Result<RpcResponse, NodeError>>,
    },
    Request {
        peer: Fingerprint,
        request: RpcRequest,
        reply: oneshot::Sender<Result<RpcResponse, NodeError>>,
    },
    ActiveLock {
        url: String,
        reply: oneshot::Sender<Option<super::records::CrawlLock>>,
    },
    KnownPeers {
        reply: oneshot::Sender<Vec<Fingerprint>>,
    },
    PurgePeer {
        peer: Fingerprint,
    },
    Stats {
        reply: oneshot::Sender<DhtStats>,
    },
}

/// Point-in-time overlay statistics
#[derive(Debug, Clone, Default)]
pub struct DhtStats {
    pub connected_peers: usize,
    pub admitted_peers: usize,
    pub stored_keys: usize,
    pub stored_records: usize,
}

/// Cloneable handle for talking to the node task
#[derive(Clone)]
pub struct DhtHandle {
    tx: mpsc::Sender<Command>,
}

impl DhtHandle {
    async fn send<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<(), NodeError> {
        self.send(|reply| Command::Dial { addr, reply }).await?
    }

    /// Validate, store locally, and replicate a signed record
    pub async fn publish(&self, key: Key, envelope: Vec<u8>) -> Result<bool, NodeError> {
        self.send(|reply| Command::Publish { key, envelope, reply })
            .await?
    }

    /// Set of currently valid record envelopes at a key (local slice +
    /// replicas' answers)
    pub async fn find_value(&self, key: Key) -> Result<Vec<Vec<u8>>, NodeError> {
        self.send(|reply| Command::FindValue { key, reply }).await
    }

    pub async fn keyword_lookup(
        &self,
        peer: Fingerprint,
        keys: Vec<Key>,
        limit: u32,
    ) -> Result<RpcResponse, NodeError> {
        self.send(|reply| Command::KeywordLookup {
            peer,
            keys,
            limit,
            reply,
        })
        .await?
    }

    pub async fn doc_meta(
        &self,
        peer: Fingerprint,
        doc_ids: Vec<u64>,
    ) -> Result<RpcResponse, NodeError> {
        self.send(|reply| Command::DocMeta {
            peer,
            doc_ids,
            reply,
        })
        .await?
    }

    /// Send an arbitrary RPC (audit observation delivery)
    pub async fn request(
        &self,
        peer: Fingerprint,
        request: RpcRequest,
    ) -> Result<RpcResponse, NodeError> {
        self.send(|reply| Command::Request {
            peer,
            request,
            reply,
        })
        .await?
    }

    pub async fn active_lock(
        &self,
        url: String,
    ) -> Result<Option<super::records::CrawlLock>, NodeError> {
        self.send(|reply| Command::ActiveLock { url, reply }).await
    }

    pub async fn known_peers(&self) -> Result<Vec<Fingerprint>, NodeError> {
        self.send(|reply| Command::KnownPeers { reply }).await
    }

    /// Stop serving an isolated peer's records
    pub async fn purge_peer(&self, peer: Fingerprint) -> Result<(), NodeError> {
        self.tx
            .send(Command::PurgePeer { peer })
            .await
            .map_err(|_| NodeError::Stopped)
    }

    pub async fn stats(&self) -> Result<DhtStats, NodeError> {
        self.send(|reply| Command::Stats { reply }).await
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Result<RpcResponse, NodeError>>,
    peer: Fingerprint,
    sent_at: Instant,
}

struct FindValueQuery {
    collected: Vec<Vec<u8>>,
    outstanding: usize,
    reply: Option<oneshot::Sender<Vec<Vec<u8>>>>,
}

/// The overlay node task
pub struct DhtNode {
    swarm: Swarm<MeshBehaviour>,
    validator: RecordValidator,
    records: RecordStore,
    peer_store: Arc<PeerStore>,
    backend: Arc<dyn LookupBackend>,
    identity: PeerIdentity,

    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<DhtEvent>,

    peer_by_id: HashMap<PeerId, Fingerprint>,
    id_by_peer: HashMap<Fingerprint, PeerId>,
    remote_ips: HashMap<PeerId, std::net::IpAddr>,
    diversity: SubnetDiversity,
    bucket_of: HashMap<Fingerprint, (usize, Option<[u8; 2]>)>,

    pending: HashMap<OutboundRequestId, PendingRequest>,
    find_queries: HashMap<OutboundRequestId, Arc<std::sync::Mutex<FindValueQuery>>>,
}

impl DhtNode {
    /// Build the swarm and spawn-ready node.
    ///
    /// Bootstrap policy: at least [`MIN_BOOTSTRAP_SEEDS`] seed endpoints,
    /// or a non-empty persisted peer store from a previous run.
    #[allow(clippy::type_complexity)]
    pub fn new(
        keys: &NodeKeys,
        identity: PeerIdentity,
        config: DhtConfig,
        peer_store: Arc<PeerStore>,
        backend: Arc<dyn LookupBackend>,
    ) -> Result<(Self, DhtHandle, mpsc::Receiver<DhtEvent>), NodeError> {
        if config.bootstrap_peers.len() < MIN_BOOTSTRAP_SEEDS && peer_store.is_empty() {
            return Err(NodeError::InsufficientBootstrap);
        }

        let local_key = keys.to_libp2p();
        let local_peer_id = PeerId::from(local_key.public());
        let local_public_key = local_key.public();

        info!(peer_id = %local_peer_id, fingerprint = %identity.fingerprint(), "overlay starting");

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|_| MeshBehaviour::new(local_peer_id, local_public_key))
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(60))
            })
            .build();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|_| NodeError::Transport("bad listen address".into()))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        for (peer_id, addr) in &config.bootstrap_peers {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(%addr, error = %e, "bootstrap dial failed");
            }
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(peer_id, addr.clone());
        }

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        // Our own publishes run through the same validator funnel, so
        // the local identity must be admitted like any peer's
        let mut validator = RecordValidator::new(config.pow_difficulty);
        validator.register_identity(identity.clone());

        let node = Self {
            swarm,
            validator,
            records: RecordStore::new(),
            peer_store,
            backend,
            identity,
            command_rx,
            event_tx,
            peer_by_id: HashMap::new(),
            id_by_peer: HashMap::new(),
            remote_ips: HashMap::new(),
            diversity: SubnetDiversity::new(),
            bucket_of: HashMap::new(),
            pending: HashMap::new(),
            find_queries: HashMap::new(),
        };

        Ok((node, DhtHandle { tx: command_tx }, event_rx))
    }

    /// Run the node event loop until all handles are dropped
    pub async fn run(mut self) {
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("all handles dropped, overlay stopping");
                            break;
                        }
                    }
                }
                _ = refresh.tick() => {
                    self.refresh_buckets();
                }
                _ = sweep.tick() => {
                    let dropped = self.records.sweep(now_ms());
                    if dropped > 0 {
                        debug!(dropped, "record sweep");
                    }
                }
            }
        }
    }

    /// Probe a random key in the keyspace to keep buckets fresh
    fn refresh_buckets(&mut self) {
        let mut random = [0u8; 32];
        crate::crypto::keys::random_bytes(&mut random);
        let target = kad::RecordKey::new(&random);
        self.swarm
            .behaviour_mut()
            .kademlia
            .get_closest_peers(target.to_vec());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { addr, reply } => {
                let result = self
                    .swarm
                    .dial(addr)
                    .map_err(|e| NodeError::Dial(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Publish { key, envelope, reply } => {
                let accepted = self.store_and_replicate(key, envelope);
                let _ = reply.send(Ok(accepted));
            }
            Command::FindValue { key, reply } => {
                self.start_find_value(key, reply);
            }
            Command::KeywordLookup { peer, keys, limit, reply } => {
                let request = RpcRequest::KeywordLookup {
                    keyword_keys: keys,
                    limit,
                };
                self.send_request(peer, request, reply);
            }
            Command::DocMeta { peer, doc_ids, reply } => {
                self.send_request(peer, RpcRequest::DocMeta { doc_ids }, reply);
            }
            Command::Request { peer, request, reply } => {
                self.send_request(peer, request, reply);
            }
            Command::ActiveLock { url, reply } => {
                let _ = reply.send(self.records.active_lock(&url, now_ms()));
            }
            Command::KnownPeers { reply } => {
                let _ = reply.send(self.id_by_peer.keys().copied().collect());
            }
            Command::PurgePeer { peer } => {
                self.records.purge_peer(&peer);
                if let Some(peer_id) = self.id_by_peer.remove(&peer) {
                    self.peer_by_id.remove(&peer_id);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(DhtStats {
                    connected_peers: self.swarm.connected_peers().count(),
                    admitted_peers: self.validator.identities().len(),
                    stored_keys: self.records.key_count(),
                    stored_records: self.records.record_count(),
                });
            }
        }
    }

    /// Validate + store locally, then replicate to the closest admitted
    /// peers for the key
    fn store_and_replicate(&mut self, key: Key, envelope: Vec<u8>) -> bool {
        let now = now_ms();
        let accepted = match self.validator.validate_store(&key, &envelope, now) {
            Ok(verified) => {
                self.emit_record_events(&key, &verified);
                self.records.put(
                    key,
                    StoredRecord::from_verified(verified, envelope.clone()),
                    now,
                )
            }
            Err(e) => {
                debug!(error = %e, "own publish failed validation");
                false
            }
        };

        if accepted {
            let peers = self.validator.identities().fingerprints();
            for replica in closest_n(&key, &peers, REPLICATION_FACTOR) {
                if replica == self.identity.fingerprint() {
                    continue;
                }
                if let Some(peer_id) = self.id_by_peer.get(&replica).copied() {
                    self.swarm.behaviour_mut().record_exchange.send_request(
                        &peer_id,
                        RpcRequest::Store {
                            key,
                            envelope: envelope.clone(),
                        },
                    );
                }
            }
        }
        accepted
    }

    fn start_find_value(&mut self, key: Key, reply: oneshot::Sender<Vec<Vec<u8>>>) {
        let local: Vec<Vec<u8>> = self
            .records
            .get(&key, now_ms())
            .into_iter()
            .map(|r| r.envelope_bytes.clone())
            .filter(|b| !b.is_empty())
            .collect();

        let peers = self.validator.identities().fingerprints();
        let replicas: Vec<Fingerprint> = closest_n(&key, &peers, REPLICATION_FACTOR)
            .into_iter()
            .filter(|fp| *fp != self.identity.fingerprint())
            .filter(|fp| self.id_by_peer.contains_key(fp))
            .collect();

        if replicas.is_empty() {
            let _ = reply.send(local);
            return;
        }

        let query = Arc::new(std::sync::Mutex::new(FindValueQuery {
            collected: local,
            outstanding: replicas.len(),
            reply: Some(reply),
        }));

        for replica in replicas {
            let peer_id = self.id_by_peer[&replica];
            let request_id = self
                .swarm
                .behaviour_mut()
                .record_exchange
                .send_request(&peer_id, RpcRequest::FindValue { key });
            self.find_queries.insert(request_id, Arc::clone(&query));
        }
    }

    fn send_request(
        &mut self,
        peer: Fingerprint,
        request: RpcRequest,
        reply: oneshot::Sender<Result<RpcResponse, NodeError>>,
    ) {
        let Some(peer_id) = self.id_by_peer.get(&peer).copied() else {
            let _ = reply.send(Err(NodeError::NotConnected(peer)));
            return;
        };
        let request_id = self
            .swarm
            .behaviour_mut()
            .record_exchange
            .send_request(&peer_id, request);
        self.pending.insert(
            request_id,
            PendingRequest {
                reply,
                peer,
                sent_at: Instant::now(),
            },
        );
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {}", address);
                let _ = self.event_tx.send(DhtEvent::Listening { address }).await;
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!(%peer_id, "connected, sending identity handshake");
                if let Some(ip) = multiaddr_ip(endpoint.get_remote_address()) {
                    self.remote_ips.insert(peer_id, ip);
                }
                self.swarm.behaviour_mut().record_exchange.send_request(
                    &peer_id,
                    RpcRequest::Hello {
                        identity: self.identity.clone(),
                    },
                );
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                self.remote_ips.remove(&peer_id);
                if let Some(fp) = self.peer_by_id.remove(&peer_id) {
                    self.id_by_peer.remove(&fp);
                    if let Some((bucket, subnet)) = self.bucket_of.remove(&fp) {
                        self.diversity.release(bucket, subnet);
                    }
                    let _ = self
                        .event_tx
                        .send(DhtEvent::PeerDisconnected { peer: fp })
                        .await;
                }
            }
            SwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(behaviour_event).await;
            }
            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: MeshBehaviourEvent) {
        match event {
            MeshBehaviourEvent::RecordExchange(ev) => self.handle_record_event(ev).await,
            MeshBehaviourEvent::Kademlia(kad_event) => {
                if let kad::Event::RoutingUpdated { peer, .. } = kad_event {
                    debug!(%peer, "kademlia routing updated");
                }
            }
            MeshBehaviourEvent::Identify(identify_event) => {
                if let libp2p::identify::Event::Received { peer_id, info, .. } = identify_event {
                    for addr in info.listen_addrs {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, addr);
                    }
                }
            }
            MeshBehaviourEvent::Ping(_) => {}
        }
    }

    async fn handle_record_event(&mut self, event: super::behaviour::RecordExchangeEvent) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    self.handle_inbound_request(peer, request, channel).await;
                }
                request_response::Message::Response { request_id, response } => {
                    self.handle_inbound_response(peer, request_id, response)
                        .await;
                }
            },
            request_response::Event::OutboundFailure { peer, request_id, error } => {
                debug!(%peer, ?error, "outbound request failed");
                if let Some(pending) = self.pending.remove(&request_id) {
                    let _ = pending
                        .reply
                        .send(Err(NodeError::RequestFailed(error.to_string())));
                }
                self.finish_find_query(request_id, None);
                if let Some(fp) = self.peer_by_id.get(&peer) {
                    let _ = self.peer_store.record_failed_probe(fp);
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, ?error, "inbound request failed");
            }
            _ => {}
        }
    }

    async fn handle_inbound_request(
        &mut self,
        peer: PeerId,
        request: RpcRequest,
        channel: ResponseChannel<RpcResponse>,
    ) {
        let sender_fp = self.peer_by_id.get(&peer).copied();

        // Isolated peers are dropped before any processing
        if let Some(fp) = &sender_fp {
            if self.backend.is_isolated(fp) {
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .record_exchange
                    .send_response(channel, RpcResponse::Denied);
                return;
            }
        }

        let response = match request {
            RpcRequest::Hello { identity } => {
                if self.admit_hello(peer, identity).await {
                    RpcResponse::Hello {
                        identity: self.identity.clone(),
                    }
                } else {
                    RpcResponse::Denied
                }
            }
            RpcRequest::Store { key, envelope } => {
                let now = now_ms();
                match self.validator.validate_store(&key, &envelope, now) {
                    Ok(verified) => {
                        self.emit_record_events(&key, &verified);
                        let accepted = self.records.put(
                            key,
                            StoredRecord::from_verified(verified, envelope),
                            now,
                        );
                        RpcResponse::Stored { accepted }
                    }
                    Err(_) => {
                        if let Some(fp) = sender_fp {
                            let strikes = self.validator.strikes(&fp);
                            let _ = self
                                .event_tx
                                .send(DhtEvent::StrikeRecorded { peer: fp, strikes })
                                .await;
                        }
                        RpcResponse::Stored { accepted: false }
                    }
                }
            }
            RpcRequest::FindValue { key } => {
                let records = self.records.get(&key, now_ms());
                let truncated = records.len() >= MAX_RESPONSE_RECORDS;
                RpcResponse::Records {
                    envelopes: records
                        .into_iter()
                        .map(|r| r.envelope_bytes.clone())
                        .filter(|b| !b.is_empty())
                        .collect(),
                    truncated,
                }
            }
            RpcRequest::KeywordLookup { keyword_keys, limit } => {
                match self.backend.admit(sender_fp.as_ref()) {
                    Admission::Granted => {
                        let now = now_ms();
                        let per_key = (limit as usize).clamp(1, MAX_RESPONSE_RECORDS);
                        let mut envelopes = Vec::new();
                        let mut partial = false;
                        for key in &keyword_keys {
                            let records = self.records.get(key, now);
                            if records.len() > per_key {
                                partial = true;
                            }
                            envelopes.extend(
                                records
                                    .into_iter()
                                    .take(per_key)
                                    .map(|r| r.envelope_bytes.clone())
                                    .filter(|b| !b.is_empty()),
                            );
                        }
                        self.backend.lookup_served(sender_fp.as_ref());
                        RpcResponse::Pointers { envelopes, partial }
                    }
                    Admission::Busy => RpcResponse::Busy,
                    Admission::Denied => RpcResponse::Denied,
                }
            }
            RpcRequest::DocMeta { doc_ids } => match self.backend.admit(sender_fp.as_ref()) {
                Admission::Granted => RpcResponse::DocMetas {
                    docs: self.backend.doc_metas(&doc_ids),
                },
                Admission::Busy => RpcResponse::Busy,
                Admission::Denied => RpcResponse::Denied,
            },
            request @ RpcRequest::AuditObservation { .. } => {
                if self.backend.audit_observation(&request) {
                    RpcResponse::Ack
                } else {
                    RpcResponse::Denied
                }
            }
        };

        let _ = self
            .swarm
            .behaviour_mut()
            .record_exchange
            .send_response(channel, response);
    }

    async fn handle_inbound_response(
        &mut self,
        peer: PeerId,
        request_id: OutboundRequestId,
        response: RpcResponse,
    ) {
        // Handshake replies establish the peer mapping
        if let RpcResponse::Hello { identity } = &response {
            self.admit_hello(peer, identity.clone()).await;
            return;
        }

        if let Some(pending) = self.pending.remove(&request_id) {
            let rtt_ms = pending.sent_at.elapsed().as_secs_f64() * 1000.0;
            if let Ok(Some(mut profile)) = self.peer_store.get(&pending.peer) {
                profile.observe_latency(rtt_ms);
                let _ = self.peer_store.upsert(&profile);
            }
            let _ = pending.reply.send(Ok(response));
            return;
        }

        self.finish_find_query(request_id, Some(response));
    }

    /// Admit a handshaking peer: PoW check via the identity registry,
    /// then k-bucket subnet diversity (at most 2 per /16 per bucket)
    async fn admit_hello(&mut self, peer: PeerId, identity: PeerIdentity) -> bool {
        let fp = identity.fingerprint();
        if self.id_by_peer.contains_key(&fp) {
            return true;
        }

        let own_key = Key::from_fingerprint(&self.identity.fingerprint());
        let bucket = own_key
            .distance(&Key::from_fingerprint(&fp))
            .bucket_index()
            .unwrap_or(0);
        let subnet = self.remote_ips.get(&peer).and_then(subnet16);
        if !self.diversity.admit(bucket, subnet) {
            debug!(peer = %fp, bucket, "subnet diversity limit, not admitted");
            return false;
        }

        if !self.validator.register_identity(identity.clone()) {
            self.diversity.release(bucket, subnet);
            return false;
        }

        self.bucket_of.insert(fp, (bucket, subnet));
        self.peer_by_id.insert(peer, fp);
        self.id_by_peer.insert(fp, peer);

        let now = now_ms();
        match self.peer_store.get(&fp) {
            Ok(Some(_)) => {
                let _ = self.peer_store.record_contact(&fp, now);
            }
            _ => {
                let mut profile = super::peer_store::PeerProfile::new(identity, now);
                profile.subnet = subnet;
                let _ = self.peer_store.upsert(&profile);
            }
        }
        let _ = self.event_tx.send(DhtEvent::PeerAdmitted { peer: fp }).await;
        true
    }

    /// Fold one replica's answer into an aggregate FIND_VALUE query
    fn finish_find_query(&mut self, request_id: OutboundRequestId, response: Option<RpcResponse>) {
        let Some(query) = self.find_queries.remove(&request_id) else {
            return;
        };
        let mut state = query.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(RpcResponse::Records { envelopes, .. }) = response {
            state.collected.extend(envelopes);
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            if let Some(reply) = state.reply.take() {
                let mut collected = std::mem::take(&mut state.collected);
                collected.truncate(MAX_RESPONSE_RECORDS);
                let _ = reply.send(collected);
            }
        }
    }

    /// Surface takedown and audit payloads to their durable consumers
    fn emit_record_events(&self, key: &Key, verified: &super::validator::VerifiedRecord) {
        let event = match &verified.payload {
            RecordPayload::Takedown(rec) | RecordPayload::Deletion(rec) => {
                Some(DhtEvent::TakedownReceived { record: rec.clone() })
            }
            RecordPayload::AuditReport(report) => Some(DhtEvent::AuditReceived {
                report: report.clone(),
            }),
            _ => None,
        };
        if let Some(event) = event {
            // try_send: the node task must never await while holding state
            let _ = self.event_tx.try_send(event);
        }
        let _ = self.event_tx.try_send(DhtEvent::RecordAccepted {
            key: *key,
            sender: verified.sender,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;

    impl LookupBackend for NullBackend {
        fn doc_metas(&self, _doc_ids: &[u64]) -> Vec<DocMetaEntry> {
            vec![]
        }
        fn admit(&self, _peer: Option<&Fingerprint>) -> Admission {
            Admission::Granted
        }
        fn is_isolated(&self, _peer: &Fingerprint) -> bool {
            false
        }
        fn lookup_served(&self, _peer: Option<&Fingerprint>) {}
        fn audit_observation(&self, _request: &RpcRequest) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_bootstrap_requires_seeds_or_peer_store() {
        let dir = tempfile::tempdir().unwrap();
        let keys = NodeKeys::from_secret_bytes([1u8; 32]).unwrap();
        let identity = PeerIdentity::mine(keys.public_key_bytes(), 4, 0);
        let peer_store = Arc::new(PeerStore::open(dir.path()).unwrap());

        let result = DhtNode::new(
            &keys,
            identity,
            DhtConfig {
                listen_port: 0,
                bootstrap_peers: vec![],
                pow_difficulty: 4,
            },
            peer_store,
            Arc::new(NullBackend),
        );
        assert!(matches!(result, Err(NodeError::InsufficientBootstrap)));
    }

    #[tokio::test]
    async fn test_node_starts_with_persisted_peers() {
        use super::super::peer_store::PeerProfile;

        let dir = tempfile::tempdir().unwrap();
        let keys = NodeKeys::from_secret_bytes([2u8; 32]).unwrap();
        let identity = PeerIdentity::mine(keys.public_key_bytes(), 4, 0);

        let peer_store = Arc::new(PeerStore::open(dir.path()).unwrap());
        let remembered = PeerIdentity::mine([3u8; 32], 4, 0);
        peer_store
            .upsert(&PeerProfile::new(remembered, 0))
            .unwrap();

        let result = DhtNode::new(
            &keys,
            identity,
            DhtConfig {
                listen_port: 0,
                bootstrap_peers: vec![],
                pow_difficulty: 4,
            },
            peer_store,
            Arc::new(NullBackend),
        );
        assert!(result.is_ok());
    }
}
