//! Node assembly
//!
//! Builds every subsystem over one data directory and wires the event
//! flows between them: overlay events into the trust kernel and
//! takedown store, crawl results into credits, audit cycles into trust
//! scores, and the governor's degradation level into everything.
//!
//! Persistent layout under the data directory:
//!
//! ```text
//! keys/                 private+public key files, 0600
//! index/                local index files
//! index/dedup/          dedup state
//! dht/peer_store/       persistent peer cache
//! ledger/               append-only credit chain
//! takedowns/            persisted deletion/takedown records
//! audit/                trust scores and audit outcomes
//! pid                   process id (advisory)
//! ```

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{
    truncate_text, CrawlAck, CrawlRequest, FetchPageReply, SearchReply, SearchRequest,
    SearchResultItem, StatusReply, MAX_FETCH_TEXT_BYTES,
};
use crate::config::MeshConfig;
use crate::crawl::{
    canonicalize, extract, fetch_page, normalize_for_hash, origin_of, CrawlConfig, CrawlEngine,
    CrawlOutcome, DedupStore,
};
use crate::credits::{ActionType, CreditLedger};
use crate::crypto::{ContentHash, Fingerprint, NodeKeys, NonceCounter, PeerIdentity};
use crate::dht::node::now_ms;
use crate::dht::records::{RecordPayload, TakedownTarget};
use crate::dht::{
    Admission, DhtConfig, DhtEvent, DhtHandle, DhtNode, DocMetaEntry, Key, LookupBackend,
    PeerStore, RpcRequest, RpcResponse,
};
use crate::errors::MeshError;
use crate::governor::{BandwidthThrottle, CrawlGuard, Governor, QueryGuard};
use crate::index::{make_snippet, LinkGraph, LocalIndex, VectorRegistry};
use crate::search::{SearchConfig, SearchOrchestrator};
use crate::trust::{
    self, audit, AttestationCache, AuditCollector, AuditTarget, TrustStore, TrustTier,
};
use crate::trust::takedown::TakedownStore;

/// Uptime heartbeat cadence
const HEARTBEAT: Duration = Duration::from_secs(600);
/// Authority refresh, ledger-root publication, and recrawl cadence
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
/// Pages re-crawled per maintenance pass
const RECRAWLS_PER_PASS: usize = 8;

/// Everything the rest of the world talks to
pub struct MeshNode {
    config: MeshConfig,
    keys: Arc<NodeKeys>,
    identity: PeerIdentity,
    index: Arc<LocalIndex>,
    dedup: Arc<DedupStore>,
    peer_store: Arc<PeerStore>,
    trust: Arc<TrustStore>,
    takedowns: Arc<TakedownStore>,
    ledger: Arc<CreditLedger>,
    attestations: Arc<AttestationCache>,
    governor: Arc<Governor>,
    dht: DhtHandle,
    engine: Arc<CrawlEngine>,
    orchestrator: Arc<SearchOrchestrator>,
    client: reqwest::Client,
    collector: Arc<AuditCollector>,
    nonces: Arc<Mutex<NonceCounter>>,
    crawl_guard: CrawlGuard,
    link_graph: Arc<Mutex<LinkGraph>>,
    authority_scores: Arc<Mutex<std::collections::HashMap<String, f64>>>,
}

/// Bridges inbound overlay probes to local services
struct NodeBackend {
    index: Arc<LocalIndex>,
    trust: Arc<TrustStore>,
    ledger: Arc<CreditLedger>,
    governor: Arc<Governor>,
    query_guard: QueryGuard,
    collector: Arc<AuditCollector>,
    completed_audits: tokio::sync::mpsc::UnboundedSender<(
        AuditTarget,
        audit::AuditEvaluation,
        Vec<crate::dht::AuditorObservation>,
        u64,
    )>,
}

impl LookupBackend for NodeBackend {
    fn doc_metas(&self, doc_ids: &[u64]) -> Vec<DocMetaEntry> {
        doc_ids
            .iter()
            .filter_map(|id| {
                let doc = self.index.get_doc(*id).ok()?;
                Some(DocMetaEntry {
                    doc_id: doc.doc_id,
                    snippet: make_snippet(&doc.text, &[], 240),
                    url: doc.canonical_url,
                    title: doc.title,
                    content_hash: doc.content_hash,
                    crawl_time_ms: doc.crawl_time_ms,
                })
            })
            .collect()
    }

    fn admit(&self, peer: Option<&Fingerprint>) -> Admission {
        if !self.governor.level().allows_inbound() {
            return Admission::Busy;
        }
        if let Some(peer) = peer {
            if self.trust.is_isolated(peer) {
                return Admission::Denied;
            }
        }
        match self.query_guard.admit(peer.copied()) {
            Ok(_permit) => Admission::Granted,
            Err(_) => Admission::Busy,
        }
    }

    fn is_isolated(&self, peer: &Fingerprint) -> bool {
        self.trust.is_isolated(peer)
    }

    fn lookup_served(&self, _peer: Option<&Fingerprint>) {
        // Serving a remote query earns the processing credit
        let _ = self
            .ledger
            .record_action(ActionType::QueryProcess, 1.0, 1.0, "lookup served", now_ms());
    }

    fn audit_observation(&self, request: &RpcRequest) -> bool {
        let RpcRequest::AuditObservation {
            target_peer,
            target_url,
            attested_hash,
            epoch,
            auditor,
            observed_hash,
            signature,
        } = request
        else {
            return false;
        };
        // Auditors pick targets independently, so the aggregator may
        // first learn of a cycle from an incoming observation
        self.collector.open_cycle(
            AuditTarget {
                peer: *target_peer,
                canonical_url: target_url.clone(),
                attested_hash: *attested_hash,
            },
            *epoch,
        );
        let observation = crate::dht::AuditorObservation {
            auditor: *auditor,
            observed_hash: *observed_hash,
            signature: signature.clone(),
        };
        if let Some((target, evaluation, observations)) =
            self.collector
                .add_observation(*target_peer, target_url, *epoch, observation)
        {
            let _ = self
                .completed_audits
                .send((target, evaluation, observations, *epoch));
        }
        true
    }
}

impl MeshNode {
    /// Bring the node up: load identity, open stores, start the
    /// overlay, governor, audit loop, and heartbeat.
    pub async fn start(config: MeshConfig) -> Result<Arc<Self>, MeshError> {
        config.validate()?;
        let data_dir = config.data_dir.clone();
        fs::create_dir_all(&data_dir).map_err(|e| MeshError::Fatal(e.to_string()))?;

        // Advisory pid file
        let _ = fs::write(data_dir.join("pid"), std::process::id().to_string());

        // Identity: missing keys are generated once; a broken key file
        // refuses startup
        let keys = Arc::new(NodeKeys::ensure(&data_dir.join("keys"))?);
        let identity = Self::load_or_mine_identity(&data_dir, &keys, config.pow_difficulty).await?;
        info!(fingerprint = %identity.fingerprint(), "node identity ready");

        let index = Arc::new(
            LocalIndex::open(data_dir.join("index"), config.tokenizer)
                .map_err(|e| MeshError::Fatal(e.to_string()))?,
        );
        let dedup = Arc::new(
            DedupStore::open(data_dir.join("index").join("dedup"))
                .map_err(|e| MeshError::Fatal(e.to_string()))?,
        );
        let peer_store = Arc::new(
            PeerStore::open(data_dir.join("dht").join("peer_store"))
                .map_err(|e| MeshError::Fatal(e.to_string()))?,
        );
        let ledger = Arc::new(
            CreditLedger::open(data_dir.join("ledger"), Arc::clone(&keys))
                .map_err(|e| MeshError::Fatal(e.to_string()))?,
        );
        // A broken chain is a refuse-to-start condition
        ledger.verify_chain().map_err(MeshError::from)?;
        let takedowns = Arc::new(
            TakedownStore::open(data_dir.join("takedowns"))
                .map_err(|e| MeshError::Fatal(e.to_string()))?,
        );
        let trust = Arc::new(
            TrustStore::open(data_dir.join("audit"))
                .map_err(|e| MeshError::Fatal(e.to_string()))?,
        );

        let attestations = Arc::new(AttestationCache::new());
        let governor = Arc::new(Governor::new());
        tokio::spawn(Arc::clone(&governor).run());

        let limits = config.profile.limits();
        let collector = Arc::new(AuditCollector::new());
        let (audit_tx, mut audit_rx) = tokio::sync::mpsc::unbounded_channel();

        let backend = Arc::new(NodeBackend {
            index: Arc::clone(&index),
            trust: Arc::clone(&trust),
            ledger: Arc::clone(&ledger),
            governor: Arc::clone(&governor),
            query_guard: QueryGuard::new(limits.qpm_limit, limits.max_concurrent_queries),
            collector: Arc::clone(&collector),
            completed_audits: audit_tx,
        });

        let bootstrap_peers = config
            .bootstrap
            .iter()
            .filter_map(|addr| {
                let multiaddr: libp2p::Multiaddr = addr.parse().ok()?;
                let peer_id = multiaddr.iter().find_map(|p| match p {
                    libp2p::multiaddr::Protocol::P2p(id) => Some(id),
                    _ => None,
                })?;
                Some((peer_id, multiaddr))
            })
            .collect();

        let (dht_node, dht, mut events) = DhtNode::new(
            &keys,
            identity.clone(),
            DhtConfig {
                listen_port: config.listen_port,
                bootstrap_peers,
                pow_difficulty: config.pow_difficulty,
            },
            Arc::clone(&peer_store),
            backend,
        )?;
        tokio::spawn(dht_node.run());

        let client = crate::crawl::build_client().map_err(|e| MeshError::Fatal(e.to_string()))?;
        let link_graph = Arc::new(Mutex::new(LinkGraph::new()));
        // Seeded from wall time so nonces stay monotonic across restarts
        let nonces = Arc::new(Mutex::new(NonceCounter::new(now_ms())));
        let throttle = Arc::new(BandwidthThrottle::new(limits.upload_bps, limits.download_bps));

        let engine = Arc::new(CrawlEngine::new(
            Arc::clone(&keys),
            identity.clone(),
            Arc::clone(&nonces),
            dht.clone(),
            Arc::clone(&index),
            Arc::clone(&dedup),
            client.clone(),
            Arc::clone(&link_graph),
            Arc::clone(&ledger),
            Arc::clone(&takedowns),
            Arc::clone(&attestations),
            Arc::clone(&throttle),
            CrawlConfig {
                max_concurrent: limits.max_concurrent_crawls,
                ..CrawlConfig::default()
            },
        ));

        let authority_scores = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let orchestrator = Arc::new(SearchOrchestrator::new(
            identity.fingerprint(),
            Arc::clone(&index),
            dht.clone(),
            Arc::clone(&trust),
            Arc::clone(&attestations),
            Arc::clone(&takedowns),
            Arc::clone(&peer_store),
            Arc::clone(&ledger),
            Arc::clone(&governor),
            VectorRegistry::none(),
            Arc::clone(&authority_scores),
            SearchConfig {
                fanout: config.fanout.min(limits.search_fanout),
                pow_difficulty: config.pow_difficulty,
                ..SearchConfig::default()
            },
        ));

        let node = Arc::new(Self {
            config,
            keys,
            identity,
            index,
            dedup,
            peer_store,
            trust,
            takedowns,
            ledger,
            attestations,
            governor,
            dht,
            engine,
            orchestrator,
            client,
            collector,
            nonces,
            crawl_guard: CrawlGuard::new(),
            link_graph,
            authority_scores,
        });

        // Overlay events: takedowns, audits, strikes, peer churn
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    node.handle_dht_event(event).await;
                }
            });
        }

        // Completed audit cycles from the collector
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                while let Some((target, evaluation, observations, epoch)) = audit_rx.recv().await {
                    node.apply_audit(&target, &evaluation, observations, epoch)
                        .await;
                }
            });
        }

        // Uptime heartbeat
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT);
                ticker.tick().await; // immediate first tick carries no uptime
                loop {
                    ticker.tick().await;
                    node.heartbeat();
                }
            });
        }

        // Audit loop
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(trust::next_audit_delay()).await;
                    node.run_audit_cycle().await;
                }
            });
        }

        // Maintenance: authority refresh, ledger root publication,
        // adaptive recrawl
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    node.maintenance().await;
                }
            });
        }

        Ok(node)
    }

    async fn load_or_mine_identity(
        data_dir: &std::path::Path,
        keys: &Arc<NodeKeys>,
        difficulty: u32,
    ) -> Result<PeerIdentity, MeshError> {
        let identity_path = data_dir.join("keys").join("identity.json");
        if let Ok(bytes) = fs::read(&identity_path) {
            if let Ok(identity) = serde_json::from_slice::<PeerIdentity>(&bytes) {
                if identity.public_key == keys.public_key_bytes()
                    && identity.verify_pow(difficulty)
                {
                    return Ok(identity);
                }
                warn!("persisted identity invalid, re-mining");
            }
        }

        info!(difficulty, "mining proof-of-work identity");
        let public_key = keys.public_key_bytes();
        let created = now_ms();
        let identity =
            tokio::task::spawn_blocking(move || PeerIdentity::mine(public_key, difficulty, created))
                .await
                .map_err(|e| MeshError::Fatal(e.to_string()))?;

        let bytes = serde_json::to_vec(&identity).map_err(|e| MeshError::Fatal(e.to_string()))?;
        fs::write(&identity_path, bytes).map_err(|e| MeshError::Fatal(e.to_string()))?;
        Ok(identity)
    }

    async fn handle_dht_event(&self, event: DhtEvent) {
        match event {
            DhtEvent::TakedownReceived { record } => {
                let now = now_ms();
                if let Err(e) = self.takedowns.accept(record.clone(), now) {
                    warn!(error = %e, "takedown persist failed");
                    return;
                }
                // Apply to the local index immediately
                match &record.target {
                    TakedownTarget::Url(url) => {
                        if let Ok(Some(doc)) = self.index.get_by_url(url) {
                            let _ = self.index.remove_doc(doc.doc_id);
                            let _ = self.dedup.forget(url, &doc.content_hash);
                            self.orchestrator.cache().purge_doc(doc.doc_id);
                        }
                    }
                    TakedownTarget::Hash(hash) => {
                        if let Ok(Some(doc_id)) = self.dedup.doc_for_content(hash) {
                            if let Ok(doc) = self.index.get_doc(doc_id) {
                                let _ = self.dedup.forget(&doc.canonical_url, hash);
                            }
                            let _ = self.index.remove_doc(doc_id);
                            self.orchestrator.cache().purge_doc(doc_id);
                        }
                    }
                }
            }
            DhtEvent::AuditReceived { report } => {
                // A published report from another aggregator lands on
                // the target's trust record
                if let Some(evaluation) =
                    audit::evaluate(&report.attested_hash, &report.target_peer, &report.observations)
                {
                    let _ = self.trust.record_audit_outcome(
                        &report.target_peer,
                        evaluation.outcome,
                        now_ms(),
                    );
                    if self.trust.is_isolated(&report.target_peer) {
                        let _ = self.dht.purge_peer(report.target_peer).await;
                    }
                }
            }
            DhtEvent::StrikeRecorded { peer, strikes } => {
                let _ = self.trust.record_strike(&peer, now_ms());
                if strikes >= 10 {
                    let _ = self.trust.isolate(&peer, now_ms());
                    let _ = self.dht.purge_peer(peer).await;
                }
            }
            DhtEvent::RecordAccepted { .. } => {}
            DhtEvent::PeerAdmitted { peer } => {
                debug!(peer = %peer, "peer admitted");
            }
            DhtEvent::PeerDisconnected { .. } | DhtEvent::Listening { .. } => {}
        }
    }

    fn heartbeat(&self) {
        let now = now_ms();
        let own = self.identity.fingerprint();
        let secs = HEARTBEAT.as_secs();
        let _ = self.trust.record_uptime(&own, secs, now);
        let _ = self.ledger.record_action(
            ActionType::NetworkUptime,
            secs as f64 / 3600.0,
            1.0,
            "uptime",
            now,
        );
        let _ = self
            .trust
            .record_contribution(&own, self.ledger.contribution_score(), now);
        self.attestations.sweep(now);
        self.collector.expire();
        self.engine.prune();
    }

    /// Hourly maintenance: refresh link-graph authority, publish the
    /// credit ledger root, and re-crawl pages past their interval.
    async fn maintenance(&self) {
        let now = now_ms();

        // Authority refresh from the crawled link graph
        let scores = {
            let graph = self.link_graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.authority_scores()
        };
        {
            let mut shared = self
                .authority_scores
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *shared = scores;
        }

        // Ledger root publication for Merkle challenges
        if let Ok(Some(root)) = self.ledger.merkle_root() {
            let payload = RecordPayload::CreditLedgerRoot(crate::dht::CreditLedgerRoot {
                peer_id: self.identity.fingerprint(),
                entry_count: self.ledger.entry_count(),
                merkle_root: root,
                published_at_ms: now,
            });
            let nonce = self.nonces.lock().unwrap_or_else(|e| e.into_inner()).next();
            if let Ok(envelope) =
                crate::crypto::Envelope::sign(&self.keys, &self.identity, nonce, now, payload.encode())
            {
                let key = Key::for_ledger_root(&self.identity.fingerprint());
                let _ = self.dht.publish(key, envelope.encode()).await;
            }
        }

        // Adaptive recrawl: oldest documents past their interval
        if self.governor.level().allows_crawling() {
            let authority = {
                let shared = self
                    .authority_scores
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                shared.clone()
            };
            let due: Vec<String> = self
                .index
                .iter_recent(0)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|doc_id| self.index.get_doc(doc_id).ok())
                .filter(|doc| {
                    let auth = authority
                        .get(&doc.canonical_url)
                        .copied()
                        .unwrap_or(doc.authority_score);
                    // Change ratio is unknown until the re-crawl lands;
                    // assume moderate churn
                    let interval = crate::crawl::recrawl_interval_ms(0.5, auth);
                    now.saturating_sub(doc.crawl_time_ms) > interval
                })
                .map(|doc| doc.canonical_url)
                .take(RECRAWLS_PER_PASS)
                .collect();

            for url in due {
                match self.engine.crawl_url(&url, true).await {
                    Ok(outcome) => debug!(%url, ?outcome, "recrawl"),
                    Err(e) => debug!(%url, error = %e, "recrawl failed"),
                }
            }
        }
    }

    /// One audit cycle: pick a target, check our election, observe,
    /// and route the observation to the cycle's aggregator.
    async fn run_audit_cycle(&self) {
        let now = now_ms();
        let targets = self.attestations.audit_targets(now);
        let own = self.identity.fingerprint();
        let candidates: Vec<AuditTarget> =
            targets.into_iter().filter(|t| t.peer != own).collect();
        let Some(target) = audit::pick_target(&candidates) else {
            return;
        };

        let epoch = now / audit::AUDIT_INTERVAL.as_millis() as u64;
        let mut peers = self.dht.known_peers().await.unwrap_or_default();
        peers.push(own);
        let auditors = audit::elect_auditors(&target, epoch, &peers);
        if !auditors.contains(&own) {
            return;
        }

        // Independent re-crawl of the attested URL
        let observed = match fetch_page(&self.client, &target.canonical_url).await {
            Ok(page) => {
                let text = extract(
                    &String::from_utf8_lossy(&page.body),
                    &page.content_type,
                    &page.final_url,
                );
                ContentHash::from_text(&normalize_for_hash(&text.text))
            }
            Err(e) => {
                debug!(url = %target.canonical_url, error = %e, "audit fetch failed");
                return;
            }
        };

        let observation =
            audit::sign_observation(&self.keys, &self.identity, &target, observed, epoch);

        // Lowest-fingerprint auditor aggregates the cycle
        let aggregator = auditors
            .iter()
            .min_by_key(|fp| *fp.as_bytes())
            .copied()
            .unwrap_or(own);

        if aggregator == own {
            // Open the cycle on the shared collector so remote
            // observations land in the same bucket as our own
            self.collector.open_cycle(target.clone(), epoch);
            let url = target.canonical_url.clone();
            if let Some((target, evaluation, observations)) =
                self.collector
                    .add_observation(target.peer, &url, epoch, observation)
            {
                self.apply_audit(&target, &evaluation, observations, epoch)
                    .await;
            }
        } else {
            let request = RpcRequest::AuditObservation {
                target_peer: target.peer,
                target_url: target.canonical_url.clone(),
                attested_hash: target.attested_hash,
                epoch,
                auditor: observation.auditor,
                observed_hash: observation.observed_hash,
                signature: observation.signature.clone(),
            };
            match self.dht.request(aggregator, request).await {
                Ok(RpcResponse::Ack) => {}
                other => debug!(?other, "observation delivery failed"),
            }
        }
    }

    /// Publish a completed cycle's report and apply the outcome
    async fn apply_audit(
        &self,
        target: &AuditTarget,
        evaluation: &audit::AuditEvaluation,
        observations: Vec<crate::dht::AuditorObservation>,
        epoch: u64,
    ) {
        let now = now_ms();
        let report = audit::build_report(target, evaluation, observations, now);
        let payload = RecordPayload::AuditReport(report);

        // Publish for the network; local trust applies regardless
        let nonce = self.nonces.lock().unwrap_or_else(|e| e.into_inner()).next();
        if let Ok(envelope) = crate::crypto::Envelope::sign(
            &self.keys,
            &self.identity,
            nonce,
            now,
            payload.encode(),
        ) {
            let key = Key::for_audit_election(&target.peer, &target.canonical_url, epoch);
            let _ = self.dht.publish(key, envelope.encode()).await;
        }

        let _ = self
            .trust
            .record_audit_outcome(&target.peer, evaluation.outcome, now);
        if self.trust.is_isolated(&target.peer) {
            let _ = self.dht.purge_peer(target.peer).await;
        }
    }

    // --- Tool surface -----------------------------------------------------

    /// `search`: distributed query
    pub async fn search(&self, request: SearchRequest) -> SearchReply {
        self.search_inner(request, false).await
    }

    /// `search_local`: no network I/O
    pub async fn search_local(&self, request: SearchRequest) -> SearchReply {
        self.search_inner(request, true).await
    }

    async fn search_inner(&self, request: SearchRequest, local_only: bool) -> SearchReply {
        let response = self
            .orchestrator
            .search(&request.query, request.clamped_limit(), local_only)
            .await;
        SearchReply {
            results: response
                .results
                .iter()
                .map(|r| SearchResultItem::from_ranked(r, true))
                .collect(),
            partial: response.partial,
        }
    }

    /// `fetch_page`: cached text when indexed, live fetch otherwise
    pub async fn fetch_page(&self, url: &str) -> Result<FetchPageReply, MeshError> {
        let canonical = canonicalize(url)?;

        if let Ok(Some(doc)) = self.index.get_by_url(&canonical) {
            return Ok(FetchPageReply {
                text: truncate_text(&doc.text, MAX_FETCH_TEXT_BYTES),
                is_cached: true,
                crawl_time_ms: doc.crawl_time_ms,
                source_url: doc.canonical_url,
            });
        }

        let page = fetch_page(&self.client, &canonical).await?;
        let extracted = extract(
            &String::from_utf8_lossy(&page.body),
            &page.content_type,
            &page.final_url,
        );
        Ok(FetchPageReply {
            text: truncate_text(&extracted.text, MAX_FETCH_TEXT_BYTES),
            is_cached: false,
            crawl_time_ms: now_ms(),
            source_url: page.final_url.to_string(),
        })
    }

    /// `crawl_url`: admission-guarded crawl request
    pub async fn crawl_url(&self, request: CrawlRequest) -> Result<CrawlAck, MeshError> {
        request.validate().map_err(MeshError::InputRejected)?;
        if !self.governor.level().allows_crawling() {
            return Err(MeshError::ResourceExhausted(
                "crawling paused by resource governor".into(),
            ));
        }

        // Throttle: 60/h per caller, 10 pending per domain
        let canonical = canonicalize(&request.url)?;
        let domain = origin_of(&canonical).unwrap_or_else(|| canonical.clone());
        let ticket = self
            .crawl_guard
            .admit(self.identity.fingerprint(), &domain)
            .map_err(MeshError::from)?;

        let outcome = self
            .engine
            .crawl_url(&request.url, request.force)
            .await
            .map_err(|e| MeshError::TransientIo(e.to_string()));
        self.crawl_guard.settle(ticket);
        let outcome = outcome?;

        let (accepted, detail) = match &outcome {
            CrawlOutcome::Indexed { doc_id } => (true, format!("indexed as document {doc_id}")),
            CrawlOutcome::AlreadyIndexed => (false, "ALREADY_INDEXED".to_string()),
            CrawlOutcome::DuplicateContent => (false, "duplicate content".to_string()),
            CrawlOutcome::NearDuplicate { doc_id, .. } => {
                (true, format!("stored as near-duplicate document {doc_id}"))
            }
            CrawlOutcome::NotOwned => (false, "url owned by other peers".to_string()),
            CrawlOutcome::LockHeld => (false, "crawl lock held".to_string()),
            CrawlOutcome::Rejected { reason } => (false, reason.clone()),
            CrawlOutcome::Failed { reason } => (false, reason.clone()),
        };

        // Depth > 0: harvest out-links of a fresh document for the
        // crawl frontier, bounded by the engine's admission limits
        if accepted && request.depth > 0 {
            if let CrawlOutcome::Indexed { doc_id } | CrawlOutcome::NearDuplicate { doc_id, .. } =
                outcome
            {
                if let Ok(doc) = self.index.get_doc(doc_id) {
                    let engine = Arc::clone(&self.engine);
                    let links = doc.link_out.clone();
                    let next_depth = request.depth - 1;
                    tokio::spawn(async move {
                        for link in links.into_iter().take(16) {
                            let _ = engine.crawl_url(&link, false).await;
                            // Deeper levels ride on future requests;
                            // one hop per spawned pass bounds fan-out
                            let _ = next_depth;
                        }
                    });
                }
            }
        }

        Ok(CrawlAck { accepted, detail })
    }

    /// `status`: admin status surface
    pub async fn status(&self) -> StatusReply {
        let now = now_ms();
        let dht_stats = self.dht.stats().await.unwrap_or_default();
        let ledger_stats = self.ledger.stats(now);
        StatusReply {
            index_size: self.index.doc_count(),
            peer_count: dht_stats.connected_peers,
            credit_balance: ledger_stats.balance,
            contribution_score: ledger_stats.contribution_score,
            credit_state: ledger_stats.state,
            degradation_level: self.governor.level(),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn tier_of(&self, peer: &Fingerprint) -> TrustTier {
        self.trust.tier(peer, now_ms())
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Flush all durable state (graceful shutdown)
    pub fn flush(&self) -> Result<(), MeshError> {
        self.index.flush().map_err(MeshError::from)?;
        self.dedup
            .flush()
            .map_err(|e| MeshError::TransientIo(e.to_string()))?;
        self.peer_store
            .flush()
            .map_err(|e| MeshError::TransientIo(e.to_string()))?;
        self.ledger.flush().map_err(MeshError::from)?;
        self.takedowns
            .flush()
            .map_err(|e| MeshError::TransientIo(e.to_string()))?;
        self.trust
            .flush()
            .map_err(|e| MeshError::TransientIo(e.to_string()))?;
        Ok(())
    }
}
