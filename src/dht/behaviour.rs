//! Combined network behaviour for the search overlay

use libp2p::{
    identify, kad, ping,
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
    StreamProtocol,
};
use std::num::NonZeroUsize;
use std::time::Duration;

use super::protocol::{MeshCodec, RECORD_PROTOCOL};

/// Records are replicated to the N closest peers
pub const REPLICATION_FACTOR: usize = 3;

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    /// Kademlia DHT for peer discovery and keyspace routing
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Request-response for signed record exchange and search probes
    pub record_exchange: request_response::Behaviour<MeshCodec>,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping for connection keepalive
    pub ping: ping::Behaviour,
}

impl MeshBehaviour {
    /// Create new overlay behaviour
    pub fn new(
        local_peer_id: libp2p::PeerId,
        local_public_key: libp2p::identity::PublicKey,
    ) -> Self {
        // Kademlia config
        let mut kad_config = kad::Config::new(StreamProtocol::new("/meshseek/kad/1.0.0"));
        kad_config.set_query_timeout(Duration::from_secs(60));
        kad_config.set_replication_factor(
            NonZeroUsize::new(REPLICATION_FACTOR).expect("nonzero replication"),
        );

        let store = kad::store::MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        // Record exchange protocol; per-RPC deadline enforced here
        let record_exchange = request_response::Behaviour::new(
            [(RECORD_PROTOCOL, ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(Duration::from_secs(2)),
        );

        // Identify config
        let identify = identify::Behaviour::new(identify::Config::new(
            "/meshseek/id/1.0.0".to_string(),
            local_public_key,
        ));

        // Ping config
        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        Self {
            kademlia,
            record_exchange,
            identify,
            ping,
        }
    }
}

/// Events from the record exchange protocol
pub type RecordExchangeEvent =
    request_response::Event<super::protocol::RpcRequest, super::protocol::RpcResponse>;
