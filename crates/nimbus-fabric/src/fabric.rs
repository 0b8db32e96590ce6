//! [`PeerFabric`]: the facade the rest of the cluster talks to. It
//! composes discovery, connection management, trust scoring, and chunk
//! transfer behind the handful of operations the spec names —
//! `connect`/`disconnect`/`publish_record`/`find_peers`/`open_stream`/
//! `send_unreliable`/`chunk_get`/`chunk_put` — so `nimbus-consensus`,
//! `nimbus-registry`, and `nimbus-scheduler` never touch QUIC directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nimbus_core::cluster::{DiscoveryEvent, MemberRecord};
use nimbus_core::ids::NodeId;
use nimbus_core::security::negotiation::NegotiatedIdentity;
use tokio::sync::broadcast;

use crate::chunk::{ChunkDigest, ChunkFetcher, ChunkStore, ChunkTransport};
use crate::connection::{ConnectionManager, PeerConnection};
use crate::discovery::PeerDiscovery;
use crate::error::FabricError;
use crate::identity::LocalIdentity;
use crate::trust::TrustTable;

/// An unreliable (best-effort, unordered) datagram send, used for gossip
/// heartbeats and discovery chatter where a dropped message just means
/// waiting for the next tick rather than retrying.
#[async_trait::async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_unreliable(&self, peer: &NodeId, payload: Bytes) -> Result<(), FabricError>;

    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn PeerStream>, FabricError>;
}

/// A reliable, ordered byte stream to a peer, used by the Raft transport
/// and the registry's pull protocol alike.
#[async_trait::async_trait]
pub trait PeerStream: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), FabricError>;

    async fn read_to_end(&mut self) -> Result<Vec<u8>, FabricError>;
}

pub struct PeerFabricConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub idle_reap_after: Duration,
    pub rendezvous_keys: Vec<String>,
}

impl Default for PeerFabricConfig {
    fn default() -> Self {
        Self {
            low_water: 4,
            high_water: 64,
            idle_reap_after: Duration::from_secs(120),
            rendezvous_keys: vec!["cluster".to_string()],
        }
    }
}

/// The Peer Fabric component. Generic over the datagram/stream transport
/// and chunk transport so the connection-manager and trust-scoring logic
/// can be exercised without a real QUIC endpoint in tests.
pub struct PeerFabric<T, C, S> {
    identity: LocalIdentity,
    config: PeerFabricConfig,
    discovery: Arc<dyn PeerDiscovery>,
    connections: ConnectionManager,
    trust: Arc<TrustTable>,
    transport: Arc<T>,
    chunk_transport: Arc<C>,
    chunk_store: Arc<S>,
}

impl<T, C, S> PeerFabric<T, C, S>
where
    T: DatagramTransport,
    C: ChunkTransport,
    S: ChunkStore,
{
    pub fn new(
        identity: LocalIdentity,
        config: PeerFabricConfig,
        discovery: Arc<dyn PeerDiscovery>,
        transport: Arc<T>,
        chunk_transport: Arc<C>,
        chunk_store: Arc<S>,
    ) -> Self {
        let connections = ConnectionManager::new(config.low_water, config.high_water, config.idle_reap_after);
        Self {
            identity,
            config,
            discovery,
            connections,
            trust: Arc::new(TrustTable::new()),
            transport,
            chunk_transport,
            chunk_store,
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    pub fn trust_table(&self) -> &Arc<TrustTable> {
        &self.trust
    }

    /// Registers an already-negotiated connection with the manager. The
    /// actual QUIC handshake and certificate verification happen in
    /// `nimbus-node`'s concrete transport; by the time a connection
    /// reaches here its peer identity has already been authenticated.
    pub fn connect(&self, peer: NodeId, negotiated: NegotiatedIdentity) -> Result<(), FabricError> {
        let conn = PeerConnection { peer, negotiated, opened_at: Instant::now(), last_active: parking_lot::RwLock::new(Instant::now()) };
        self.connections.admit(conn)?;
        Ok(())
    }

    pub fn disconnect(&self, peer: &NodeId) {
        self.connections.remove(peer);
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.connections.get(peer).is_some()
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.connections.peers()
    }

    pub async fn publish_record(&self, record: MemberRecord) -> Result<(), FabricError> {
        self.discovery.publish_record(self.config.rendezvous_keys.clone(), record).await
    }

    pub async fn find_peers(&self, rendezvous: &str, limit: usize) -> Result<Vec<MemberRecord>, FabricError> {
        self.discovery.find_peers(rendezvous, limit).await
    }

    pub fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery.subscribe()
    }

    pub async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn PeerStream>, FabricError> {
        if let Some(conn) = self.connections.get(peer) {
            conn.touch();
        }
        self.transport.open_stream(peer).await
    }

    pub async fn send_unreliable(&self, peer: &NodeId, payload: Bytes) -> Result<(), FabricError> {
        self.transport.send_unreliable(peer, payload).await
    }

    /// Fetches a chunk by content address, preferring the local store and
    /// falling back to the network across the given candidate holders in
    /// order, verifying digests and updating trust scores as it goes.
    pub async fn chunk_get(&self, digest: ChunkDigest, holders: &[NodeId]) -> Result<Bytes, FabricError> {
        if let Some(bytes) = self.chunk_store.get(&digest).await? {
            return Ok(bytes);
        }
        let fetcher = ChunkFetcher::new(self.chunk_transport.clone(), self.trust.clone());
        let bytes = fetcher.chunk_get(digest, holders).await?;
        self.chunk_store.put(bytes.clone()).await?;
        Ok(bytes)
    }

    pub async fn chunk_put(&self, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
        self.chunk_store.put(bytes).await
    }

    pub async fn chunk_push(&self, peer: &NodeId, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
        self.chunk_transport.push_chunk(peer, bytes).await
    }

    /// Whether the connection manager believes it should proactively dial
    /// more peers to stay above `low_water`.
    pub fn needs_more_connections(&self) -> bool {
        self.connections.is_below_low_water()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::InMemoryChunkStore;
    use crate::discovery::InMemoryDiscovery;
    use nimbus_core::security::negotiation::{CertificateLifecycle, TlsVersion};
    use std::collections::HashMap;
    use std::time::SystemTime;
    use tokio::sync::Mutex;

    struct NullTransport;

    #[async_trait::async_trait]
    impl DatagramTransport for NullTransport {
        async fn send_unreliable(&self, _peer: &NodeId, _payload: Bytes) -> Result<(), FabricError> {
            Ok(())
        }

        async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn PeerStream>, FabricError> {
            Err(FabricError::ConnectionRefused(peer.clone()))
        }
    }

    struct FakeChunkTransport {
        held: Mutex<HashMap<NodeId, Bytes>>,
    }

    #[async_trait::async_trait]
    impl ChunkTransport for FakeChunkTransport {
        async fn fetch_chunk(&self, peer: &NodeId, _digest: &ChunkDigest) -> Result<Bytes, FabricError> {
            self.held.lock().await.get(peer).cloned().ok_or_else(|| FabricError::PeerNotFound(peer.clone()))
        }

        async fn push_chunk(&self, _peer: &NodeId, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
            Ok(ChunkDigest::of(&bytes))
        }
    }

    fn fabric() -> PeerFabric<NullTransport, FakeChunkTransport, InMemoryChunkStore> {
        let identity = LocalIdentity::new(
            NodeId::new("local"),
            vec![9, 9, 9],
            vec![1, 1, 1],
            CertificateLifecycle { not_before: SystemTime::now(), not_after: SystemTime::now() + Duration::from_secs(86400), issuer: "test-ca".into() },
        );
        PeerFabric::new(
            identity,
            PeerFabricConfig::default(),
            InMemoryDiscovery::new(),
            Arc::new(NullTransport),
            Arc::new(FakeChunkTransport { held: Mutex::new(HashMap::new()) }),
            Arc::new(InMemoryChunkStore::new()),
        )
    }

    #[tokio::test]
    async fn connect_then_disconnect_updates_connected_peers() {
        let fabric = fabric();
        let negotiated = NegotiatedIdentity { peer_fingerprint: "fp".into(), tls_version: TlsVersion::Tls13 };
        fabric.connect(NodeId::new("peer-a"), negotiated).unwrap();
        assert!(fabric.is_connected(&NodeId::new("peer-a")));
        fabric.disconnect(&NodeId::new("peer-a"));
        assert!(!fabric.is_connected(&NodeId::new("peer-a")));
    }

    #[tokio::test]
    async fn chunk_get_caches_locally_after_first_fetch() {
        let fabric = fabric();
        let bytes = Bytes::from_static(b"weights");
        let digest = ChunkDigest::of(&bytes);
        fabric.chunk_transport.held.lock().await.insert(NodeId::new("holder"), bytes.clone());

        let fetched = fabric.chunk_get(digest, &[NodeId::new("holder")]).await.unwrap();
        assert_eq!(fetched, bytes);

        fabric.chunk_transport.held.lock().await.clear();
        let cached = fabric.chunk_get(digest, &[NodeId::new("holder")]).await.unwrap();
        assert_eq!(cached, bytes);
    }
}
