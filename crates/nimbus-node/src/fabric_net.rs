//! The concrete QUIC transport backing the Peer Fabric: mutual TLS 1.3
//! between nodes that all trust the same local CA (`certs.rs`), a
//! [`PeerStream`] impl over `quinn`'s bidirectional streams, and a
//! file-backed [`ChunkStore`] under `chunks/<prefix>/<digest>`.
//!
//! Inbound streams (both Raft RPCs and application RPCs — the spec draws
//! no wire distinction between them, see §6) are routed to whatever
//! [`InboundHandler`] has been attached via [`QuicTransport::attach_handler`].
//! The handler is attached after the `RaftNode`/`RpcServer` it wraps is
//! built, which happens after the transport itself is constructed — see
//! `host.rs` for the construction order that breaks this cycle.
//!
//! The same two-phase wiring applies to [`PeerRegistrar`]: a dial success
//! registers the connection with the owning `PeerFabric` via
//! [`QuicTransport::attach_registrar`], so the connection manager and
//! trust table learn about it without `QuicTransport` holding a direct,
//! cyclic reference to the fabric that wraps it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use nimbus_core::ids::NodeId;
use nimbus_core::security::negotiation::{NegotiatedIdentity, TlsVersion};
use nimbus_fabric::{fingerprint_of, ChunkDigest, ChunkStore, ChunkTransport, DatagramTransport, FabricError, LocalIdentity, PeerStream};
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream, ServerConfig};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::layout::{atomic_write, DataDir};
use crate::rpc::InboundHandler;

/// Longest response buffer accepted from a peer stream; guards against a
/// misbehaving or compromised peer driving unbounded memory use.
const MAX_STREAM_RESPONSE_BYTES: usize = 256 * 1024 * 1024;

/// Maps `NodeId` to the dialable address advertised through discovery.
/// Populated from `find_peers`/gossip records; `fabric_net.rs` only reads
/// it, never writes it (that's `discovery.rs`'s job, upstream of here).
#[derive(Default)]
pub struct PeerAddressBook {
    addresses: DashMap<NodeId, SocketAddr>,
}

impl PeerAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: NodeId, addr: SocketAddr) {
        self.addresses.insert(peer, addr);
    }

    pub fn lookup(&self, peer: &NodeId) -> Option<SocketAddr> {
        self.addresses.get(peer).map(|entry| *entry)
    }
}

/// Narrow seam back into the `PeerFabric` that wraps this transport, used
/// only to register a connection's negotiated identity once a dial
/// succeeds. Kept separate from `InboundHandler` because the two are
/// attached at different points: the handler needs the full `RpcServer`,
/// this only needs `PeerFabric::connect` itself.
pub trait PeerRegistrar: Send + Sync {
    fn register(&self, peer: NodeId, negotiated: NegotiatedIdentity) -> Result<(), FabricError>;
}

impl<T, C, S> PeerRegistrar for nimbus_fabric::PeerFabric<T, C, S>
where
    T: DatagramTransport,
    C: ChunkTransport,
    S: ChunkStore,
{
    fn register(&self, peer: NodeId, negotiated: NegotiatedIdentity) -> Result<(), FabricError> {
        self.connect(peer, negotiated)
    }
}

/// Extracts the leaf certificate `quinn`/`rustls` verified during the
/// handshake and hashes it the same way `LocalIdentity::fingerprint`
/// does, so the registered fingerprint matches what the peer would report
/// about itself.
fn peer_cert_fingerprint(connection: &quinn::Connection) -> Option<String> {
    let identity = connection.peer_identity()?;
    let chain = identity.downcast::<Vec<rustls_pki_types::CertificateDer<'static>>>().ok()?;
    let leaf = chain.first()?;
    Some(fingerprint_of(leaf.as_ref()))
}

pub struct QuicTransport {
    endpoint: Endpoint,
    addresses: Arc<PeerAddressBook>,
    handler: OnceCell<Arc<dyn InboundHandler>>,
    registrar: OnceCell<Arc<dyn PeerRegistrar>>,
}

impl QuicTransport {
    /// Binds the QUIC endpoint on `bind_addr` using `identity`'s leaf
    /// certificate and a root store trusting only `ca_cert_der`: every
    /// node in the cluster is issued a leaf by the same local CA (see
    /// `certs.rs`), so a successful handshake already proves cluster
    /// membership before any application-level identity check runs.
    pub fn bind(bind_addr: SocketAddr, identity: &LocalIdentity, ca_cert_der: &[u8], addresses: Arc<PeerAddressBook>) -> Result<Arc<Self>, NodeError> {
        let server_config = build_server_config(identity, ca_cert_der)?;
        let client_config = build_client_config(identity, ca_cert_der)?;

        let mut endpoint = Endpoint::server(server_config, bind_addr).map_err(|err| NodeError::Certificate(format!("binding quic endpoint: {err}")))?;
        endpoint.set_default_client_config(client_config);

        let transport = Arc::new(Self { endpoint, addresses, handler: OnceCell::new(), registrar: OnceCell::new() });
        transport.clone().spawn_accept_loop();
        Ok(transport)
    }

    /// Wires the RPC dispatcher in once the `RaftNode`/`RpcServer` it
    /// routes into has been built. Must be called before any peer
    /// connects; `host.rs` does this immediately after construction and
    /// before the HTTP/CLI surface comes up.
    pub fn attach_handler(&self, handler: Arc<dyn InboundHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("quic inbound handler was already attached; ignoring duplicate attach");
        }
    }

    /// Wires the owning `PeerFabric` back in so successful dials can
    /// register themselves in the connection manager and trust table.
    /// Same two-phase construction as `attach_handler`: the fabric can't
    /// exist before this transport does, so it's attached right after.
    pub fn attach_registrar(&self, registrar: Arc<dyn PeerRegistrar>) {
        if self.registrar.set(registrar).is_err() {
            warn!("quic peer registrar was already attached; ignoring duplicate attach");
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        self.endpoint.local_addr().map_err(|err| NodeError::Certificate(err.to_string()))
    }

    fn spawn_accept_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let incoming = match self.endpoint.accept().await {
                    Some(incoming) => incoming,
                    None => {
                        debug!("quic endpoint closed; accept loop exiting");
                        return;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => this.serve_connection(connection).await,
                        Err(err) => warn!(error = %err, "inbound quic handshake failed"),
                    }
                });
            }
        });
    }

    async fn serve_connection(self: Arc<Self>, connection: quinn::Connection) {
        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.serve_stream(send, recv).await });
                }
                Err(quinn::ConnectionError::LocallyClosed) | Err(quinn::ConnectionError::ApplicationClosed(_)) => return,
                Err(err) => {
                    debug!(error = %err, "quic connection closed");
                    return;
                }
            }
        }
    }

    async fn serve_stream(&self, mut send: SendStream, mut recv: RecvStream) {
        let request_bytes = match recv.read_to_end(MAX_STREAM_RESPONSE_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed reading inbound quic stream");
                return;
            }
        };
        let Some(handler) = self.handler.get() else {
            warn!("received inbound rpc stream before a handler was attached");
            return;
        };
        let response_bytes = handler.handle(&request_bytes).await;
        if let Err(err) = send.write_all(&response_bytes).await {
            warn!(error = %err, "failed writing quic response");
            return;
        }
        let _ = send.finish();
    }

    /// Dials `peer` and, on a successful handshake, registers the
    /// connection with the owning fabric's connection manager and trust
    /// table. The peer's `NodeId` is already known here (it's the dial
    /// target), so only the certificate fingerprint needs extracting from
    /// the handshake; inbound-accepted connections don't get this
    /// treatment since recovering the peer's `NodeId` from its leaf
    /// certificate would need an X.509 parser this crate doesn't carry —
    /// inbound peers are registered lazily instead, the first time they
    /// dial out to us.
    async fn dial(&self, peer: &NodeId, addr: SocketAddr) -> Result<quinn::Connection, FabricError> {
        let connecting = self.endpoint.connect(addr, peer.as_str()).map_err(|_| FabricError::ConnectionRefused(peer.clone()))?;
        let connection = connecting.await.map_err(|_| FabricError::HandshakeFailed(peer.clone()))?;

        if let Some(registrar) = self.registrar.get() {
            match peer_cert_fingerprint(&connection) {
                Some(peer_fingerprint) => {
                    let negotiated = NegotiatedIdentity { peer_fingerprint, tls_version: TlsVersion::Tls13 };
                    if let Err(err) = registrar.register(peer.clone(), negotiated) {
                        warn!(%peer, error = %err, "failed registering dialed connection with the fabric");
                    }
                }
                None => warn!(%peer, "dialed connection exposed no peer certificate; skipping fabric registration"),
            }
        }

        Ok(connection)
    }
}

#[async_trait]
impl DatagramTransport for QuicTransport {
    /// Gossip/keepalive chatter rides a unidirectional stream rather than
    /// a true unreliable datagram: QUIC datagrams need an extension quinn
    /// only exposes behind explicit opt-in, and the loss tolerance the
    /// spec asks for ("a dropped message just means waiting for the next
    /// tick") is satisfied just as well by a fire-and-forget uni stream.
    async fn send_unreliable(&self, peer: &NodeId, payload: Bytes) -> Result<(), FabricError> {
        let addr = self.addresses.lookup(peer).ok_or_else(|| FabricError::PeerNotFound(peer.clone()))?;
        let connection = self.dial(peer, addr).await?;
        let mut uni = connection.open_uni().await.map_err(|_| FabricError::ConnectionRefused(peer.clone()))?;
        uni.write_all(&payload).await.map_err(|_| FabricError::StreamClosed(peer.clone()))?;
        let _ = uni.finish();
        Ok(())
    }

    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn PeerStream>, FabricError> {
        let addr = self.addresses.lookup(peer).ok_or_else(|| FabricError::PeerNotFound(peer.clone()))?;
        let connection = self.dial(peer, addr).await?;
        let (send, recv) = connection.open_bi().await.map_err(|_| FabricError::ConnectionRefused(peer.clone()))?;
        Ok(Box::new(QuicPeerStream { peer: peer.clone(), send, recv }))
    }
}

pub struct QuicPeerStream {
    peer: NodeId,
    send: SendStream,
    recv: RecvStream,
}

#[async_trait]
impl PeerStream for QuicPeerStream {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), FabricError> {
        self.send.write_all(bytes).await.map_err(|_| FabricError::StreamClosed(self.peer.clone()))?;
        self.send.finish().map_err(|_| FabricError::StreamClosed(self.peer.clone()))
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>, FabricError> {
        self.recv
            .read_to_end(MAX_STREAM_RESPONSE_BYTES)
            .await
            .map_err(|_| FabricError::StreamClosed(self.peer.clone()))
    }
}

#[async_trait]
impl ChunkTransport for QuicTransport {
    /// Chunk transfer is carried over the same RPC envelope as everything
    /// else (`WireRequest::ChunkGet`/`ChunkPut`) so a fetch gets the same
    /// framing and error handling as a Raft RPC, rather than a bespoke
    /// bulk-transfer sub-protocol.
    async fn fetch_chunk(&self, peer: &NodeId, digest: &ChunkDigest) -> Result<Bytes, FabricError> {
        let mut stream = self.open_stream(peer).await?;
        let envelope = crate::rpc::Envelope::new(peer.clone(), crate::rpc::WireRequest::ChunkGet { digest: *digest });
        let request_bytes = crate::rpc::encode_request(&envelope).map_err(|_| FabricError::StreamClosed(peer.clone()))?;
        stream.write_all(&request_bytes).await?;
        let response_bytes = stream.read_to_end().await?;
        let response = crate::rpc::decode_response(&response_bytes).map_err(|_| FabricError::StreamClosed(peer.clone()))?;
        match response.body {
            crate::rpc::WireResponse::ChunkGet { bytes } => Ok(bytes),
            _ => Err(FabricError::ChunkNotFound(digest.to_string())),
        }
    }

    async fn push_chunk(&self, peer: &NodeId, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
        let mut stream = self.open_stream(peer).await?;
        let envelope = crate::rpc::Envelope::new(peer.clone(), crate::rpc::WireRequest::ChunkPut { bytes });
        let request_bytes = crate::rpc::encode_request(&envelope).map_err(|_| FabricError::StreamClosed(peer.clone()))?;
        stream.write_all(&request_bytes).await?;
        let response_bytes = stream.read_to_end().await?;
        let response = crate::rpc::decode_response(&response_bytes).map_err(|_| FabricError::StreamClosed(peer.clone()))?;
        match response.body {
            crate::rpc::WireResponse::ChunkPut { digest } => Ok(digest),
            _ => Err(FabricError::ChunkNotFound(peer.to_string())),
        }
    }
}

/// Immutable, content-addressed chunk storage under
/// `chunks/<first-2-hex>/<digest>`. A chunk file is only ever written
/// once for a given digest, so concurrent writers racing to store the
/// same bytes just perform the same atomic rename twice.
pub struct FileChunkStore {
    data_dir: DataDir,
}

impl FileChunkStore {
    pub fn new(data_dir: DataDir) -> Self {
        Self { data_dir }
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn get(&self, digest: &ChunkDigest) -> Result<Option<Bytes>, FabricError> {
        let path = self.data_dir.chunk_path(digest);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FabricError::StreamClosed(NodeId::new(err.to_string()))),
        }
    }

    async fn put(&self, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
        let digest = ChunkDigest::of(&bytes);
        let path = self.data_dir.chunk_path(&digest);
        if !path.exists() {
            atomic_write(&path, &bytes).map_err(|err| FabricError::StreamClosed(NodeId::new(err.to_string())))?;
        }
        Ok(digest)
    }

    async fn has(&self, digest: &ChunkDigest) -> bool {
        self.data_dir.chunk_path(digest).exists()
    }
}

fn build_server_config(identity: &LocalIdentity, ca_cert_der: &[u8]) -> Result<ServerConfig, NodeError> {
    let root_store = trust_root(ca_cert_der)?;
    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
        .build()
        .map_err(|err| NodeError::Certificate(format!("building client verifier: {err}")))?;

    let cert_chain = vec![rustls_pki_types::CertificateDer::from(identity.certificate_der().to_vec())];
    let key = rustls_pki_types::PrivateKeyDer::try_from(identity.private_key_der().to_vec())
        .map_err(|err| NodeError::Certificate(format!("parsing leaf key: {err}")))?;

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|err| NodeError::Certificate(format!("building server tls config: {err}")))?;
    rustls_config.alpn_protocols = vec![b"nimbus/1".to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(rustls_config)
        .map_err(|err| NodeError::Certificate(format!("adapting rustls config for quic: {err}")))?;
    Ok(ServerConfig::with_crypto(Arc::new(quic_crypto)))
}

fn build_client_config(identity: &LocalIdentity, ca_cert_der: &[u8]) -> Result<ClientConfig, NodeError> {
    let root_store = trust_root(ca_cert_der)?;

    let cert_chain = vec![rustls_pki_types::CertificateDer::from(identity.certificate_der().to_vec())];
    let key = rustls_pki_types::PrivateKeyDer::try_from(identity.private_key_der().to_vec())
        .map_err(|err| NodeError::Certificate(format!("parsing leaf key: {err}")))?;

    let mut rustls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, key)
        .map_err(|err| NodeError::Certificate(format!("building client tls config: {err}")))?;
    rustls_config.alpn_protocols = vec![b"nimbus/1".to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(rustls_config)
        .map_err(|err| NodeError::Certificate(format!("adapting rustls config for quic: {err}")))?;
    Ok(ClientConfig::new(Arc::new(quic_crypto)))
}

fn trust_root(ca_cert_der: &[u8]) -> Result<rustls::RootCertStore, NodeError> {
    let mut store = rustls::RootCertStore::empty();
    store
        .add(rustls_pki_types::CertificateDer::from(ca_cert_der.to_vec()))
        .map_err(|err| NodeError::Certificate(format!("adding local ca to trust root: {err}")))?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_book_round_trips_a_lookup() {
        let book = PeerAddressBook::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        book.record(NodeId::new("peer-a"), addr);
        assert_eq!(book.lookup(&NodeId::new("peer-a")), Some(addr));
        assert_eq!(book.lookup(&NodeId::new("peer-b")), None);
    }

    #[tokio::test]
    async fn file_chunk_store_put_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        let store = FileChunkStore::new(data_dir);
        let bytes = Bytes::from_static(b"model weights go here");
        let digest = store.put(bytes.clone()).await.unwrap();
        assert!(store.has(&digest).await);
        assert_eq!(store.get(&digest).await.unwrap(), Some(bytes));
    }

    #[tokio::test]
    async fn file_chunk_store_reports_none_for_unknown_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        let store = FileChunkStore::new(data_dir);
        let digest = ChunkDigest::of(b"never written");
        assert_eq!(store.get(&digest).await.unwrap(), None);
    }
}
