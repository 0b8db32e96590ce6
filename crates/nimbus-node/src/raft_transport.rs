//! Client side of the Raft RPCs: adapts [`PeerFabric::open_stream`] into
//! [`RaftTransport`] by round-tripping a [`WireRequest`] through the
//! envelope codec in `rpc.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_consensus::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest,
    RequestVoteResponse,
};
use nimbus_consensus::transport::{RaftTransport, TransportError};
use nimbus_core::ids::NodeId;
use nimbus_fabric::{ChunkStore, ChunkTransport, DatagramTransport, PeerFabric, PeerStream};

use crate::rpc::{decode_response, encode_request, Envelope, WireRequest, WireResponse};

pub struct FabricRaftTransport<T, C, S> {
    fabric: Arc<PeerFabric<T, C, S>>,
}

impl<T, C, S> FabricRaftTransport<T, C, S> {
    pub fn new(fabric: Arc<PeerFabric<T, C, S>>) -> Self {
        Self { fabric }
    }
}

impl<T, C, S> FabricRaftTransport<T, C, S>
where
    T: DatagramTransport,
    C: ChunkTransport,
    S: ChunkStore,
{
    async fn round_trip(&self, peer: &NodeId, request: WireRequest) -> Result<WireResponse, TransportError> {
        let mut stream = self
            .fabric
            .open_stream(peer)
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;

        let envelope = Envelope::new(self.fabric.local_node_id().clone(), request);
        let bytes = encode_request(&envelope).map_err(|_| TransportError::Unreachable(peer.clone()))?;
        stream.write_all(&bytes).await.map_err(|_| TransportError::Unreachable(peer.clone()))?;

        let response_bytes = stream.read_to_end().await.map_err(|_| TransportError::TimedOut(peer.clone()))?;
        let response = decode_response(&response_bytes).map_err(|_| TransportError::TimedOut(peer.clone()))?;
        Ok(response.body)
    }
}

#[async_trait]
impl<T, C, S> RaftTransport for FabricRaftTransport<T, C, S>
where
    T: DatagramTransport,
    C: ChunkTransport,
    S: ChunkStore,
{
    async fn send_append_entries(&self, peer: &NodeId, request: AppendEntriesRequest) -> Result<AppendEntriesResponse, TransportError> {
        match self.round_trip(peer, WireRequest::RaftAppendEntries(request)).await? {
            WireResponse::RaftAppendEntries(resp) => Ok(resp),
            _ => Err(TransportError::Unreachable(peer.clone())),
        }
    }

    async fn send_request_vote(&self, peer: &NodeId, request: RequestVoteRequest) -> Result<RequestVoteResponse, TransportError> {
        match self.round_trip(peer, WireRequest::RaftRequestVote(request)).await? {
            WireResponse::RaftRequestVote(resp) => Ok(resp),
            _ => Err(TransportError::Unreachable(peer.clone())),
        }
    }

    async fn send_install_snapshot(
        &self,
        peer: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        match self.round_trip(peer, WireRequest::RaftInstallSnapshot(request)).await? {
            WireResponse::RaftInstallSnapshot(resp) => Ok(resp),
            _ => Err(TransportError::Unreachable(peer.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nimbus_core::security::negotiation::{CertificateLifecycle, TlsVersion};
    use nimbus_fabric::{FabricError, InMemoryChunkStore, LocalIdentity, PeerFabricConfig, PeerStream};
    use std::time::{Duration, SystemTime};

    struct FailingTransport;

    #[async_trait]
    impl DatagramTransport for FailingTransport {
        async fn send_unreliable(&self, _peer: &NodeId, _payload: Bytes) -> Result<(), FabricError> {
            Ok(())
        }

        async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn PeerStream>, FabricError> {
            Err(FabricError::ConnectionRefused(peer.clone()))
        }
    }

    struct NullChunkTransport;

    #[async_trait]
    impl ChunkTransport for NullChunkTransport {
        async fn fetch_chunk(&self, peer: &NodeId, _digest: &nimbus_fabric::ChunkDigest) -> Result<Bytes, FabricError> {
            Err(FabricError::PeerNotFound(peer.clone()))
        }
        async fn push_chunk(&self, _peer: &NodeId, bytes: Bytes) -> Result<nimbus_fabric::ChunkDigest, FabricError> {
            Ok(nimbus_fabric::ChunkDigest::of(&bytes))
        }
    }

    #[tokio::test]
    async fn unreachable_peer_surfaces_as_transport_unreachable() {
        let identity = LocalIdentity::new(
            NodeId::new("local"),
            vec![1, 2, 3],
            vec![4, 5, 6],
            CertificateLifecycle { not_before: SystemTime::now(), not_after: SystemTime::now() + Duration::from_secs(3600), issuer: "test".into() },
        );
        let fabric = Arc::new(PeerFabric::new(
            identity,
            PeerFabricConfig::default(),
            nimbus_fabric::InMemoryDiscovery::new(),
            Arc::new(FailingTransport),
            Arc::new(NullChunkTransport),
            Arc::new(InMemoryChunkStore::new()),
        ));
        let transport = FabricRaftTransport::new(fabric);
        let result = transport
            .send_request_vote(&NodeId::new("peer-b"), RequestVoteRequest { term: 1, candidate_id: NodeId::new("local"), last_log_index: 0, last_log_term: 0 })
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
