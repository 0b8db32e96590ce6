//! The RPC boundary `nimbus-consensus` calls through to reach other nodes.
//! Concrete framing and the QUIC/mTLS connection live in `nimbus-fabric`;
//! this crate only needs "send this request, get that response" so its
//! tests can run against an in-memory transport instead of a socket.

use async_trait::async_trait;

use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),
    #[error("request to peer {0} timed out")]
    TimedOut(NodeId),
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send_append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn send_request_vote(
        &self,
        peer: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn send_install_snapshot(
        &self,
        peer: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError>;
}
