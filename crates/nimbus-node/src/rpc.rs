//! The inter-node RPC envelope and its server-side dispatcher.
//!
//! §6 specifies length-prefixed framed messages over mutually-authenticated
//! TLS, each carrying `request_id`, `sender_identity`, and an optional trace
//! context, in one of seven kinds: `RaftAppendEntries`, `RaftRequestVote`,
//! `RaftInstallSnapshot`, `ChunkGet`, `ChunkPut`, `DispatchRequest`,
//! `DispatchCancel`. The Peer Fabric's only stream primitive
//! ([`PeerStream`]) is a single `write_all`/`read_to_end` round trip, not an
//! incrementally-framed channel, so every kind here is carried as one
//! envelope serialized to a single buffer: the "length prefix" the spec
//! names is `PeerStream`'s own framing underneath (see `fabric_net.rs`).
//!
//! `DispatchRequest` is the one kind that sits awkwardly on top of a
//! whole-buffer round trip: the scheduler wants tokens as they are
//! produced, not as one blob after generation finishes. The server side
//! here buffers every token the backend produces before writing the single
//! response; the client side (`adapters.rs`) splits that buffer back into
//! an `mpsc::Receiver` so the rest of the scheduler never notices. This
//! trades true network-level streaming for staying on the fabric's actual
//! primitive — recorded as a deliberate compromise, not an oversight.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use nimbus_consensus::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest,
    RequestVoteResponse,
};
use nimbus_consensus::snapshot::StateMachine;
use nimbus_consensus::{LogStorage, RaftTransport};
use nimbus_core::ids::{NodeId, RequestId};
use nimbus_fabric::{ChunkDigest, ChunkStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NodeError;

/// One RPC envelope, in either direction. `sender_identity` and
/// `trace_context` are carried per §6 even though most handlers here only
/// consult `body`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub request_id: RequestId,
    pub sender_identity: NodeId,
    pub trace_context: Option<String>,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(sender_identity: NodeId, body: T) -> Self {
        Self { request_id: RequestId::new(), sender_identity, trace_context: None, body }
    }
}

/// Self-contained description of a dispatch request as it travels the
/// wire: `InferenceRequest` itself carries a `Cancellation` and a
/// `Deadline` tied to local wall-clock `Instant`s, neither of which mean
/// anything on the receiving node, so this is the serializable subset the
/// worker actually needs to run the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchWirePayload {
    pub request_id: RequestId,
    pub model_name: String,
    pub model_version: String,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
    pub stream: bool,
    pub deadline_remaining_ms: u64,
    pub principal: String,
    pub scopes: Vec<String>,
}

mod base64_bytes {
    use super::*;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let decoded = BASE64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireRequest {
    RaftAppendEntries(AppendEntriesRequest),
    RaftRequestVote(RequestVoteRequest),
    RaftInstallSnapshot(InstallSnapshotRequest),
    ChunkGet { digest: ChunkDigest },
    ChunkPut { #[serde(with = "base64_bytes")] bytes: Bytes },
    DispatchRequest(DispatchWirePayload),
    DispatchCancel { request_id: RequestId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireResponse {
    RaftAppendEntries(AppendEntriesResponse),
    RaftRequestVote(RequestVoteResponse),
    RaftInstallSnapshot(InstallSnapshotResponse),
    ChunkGet { #[serde(with = "base64_bytes")] bytes: Bytes },
    ChunkPut { digest: ChunkDigest },
    /// Every token the backend produced, buffered; see the module doc for
    /// why this isn't an incremental stream.
    DispatchRequest { #[serde(with = "option_base64_bytes")] tokens: Vec<Bytes> },
    DispatchCancel,
    Error { message: String },
}

mod option_base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tokens: &Vec<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = tokens.iter().map(|b| BASE64.encode(b)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|s| BASE64.decode(s.as_bytes()).map(Bytes::from).map_err(serde::de::Error::custom))
            .collect()
    }
}

pub fn encode_request(env: &Envelope<WireRequest>) -> Result<Vec<u8>, NodeError> {
    Ok(serde_json::to_vec(env)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<Envelope<WireRequest>, NodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_response(env: &Envelope<WireResponse>) -> Result<Vec<u8>, NodeError> {
    Ok(serde_json::to_vec(env)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Envelope<WireResponse>, NodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Runs local model inference on behalf of a dispatched request. The real
/// backend lives outside this repo (§1: "the actual inference runtime,
/// treated as an external collaborator invoked over an RPC boundary") —
/// this is the seam it plugs into. [`EchoInferenceBackend`] stands in for
/// it so the dispatch path is exercisable end to end without one.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, payload: &DispatchWirePayload) -> Result<Vec<Bytes>, String>;
}

/// Splits the prompt on whitespace and echoes each word back as its own
/// token, simulating incremental generation well enough for integration
/// tests and local development.
pub struct EchoInferenceBackend;

#[async_trait::async_trait]
impl InferenceBackend for EchoInferenceBackend {
    async fn generate(&self, payload: &DispatchWirePayload) -> Result<Vec<Bytes>, String> {
        let text = String::from_utf8_lossy(&payload.payload);
        Ok(text.split_whitespace().map(|word| Bytes::from(format!("{word} "))).collect())
    }
}

/// Object-safe seam `fabric_net.rs`'s inbound stream-accept loop calls
/// into, without needing to name [`RpcServer`]'s `<L, T, M>` parameters.
/// The transport (`T` in `PeerFabric<T, C, S>`) has to exist before the
/// `RaftNode` it will eventually carry RPCs for does, so the accept loop
/// is built against this trait object and the concrete [`RpcServer`] is
/// attached to it once construction completes (see `host.rs`).
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, request_bytes: &[u8]) -> Vec<u8>;
}

/// Server side of the RPC surface: the handler `fabric_net.rs`'s inbound
/// stream-accept loop calls for every accepted bidirectional stream.
pub struct RpcServer<L, T, M> {
    raft: nimbus_consensus::RaftNode<L, T, M>,
    chunk_store: std::sync::Arc<dyn nimbus_fabric::ChunkStore>,
    backend: std::sync::Arc<dyn InferenceBackend>,
    local_node_id: NodeId,
}

impl<L, T, M> RpcServer<L, T, M>
where
    L: LogStorage + Send + Sync,
    T: RaftTransport + Send + Sync,
    M: StateMachine + Send + Sync,
{
    pub fn new(
        raft: nimbus_consensus::RaftNode<L, T, M>,
        chunk_store: std::sync::Arc<dyn nimbus_fabric::ChunkStore>,
        backend: std::sync::Arc<dyn InferenceBackend>,
        local_node_id: NodeId,
    ) -> Self {
        Self { raft, chunk_store, backend, local_node_id }
    }

    /// Decodes one request buffer, dispatches it, and encodes the
    /// response buffer. `fabric_net.rs` owns the actual `write_all`/
    /// `read_to_end` calls; this function never touches a [`PeerStream`]
    /// directly so it stays testable without a QUIC endpoint.
    ///
    /// [`PeerStream`]: nimbus_fabric::PeerStream
    pub async fn handle(&self, request_bytes: &[u8]) -> Vec<u8> {
        let envelope = match decode_request(request_bytes) {
            Ok(env) => env,
            Err(err) => {
                warn!(error = %err, "failed to decode inbound rpc envelope");
                let response = Envelope::new(self.local_node_id.clone(), WireResponse::Error { message: err.to_string() });
                return encode_response(&response).unwrap_or_default();
            }
        };
        let request_id = envelope.request_id;
        let body = self.dispatch(envelope.body).await;
        let response = Envelope { request_id, sender_identity: self.local_node_id.clone(), trace_context: None, body };
        encode_response(&response).unwrap_or_default()
    }

    async fn dispatch(&self, request: WireRequest) -> WireResponse {
        match request {
            WireRequest::RaftAppendEntries(req) => WireResponse::RaftAppendEntries(self.raft.handle_append_entries(req).await),
            WireRequest::RaftRequestVote(req) => WireResponse::RaftRequestVote(self.raft.handle_request_vote(req).await),
            WireRequest::RaftInstallSnapshot(req) => {
                WireResponse::RaftInstallSnapshot(self.raft.handle_install_snapshot(req).await)
            }
            WireRequest::ChunkGet { digest } => match self.chunk_store.get(&digest).await {
                Ok(Some(bytes)) => WireResponse::ChunkGet { bytes },
                Ok(None) => WireResponse::Error { message: format!("chunk {digest} not held locally") },
                Err(err) => WireResponse::Error { message: err.to_string() },
            },
            WireRequest::ChunkPut { bytes } => match self.chunk_store.put(bytes).await {
                Ok(digest) => WireResponse::ChunkPut { digest },
                Err(err) => WireResponse::Error { message: err.to_string() },
            },
            WireRequest::DispatchRequest(payload) => match self.backend.generate(&payload).await {
                Ok(tokens) => WireResponse::DispatchRequest { tokens },
                Err(message) => WireResponse::Error { message },
            },
            WireRequest::DispatchCancel { .. } => {
                // The buffer-then-split compromise means generation has
                // already finished locally by the time any cancel could
                // arrive; nothing to abort. Kept as a recognized kind so
                // a future incremental-streaming transport has a slot to
                // land in without a wire-format change.
                WireResponse::DispatchCancel
            }
        }
    }
}

#[async_trait::async_trait]
impl<L, T, M> InboundHandler for RpcServer<L, T, M>
where
    L: LogStorage + Send + Sync,
    T: RaftTransport + Send + Sync,
    M: StateMachine + Send + Sync,
{
    async fn handle(&self, request_bytes: &[u8]) -> Vec<u8> {
        RpcServer::handle(self, request_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_consensus::log::InMemoryLog;
    use nimbus_consensus::transport::TransportError;
    use nimbus_consensus::types::LogIndex;
    use nimbus_consensus::RaftNode;
    use std::sync::Arc;

    #[derive(Default)]
    struct NullStateMachine;

    impl StateMachine for NullStateMachine {
        fn apply(&self, _entry_index: LogIndex, _command: &[u8]) {}
        fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn restore(&self, _bytes: &[u8]) {}
    }

    struct NoopTransport;

    #[async_trait::async_trait]
    impl RaftTransport for NoopTransport {
        async fn send_append_entries(&self, peer: &NodeId, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }
        async fn send_request_vote(&self, peer: &NodeId, _req: RequestVoteRequest) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }
        async fn send_install_snapshot(
            &self,
            peer: &NodeId,
            _req: InstallSnapshotRequest,
        ) -> Result<InstallSnapshotResponse, TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }
    }

    fn server() -> RpcServer<InMemoryLog, NoopTransport, NullStateMachine> {
        let local = NodeId::new("node-a");
        let raft = RaftNode::new(local.clone(), InMemoryLog::new(), NoopTransport, NullStateMachine, vec![local.clone()]);
        RpcServer::new(raft, Arc::new(nimbus_fabric::InMemoryChunkStore::new()), Arc::new(EchoInferenceBackend), local)
    }

    #[tokio::test]
    async fn unroutable_raft_vote_request_still_gets_a_well_formed_response() {
        let server = server();
        let req = WireRequest::RaftRequestVote(RequestVoteRequest { term: 5, candidate_id: NodeId::new("node-b"), last_log_index: 0, last_log_term: 0 });
        let envelope = Envelope::new(NodeId::new("node-b"), req);
        let request_bytes = encode_request(&envelope).unwrap();
        let response_bytes = server.handle(&request_bytes).await;
        let response = decode_response(&response_bytes).unwrap();
        assert_eq!(response.request_id, envelope.request_id);
        assert!(matches!(response.body, WireResponse::RaftRequestVote(_)));
    }

    #[tokio::test]
    async fn chunk_get_for_an_absent_digest_reports_an_error_body() {
        let server = server();
        let digest = ChunkDigest::of(b"missing");
        let envelope = Envelope::new(NodeId::new("node-b"), WireRequest::ChunkGet { digest });
        let response_bytes = server.handle(&encode_request(&envelope).unwrap()).await;
        let response = decode_response(&response_bytes).unwrap();
        assert!(matches!(response.body, WireResponse::Error { .. }));
    }

    #[tokio::test]
    async fn chunk_put_then_get_round_trips_through_the_store() {
        let server = server();
        let bytes = Bytes::from_static(b"weights");
        let put = Envelope::new(NodeId::new("node-b"), WireRequest::ChunkPut { bytes: bytes.clone() });
        let put_response = decode_response(&server.handle(&encode_request(&put).unwrap()).await).unwrap();
        let digest = match put_response.body {
            WireResponse::ChunkPut { digest } => digest,
            other => panic!("unexpected response: {other:?}"),
        };

        let get = Envelope::new(NodeId::new("node-b"), WireRequest::ChunkGet { digest });
        let get_response = decode_response(&server.handle(&encode_request(&get).unwrap()).await).unwrap();
        match get_response.body {
            WireResponse::ChunkGet { bytes: got } => assert_eq!(got, bytes),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_request_echoes_prompt_as_tokens() {
        let server = server();
        let payload = DispatchWirePayload {
            request_id: RequestId::new(),
            model_name: "llama".into(),
            model_version: "v1".into(),
            payload: Bytes::from_static(b"hi there"),
            stream: true,
            deadline_remaining_ms: 5000,
            principal: "anon".into(),
            scopes: vec![],
        };
        let envelope = Envelope::new(NodeId::new("node-b"), WireRequest::DispatchRequest(payload));
        let response = decode_response(&server.handle(&encode_request(&envelope).unwrap()).await).unwrap();
        match response.body {
            WireResponse::DispatchRequest { tokens } => assert_eq!(tokens.len(), 2),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
