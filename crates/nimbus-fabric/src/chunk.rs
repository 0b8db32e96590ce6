//! Content-addressed chunk storage and transfer. Every model weight file
//! is split into fixed-size chunks, each named by the SHA-256 digest of
//! its bytes; the registry's pull protocol asks the fabric for chunks by
//! digest and never has to trust a peer's claim about what it's sending.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use nimbus_core::ids::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FabricError;
use crate::trust::TrustTable;

/// The spec fixes chunks at a 256-bit content address and a 4 MiB default
/// size; larger chunks would make partial-failure retransmission too
/// expensive, smaller ones would make the per-chunk RPC overhead dominate.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkDigest([u8; 32]);

impl ChunkDigest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First byte, hex-encoded: the fan-out directory prefix used in the
    /// node's persisted `chunks/<first-2-hex>/<digest>` layout.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkDigest({})", self)
    }
}

impl Serialize for ChunkDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChunkDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid chunk digest: {0}")]
pub struct ParseChunkDigestError(String);

impl FromStr for ChunkDigest {
    type Err = ParseChunkDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ParseChunkDigestError(s.to_string()))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ParseChunkDigestError(s.to_string()))?;
        Ok(Self(arr))
    }
}

/// Local chunk storage, keyed by content address. `nimbus-node` backs this
/// with the on-disk `chunks/<prefix>/<digest>` layout; tests use
/// [`InMemoryChunkStore`].
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, digest: &ChunkDigest) -> Result<Option<Bytes>, FabricError>;

    async fn put(&self, bytes: Bytes) -> Result<ChunkDigest, FabricError>;

    async fn has(&self, digest: &ChunkDigest) -> bool;
}

#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: DashMap<ChunkDigest, Bytes>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn get(&self, digest: &ChunkDigest) -> Result<Option<Bytes>, FabricError> {
        Ok(self.chunks.get(digest).map(|b| b.clone()))
    }

    async fn put(&self, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
        let digest = ChunkDigest::of(&bytes);
        self.chunks.insert(digest, bytes);
        Ok(digest)
    }

    async fn has(&self, digest: &ChunkDigest) -> bool {
        self.chunks.contains_key(digest)
    }
}

/// Fetches chunk bytes from a specific peer over whatever stream
/// transport the fabric's connection manager has open. Kept as a trait so
/// the retrieval/verification logic below can be unit tested without a
/// real QUIC stream.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn fetch_chunk(&self, peer: &NodeId, digest: &ChunkDigest) -> Result<Bytes, FabricError>;

    async fn push_chunk(&self, peer: &NodeId, bytes: Bytes) -> Result<ChunkDigest, FabricError>;
}

/// Orchestrates a chunk fetch across candidate holders: tries each in
/// order, verifies the digest of whatever comes back, and penalizes the
/// sender's trust score on mismatch before moving to the next candidate.
pub struct ChunkFetcher<C> {
    transport: Arc<C>,
    trust: Arc<TrustTable>,
}

impl<C: ChunkTransport> ChunkFetcher<C> {
    pub fn new(transport: Arc<C>, trust: Arc<TrustTable>) -> Self {
        Self { transport, trust }
    }

    pub async fn chunk_get(&self, digest: ChunkDigest, holders: &[NodeId]) -> Result<Bytes, FabricError> {
        let mut last_err = FabricError::ChunkNotFound(digest.to_string());
        for holder in holders {
            if !self.trust.is_trusted(holder) {
                continue;
            }
            match self.transport.fetch_chunk(holder, &digest).await {
                Ok(bytes) if ChunkDigest::of(&bytes) == digest => {
                    self.trust.record_success(holder);
                    return Ok(bytes);
                }
                Ok(_) => {
                    self.trust.record_mismatch(holder);
                    last_err = FabricError::ChunkDigestMismatch { digest: digest.to_string(), peer: holder.clone() };
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct FakeTransport {
        chunks: Mutex<std::collections::HashMap<NodeId, Bytes>>,
    }

    #[async_trait]
    impl ChunkTransport for FakeTransport {
        async fn fetch_chunk(&self, peer: &NodeId, _digest: &ChunkDigest) -> Result<Bytes, FabricError> {
            self.chunks
                .lock()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| FabricError::PeerNotFound(peer.clone()))
        }

        async fn push_chunk(&self, _peer: &NodeId, bytes: Bytes) -> Result<ChunkDigest, FabricError> {
            Ok(ChunkDigest::of(&bytes))
        }
    }

    #[tokio::test]
    async fn chunk_get_falls_through_to_next_holder_on_mismatch() {
        let good = Bytes::from_static(b"real content");
        let digest = ChunkDigest::of(&good);
        let mut chunks = std::collections::HashMap::new();
        chunks.insert(NodeId::new("corrupt-holder"), Bytes::from_static(b"wrong bytes"));
        chunks.insert(NodeId::new("good-holder"), good.clone());
        let transport = Arc::new(FakeTransport { chunks: Mutex::new(chunks) });
        let trust = Arc::new(TrustTable::new());
        let fetcher = ChunkFetcher::new(transport, trust.clone());

        let result = fetcher
            .chunk_get(digest, &[NodeId::new("corrupt-holder"), NodeId::new("good-holder")])
            .await
            .unwrap();
        assert_eq!(result, good);
        assert!(trust.score(&NodeId::new("corrupt-holder")) < 1.0);
    }

    #[tokio::test]
    async fn chunk_get_skips_untrusted_holders() {
        let good = Bytes::from_static(b"real content");
        let digest = ChunkDigest::of(&good);
        let mut chunks = std::collections::HashMap::new();
        chunks.insert(NodeId::new("untrusted"), good.clone());
        let transport = Arc::new(FakeTransport { chunks: Mutex::new(chunks) });
        let trust = Arc::new(TrustTable::new());
        for _ in 0..20 {
            trust.record_mismatch(&NodeId::new("untrusted"));
        }
        let fetcher = ChunkFetcher::new(transport, trust);
        assert!(fetcher.chunk_get(digest, &[NodeId::new("untrusted")]).await.is_err());
    }
}
