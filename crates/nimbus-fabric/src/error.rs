//! Fabric-local error enum, folded into [`nimbus_core::error::NimbusError`]
//! at the scheduler/registry boundary.

use nimbus_core::error::{IntoNimbusError, NimbusError};
use nimbus_core::ids::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("peer {0} not found in the local discovery cache")]
    PeerNotFound(NodeId),

    #[error("connection to {0} refused or reset")]
    ConnectionRefused(NodeId),

    #[error("handshake with {0} failed certificate validation")]
    HandshakeFailed(NodeId),

    #[error("chunk {digest} failed digest verification from peer {peer}")]
    ChunkDigestMismatch { digest: String, peer: NodeId },

    #[error("chunk {0} not found on any known holder")]
    ChunkNotFound(String),

    #[error("connection manager at capacity ({current}/{high_water})")]
    ConnectionManagerFull { current: usize, high_water: usize },

    #[error("stream to {0} closed before the operation completed")]
    StreamClosed(NodeId),

    #[error("operation timed out")]
    TimedOut,
}

impl IntoNimbusError for FabricError {
    fn into_nimbus_error(self) -> NimbusError {
        use nimbus_core::error::ErrorKind;
        let kind = match &self {
            FabricError::PeerNotFound(_) | FabricError::ChunkNotFound(_) => ErrorKind::NotFound,
            FabricError::ConnectionRefused(_)
            | FabricError::StreamClosed(_)
            | FabricError::ConnectionManagerFull { .. } => ErrorKind::Transient,
            FabricError::HandshakeFailed(_) | FabricError::ChunkDigestMismatch { .. } => ErrorKind::Forbidden,
            FabricError::TimedOut => ErrorKind::Timeout,
        };
        let message = self.to_string();
        NimbusError::new(kind, message).with_source(self)
    }
}
