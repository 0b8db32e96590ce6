//! Registry-local error enum, folded into [`nimbus_core::error::NimbusError`]
//! at the scheduler/HTTP boundary.

use nimbus_core::error::{ErrorKind, IntoNimbusError, NimbusError};
use nimbus_fabric::ChunkDigest;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("model {0} is not registered")]
    UnknownModel(String),

    #[error("model {name}@{version} is already registered with a different digest")]
    DigestConflict { name: String, version: String },

    #[error("no ready placement exists for model {0}")]
    NoReplica(String),

    #[error("evicting node {node} would drop model {model} below its replication factor")]
    WouldUnderReplicate { model: String, node: String },

    #[error("chunk {0} failed verification during pull")]
    ChunkVerificationFailed(ChunkDigest),

    #[error("assembled manifest digest did not match the model descriptor")]
    ManifestDigestMismatch,

    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),

    #[error("underlying metadata store is unavailable: {0}")]
    StoreUnavailable(String),
}

impl IntoNimbusError for RegistryError {
    fn into_nimbus_error(self) -> NimbusError {
        let kind = match &self {
            RegistryError::UnknownModel(_) => ErrorKind::NotFound,
            RegistryError::DigestConflict { .. } => ErrorKind::Conflict,
            RegistryError::NoReplica(_) => ErrorKind::NotFound,
            RegistryError::WouldUnderReplicate { .. } => ErrorKind::Conflict,
            RegistryError::ChunkVerificationFailed(_) | RegistryError::ManifestDigestMismatch => ErrorKind::Transient,
            RegistryError::Fabric(_) => ErrorKind::Transient,
            RegistryError::StoreUnavailable(_) => ErrorKind::Transient,
        };
        let message = self.to_string();
        NimbusError::new(kind, message).with_source(self)
    }
}
