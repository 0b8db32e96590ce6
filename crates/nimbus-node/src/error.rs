//! Node-local error enum. Every component error (`ConsensusError`,
//! `RegistryError`, `SchedulerError`, `FabricError`, `SecurityError`) folds
//! into [`NimbusError`] at its own crate boundary already; this type only
//! covers the node-level concerns layered on top: config, persistence, and
//! process wiring.

use nimbus_core::error::{ErrorKind, IntoNimbusError, NimbusError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data directory error: {0}")]
    DataDir(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("oidc discovery failed: {0}")]
    OidcDiscovery(String),

    #[error("audit log error: {0}")]
    Audit(String),

    #[error(transparent)]
    Consensus(#[from] nimbus_consensus::ConsensusError),

    #[error(transparent)]
    Registry(#[from] nimbus_registry::RegistryError),

    #[error(transparent)]
    Scheduler(#[from] nimbus_scheduler::SchedulerError),

    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),

    #[error(transparent)]
    Security(#[from] nimbus_security::SecurityError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoNimbusError for NodeError {
    fn into_nimbus_error(self) -> NimbusError {
        match self {
            NodeError::Configuration(msg) => NimbusError::new(ErrorKind::Fatal, msg),
            NodeError::DataDir(msg) => NimbusError::new(ErrorKind::Fatal, msg),
            NodeError::Io(err) => {
                let message = err.to_string();
                NimbusError::new(ErrorKind::Transient, message).with_source(err)
            }
            NodeError::Certificate(msg) => NimbusError::new(ErrorKind::Fatal, msg),
            NodeError::OidcDiscovery(msg) => NimbusError::new(ErrorKind::Transient, msg),
            NodeError::Audit(msg) => NimbusError::new(ErrorKind::Fatal, msg),
            NodeError::Consensus(err) => err.into_nimbus_error(),
            NodeError::Registry(err) => err.into_nimbus_error(),
            NodeError::Scheduler(err) => err.into_nimbus_error(),
            NodeError::Fabric(err) => err.into_nimbus_error(),
            NodeError::Security(err) => err.into_nimbus_error(),
            NodeError::Serialization(err) => {
                let message = err.to_string();
                NimbusError::new(ErrorKind::Fatal, message).with_source(err)
            }
        }
    }
}

/// Maps an [`ErrorKind`] to the CLI exit code table from the external
/// interfaces section: 0 success, 1 generic error, 2 usage error, 3
/// precondition failure, 4 not-leader, 5 unavailable/overloaded.
pub fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::NotLeader => 4,
        ErrorKind::Timeout | ErrorKind::Overloaded | ErrorKind::Transient => 5,
        ErrorKind::Conflict | ErrorKind::BlockedByPolicy => 3,
        ErrorKind::NotFound | ErrorKind::Unauthorized | ErrorKind::Forbidden | ErrorKind::Fatal => 1,
    }
}
