//! Consensus-local error enum, folded into [`nimbus_core::error::NimbusError`]
//! at the `nimbus-node` boundary.

use nimbus_core::error::{ErrorKind, IntoNimbusError, NimbusError};

use crate::types::{LogIndex, NodeId, Term};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("not the leader; current term {term}")]
    NotLeader { term: Term, leader_hint: Option<NodeId> },

    #[error("proposal at index {index} term {term} did not commit before the deadline")]
    ProposalTimedOut { index: LogIndex, term: Term },

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("log entry at index {index} was superseded by a later term and will never commit")]
    ProposalSuperseded { index: LogIndex },

    #[error("snapshot installation failed: {reason}")]
    SnapshotFailed { reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl IntoNimbusError for ConsensusError {
    fn into_nimbus_error(self) -> NimbusError {
        let message = self.to_string();
        let base = match &self {
            ConsensusError::NotLeader { leader_hint, .. } => {
                NimbusError::not_leader(leader_hint.as_ref().map(NodeId::as_str))
            }
            ConsensusError::ProposalTimedOut { .. } => NimbusError::timeout(message),
            ConsensusError::ShuttingDown => NimbusError::new(ErrorKind::Transient, message),
            ConsensusError::ProposalSuperseded { .. } => NimbusError::conflict(message),
            ConsensusError::SnapshotFailed { .. } | ConsensusError::Storage(_) => {
                NimbusError::fatal(message)
            }
        };
        base.with_source(self)
    }
}
