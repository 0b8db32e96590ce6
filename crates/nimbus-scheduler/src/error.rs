//! Scheduler-local error enum, folded into [`nimbus_core::error::NimbusError`]
//! at the HTTP boundary.

use nimbus_core::error::{ErrorKind, IntoNimbusError, NimbusError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no ready replica for model {0}")]
    NoReplica(String),

    #[error("cluster at capacity")]
    Overloaded { retry_after_ms: u64 },

    #[error("request deadline had already passed at ingress")]
    DeadlineExpired,

    #[error("request was canceled")]
    Canceled,

    #[error("request exhausted its retry budget without a successful dispatch")]
    RetriesExhausted,

    #[error("transient dispatch failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Registry(#[from] nimbus_registry::RegistryError),

    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),

    #[error(transparent)]
    IllegalTransition(#[from] crate::types::IllegalTransition),
}

impl IntoNimbusError for SchedulerError {
    fn into_nimbus_error(self) -> NimbusError {
        let kind = match &self {
            SchedulerError::NoReplica(_) => ErrorKind::NotFound,
            SchedulerError::Overloaded { .. } => ErrorKind::Overloaded,
            SchedulerError::DeadlineExpired => ErrorKind::Timeout,
            SchedulerError::Canceled => ErrorKind::Conflict,
            SchedulerError::RetriesExhausted => ErrorKind::Transient,
            SchedulerError::Transient(_) => ErrorKind::Transient,
            SchedulerError::Registry(_) => ErrorKind::Transient,
            SchedulerError::Fabric(_) => ErrorKind::Transient,
            SchedulerError::IllegalTransition(_) => ErrorKind::Fatal,
        };
        let message = self.to_string();
        let retry_after = match &self {
            SchedulerError::Overloaded { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        let mut err = NimbusError::new(kind, message);
        if let Some(ms) = retry_after {
            err = err.with_retry_after_ms(ms);
        }
        err.with_source(self)
    }
}
