//! Security-local error enum, folded into [`nimbus_core::error::NimbusError`]
//! at every HTTP/RPC ingress point.

use nimbus_core::error::{ErrorKind, IntoNimbusError, NimbusError};

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid or expired token: {0}")]
    InvalidToken(String),

    #[error("session {0} has been revoked")]
    SessionRevoked(String),

    #[error("step-up authentication required for this action")]
    StepUpRequired,

    #[error("principal lacks permission for {action} on {resource}")]
    Forbidden { action: String, resource: String },

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("caller is banned until the ban window elapses")]
    Banned,

    #[error("request blocked by scan rule {rule}")]
    BlockedByScan { rule: String },

    #[error("oidc discovery failed: {0}")]
    OidcDiscoveryFailed(String),
}

impl IntoNimbusError for SecurityError {
    fn into_nimbus_error(self) -> NimbusError {
        let message = self.to_string();
        let retry_after_ms = match &self {
            SecurityError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        let base = match &self {
            SecurityError::MissingCredentials | SecurityError::InvalidToken(_) | SecurityError::SessionRevoked(_) => {
                NimbusError::unauthorized(message)
            }
            SecurityError::StepUpRequired | SecurityError::Forbidden { .. } => NimbusError::forbidden(message),
            SecurityError::RateLimited { .. } => NimbusError::overloaded(message),
            SecurityError::Banned => NimbusError::new(ErrorKind::Forbidden, message),
            SecurityError::BlockedByScan { .. } => NimbusError::blocked_by_policy(message),
            SecurityError::OidcDiscoveryFailed(_) => NimbusError::new(ErrorKind::Transient, message),
        };
        let base = match retry_after_ms {
            Some(ms) => base.with_retry_after_ms(ms),
            None => base,
        };
        base.with_source(self)
    }
}
