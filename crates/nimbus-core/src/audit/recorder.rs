//! The recorder trait components depend on. Concrete persistence (append
//! to the node's audit log file) lives in `nimbus-node`; `nimbus-security`
//! only needs this trait to emit events without knowing where they land.

use async_trait::async_trait;

use crate::audit::event::AuditOutcome;
use crate::error::NimbusError;

#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(
        &self,
        principal: &str,
        action: &str,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) -> Result<(), NimbusError>;

    /// The hash of the most recently recorded event, or the genesis hash
    /// if nothing has been recorded yet. Exposed so a new node joining the
    /// cluster can verify it's extending the same chain another node left
    /// off at, rather than silently starting a fork.
    async fn tip_hash(&self) -> String;
}
