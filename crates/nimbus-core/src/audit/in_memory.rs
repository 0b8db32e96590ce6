//! An in-process audit recorder used by tests and as the default sink
//! before `nimbus-node` wires up on-disk persistence.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::audit::event::{AuditEventV1, AuditOutcome};
use crate::audit::recorder::AuditRecorder;
use crate::error::NimbusError;

pub struct InMemoryAuditRecorder {
    events: Mutex<Vec<AuditEventV1>>,
}

impl InMemoryAuditRecorder {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    pub fn events(&self) -> Vec<AuditEventV1> {
        self.events.lock().clone()
    }
}

impl Default for InMemoryAuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditRecorder for InMemoryAuditRecorder {
    async fn record(
        &self,
        principal: &str,
        action: &str,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) -> Result<(), NimbusError> {
        let mut events = self.events.lock();
        let prev_hash = events
            .last()
            .map(|e| e.event_hash())
            .unwrap_or_else(|| AuditEventV1::GENESIS_HASH.to_string());
        let event = AuditEventV1 {
            sequence: events.len() as u64,
            epoch_ms: crate::runtime::wall_clock_epoch_ms(),
            principal: principal.to_string(),
            action: action.to_string(),
            outcome,
            detail,
            prev_hash,
        };
        events.push(event);
        Ok(())
    }

    async fn tip_hash(&self) -> String {
        self.events
            .lock()
            .last()
            .map(|e| e.event_hash())
            .unwrap_or_else(|| AuditEventV1::GENESIS_HASH.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chain_extends_monotonically() {
        let recorder = InMemoryAuditRecorder::new();
        recorder.record("alice", "models.pull", AuditOutcome::Allowed, None).await.unwrap();
        let tip_after_first = recorder.tip_hash().await;
        recorder.record("bob", "models.pull", AuditOutcome::Denied, Some("rbac".into())).await.unwrap();
        let events = recorder.events();
        assert_eq!(events[1].prev_hash, tip_after_first);
    }
}
