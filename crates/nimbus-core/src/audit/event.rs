//! The audit event schema and its hash-chaining.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Blocked,
    Quarantined,
}

/// Version-tagged so future fields can be added without breaking
/// consumers that persist these events to disk or ship them off-box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEventV1 {
    pub sequence: u64,
    pub epoch_ms: u64,
    pub principal: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    /// Hex-encoded SHA-256 of the previous event's [`Self::event_hash`],
    /// or 64 zero characters for the first event in the chain.
    pub prev_hash: String,
}

impl AuditEventV1 {
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";

    /// Hex-encoded SHA-256 over every field except the hash itself,
    /// binding this event to its position in the chain via `prev_hash`.
    pub fn event_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.epoch_ms.to_be_bytes());
        hasher.update(self.principal.as_bytes());
        hasher.update(self.action.as_bytes());
        hasher.update([self.outcome.discriminant()]);
        if let Some(detail) = &self.detail {
            hasher.update(detail.as_bytes());
        }
        hasher.update(self.prev_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// `AuditOutcome` needs a stable discriminant for hashing independent of
// declaration order.
impl AuditOutcome {
    fn discriminant(self) -> u8 {
        match self {
            AuditOutcome::Allowed => 0,
            AuditOutcome::Denied => 1,
            AuditOutcome::Blocked => 2,
            AuditOutcome::Quarantined => 3,
        }
    }
}

impl From<AuditOutcome> for u8 {
    fn from(value: AuditOutcome) -> Self {
        value.discriminant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_hash_changes_with_prev_hash() {
        let base = AuditEventV1 {
            sequence: 1,
            epoch_ms: 0,
            principal: "alice".into(),
            action: "models.pull".into(),
            outcome: AuditOutcome::Allowed,
            detail: None,
            prev_hash: AuditEventV1::GENESIS_HASH.into(),
        };
        let mut chained = base.clone();
        chained.prev_hash = base.event_hash();
        assert_ne!(base.event_hash(), chained.event_hash());
    }
}
