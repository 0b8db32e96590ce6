//! Small value types shared across component boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `String` that is statically known to never be empty. Registry names,
/// model ids and node labels all flow through this so downstream code never
/// has to handle the empty-string edge case.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyStr(String);

impl NonEmptyStr {
    pub fn new(raw: impl Into<String>) -> Result<Self, EmptyStringError> {
        let raw = raw.into();
        if raw.is_empty() {
            Err(EmptyStringError)
        } else {
            Ok(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for NonEmptyStr {
    type Error = EmptyStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyStr> for String {
    fn from(value: NonEmptyStr) -> Self {
        value.0
    }
}

impl fmt::Display for NonEmptyStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("string must not be empty")]
pub struct EmptyStringError;

/// Why a stream, connection, or session ended. Carried on `Done`/`Canceled`
/// transitions of the scheduler's request state machine and on fabric
/// stream teardown so observability doesn't have to guess from a dropped
/// future.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The operation completed successfully.
    Completed,
    /// The caller requested cancellation.
    CanceledByCaller,
    /// The deadline passed before completion.
    DeadlineExceeded,
    /// The owning component is shutting down.
    ComponentShutdown,
    /// An upstream peer or dependency failed.
    UpstreamFailure { detail: String },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "completed"),
            CloseReason::CanceledByCaller => write!(f, "canceled by caller"),
            CloseReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CloseReason::ComponentShutdown => write!(f, "component shutdown"),
            CloseReason::UpstreamFailure { detail } => write!(f, "upstream failure: {detail}"),
        }
    }
}

/// Which budget a caller is spending against. The scheduler and security
/// envelope both consult budgets, but for different resources, so the kind
/// is explicit rather than inferred from context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Concurrent in-flight inference requests admitted cluster-wide.
    AdmissionSlots,
    /// Tokens consumed per rate-limit window for one principal.
    RateLimitTokens,
    /// Bytes reserved for in-flight chunk transfers on one peer connection.
    ChunkTransferBytes,
}

/// The outcome of checking a budget: either a lease was granted, or the
/// caller learns how soon to try again.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BudgetDecision {
    Granted,
    Denied { retry_after_ms: u64 },
}

/// A point-in-time view of a budget's capacity, used in admission control
/// logging and the `/metrics` endpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetSnapshot {
    pub kind: BudgetKind,
    pub capacity: u64,
    pub in_use: u64,
}

impl BudgetSnapshot {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.in_use as f64 / self.capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_str_rejects_empty() {
        assert!(NonEmptyStr::new("").is_err());
        assert!(NonEmptyStr::new("ok").is_ok());
    }

    #[test]
    fn budget_utilization_handles_zero_capacity() {
        let snap = BudgetSnapshot { kind: BudgetKind::AdmissionSlots, capacity: 0, in_use: 0 };
        assert_eq!(snap.utilization(), 0.0);
    }
}
