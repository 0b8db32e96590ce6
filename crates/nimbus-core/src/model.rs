//! Generic lifecycle state shared by every long-running component
//! (Raft node, fabric connection manager, scheduler, node process itself).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse lifecycle phase of a component. Individual components layer
/// richer state machines on top (e.g. Raft's Follower/Candidate/Leader)
/// but all of them are observable through this common shape on the
/// `/health` endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
}

impl ComponentStatus {
    pub fn is_serving(self) -> bool {
        matches!(self, ComponentStatus::Ready | ComponentStatus::Degraded)
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::Ready => "ready",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::Stopping => "stopping",
            ComponentStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A health rollup combining a component's own status with a human
/// message, used both for `/health` responses and for the scheduler's
/// health-weighted scoring term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub message: Option<String>,
}

impl HealthReport {
    pub fn ready() -> Self {
        Self { status: ComponentStatus::Ready, message: None }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self { status: ComponentStatus::Degraded, message: Some(message.into()) }
    }

    /// Maps to the scheduler's `health` scoring term in `[0.0, 1.0]`.
    pub fn score(&self) -> f64 {
        match self.status {
            ComponentStatus::Ready => 1.0,
            ComponentStatus::Degraded => 0.4,
            ComponentStatus::Starting => 0.0,
            ComponentStatus::Stopping | ComponentStatus::Stopped => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_counts_as_serving() {
        assert!(ComponentStatus::Degraded.is_serving());
        assert!(!ComponentStatus::Stopped.is_serving());
    }

    #[test]
    fn health_score_ordering_matches_desirability() {
        assert!(HealthReport::ready().score() > HealthReport::degraded("slow").score());
    }
}
