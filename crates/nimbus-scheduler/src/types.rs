//! The request data model and its state machine:
//! `New -> Admitted -> Dispatched -> Streaming -> {Done, Failed, Canceled}`.

use bytes::Bytes;
use nimbus_core::contract::{Cancellation, Deadline};
use nimbus_core::ids::RequestId;
use nimbus_core::security::SecurityContextSnapshot;
use nimbus_registry::ModelKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    New,
    Admitted,
    Dispatched,
    Streaming,
    Done,
    Failed,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed | RequestState::Canceled)
    }

    /// `Dispatched -> Dispatched` (re-dispatch on failover) is allowed only
    /// while the request has not yet reached `Streaming` — once streaming
    /// has begun, the first-token commit point forbids any further
    /// dispatch.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (New, Admitted)
                | (Admitted, Dispatched)
                | (Dispatched, Dispatched)
                | (Dispatched, Streaming)
                | (Streaming, Done)
                | (Dispatched, Failed)
                | (Streaming, Failed)
                | (New, Canceled)
                | (Admitted, Canceled)
                | (Dispatched, Canceled)
                | (Streaming, Canceled)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal state transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: RequestState,
    pub to: RequestState,
}

#[derive(Clone, Debug)]
pub struct InferenceRequest {
    pub id: RequestId,
    pub security: SecurityContextSnapshot,
    pub model: ModelKey,
    pub payload: Bytes,
    pub stream: bool,
    pub deadline: Deadline,
    pub cancellation: Cancellation,
    pub priority: u8,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

impl InferenceRequest {
    pub fn has_budget_remaining(&self) -> bool {
        !self.deadline.is_expired() && self.attempt_count < self.max_attempts
    }
}
