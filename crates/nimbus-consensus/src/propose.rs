//! The caller-facing side of a write: what you get back from `propose`,
//! and how to ask "did it commit yet". Grounded on the teacher corpus's
//! Raft reference `ProposeResponse`/`Proposal` shape, extended with the
//! `ProposalStatus` poll the spec's State Store contract requires.

use crate::types::LogPosition;

pub type Proposal = LogPosition;

/// The outcome of polling a [`Proposal`] after it was accepted by the
/// leader but before (or after) it committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalStatus {
    /// Committed at this log position; safe to apply to the state machine.
    Committed,
    /// A later leader overwrote this slot; the proposal will never commit.
    Failed,
    /// Still waiting on replication/commit.
    Pending,
    /// The log was compacted past this index before it was resolved, or
    /// this node never had a record of it.
    Missing,
    /// This node can't currently answer (it's not caught up far enough to
    /// know either way).
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("not the leader; retry against {leader_hint:?}")]
    NotLeader { leader_hint: Option<crate::types::NodeId> },

    /// The leader accepted the write into its log at `at`, but the caller
    /// should poll rather than assume commit; returned when `propose` is
    /// called in non-blocking mode.
    #[error("accepted, retry status check after {0:?}")]
    RetryAfter(Proposal),
}
