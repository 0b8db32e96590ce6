//! Raft's primitive types. `NodeId` is reused from `nimbus-core` so a
//! consensus peer and a fabric peer are always the same identity; `Term`
//! and `LogIndex` are consensus-local and never cross a crate boundary
//! except wrapped in `ProposalStatus`/RPC messages.

pub use nimbus_core::ids::NodeId;

pub type Term = u64;
pub type LogIndex = u64;

/// A position in the replicated log: the coordinate a caller needs to
/// check whether their proposal committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition { term: 0, index: 0 };
}
