//! The State Store: a Raft-replicated log and key/value state machine
//! interface, giving the rest of the cluster linearizable writes, cheap
//! stale reads, and safe membership reconfiguration.

pub mod error;
pub mod log;
pub mod membership;
pub mod node;
pub mod propose;
pub mod rpc;
pub mod snapshot;
pub mod transport;
pub mod types;

pub use error::ConsensusError;
pub use log::{LogEntry, LogEntryData, LogStorage};
pub use membership::{ConfigChange, Configuration, MembershipState};
pub use node::{RaftNode, Role, ELECTION_TIMEOUT_RANGE_MS, HEARTBEAT_INTERVAL};
pub use propose::{Proposal, ProposalStatus, ProposeError};
pub use snapshot::{Snapshot, StateMachine};
pub use transport::{RaftTransport, TransportError};
pub use types::{LogIndex, LogPosition, NodeId, Term};
