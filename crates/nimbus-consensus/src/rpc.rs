//! Wire message shapes for the three Raft RPCs, matching the fields named
//! in the teacher corpus's Raft reference (`AppendEntriesRequest`,
//! `RequestVoteRequest`, ...) with the addition of a snapshot RPC body,
//! which the reference left as a stub.

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::membership::Configuration;
use crate::types::{LogIndex, NodeId, Term};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Lets the leader jump straight to the follower's actual divergence
    /// point instead of backing off one index per round trip.
    pub last_log_index: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: Configuration,
    pub state_machine_bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}
