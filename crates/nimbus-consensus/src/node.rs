//! The Raft node: role transitions, vote counting, log replication and
//! commit-index advancement. One `RaftNode` backs exactly one State Store
//! replica; `nimbus-node` owns the `Arc<RaftNode<..>>` and drives its
//! background loop via [`RaftNode::run`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::runtime::{AsyncRuntime, TimeDriver};
use rand::Rng;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::ConsensusError;
use crate::log::{LogEntry, LogEntryData, LogStorage};
use crate::membership::MembershipState;
use crate::propose::{Proposal, ProposalStatus};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::snapshot::StateMachine;
use crate::transport::RaftTransport;
use crate::types::{LogIndex, NodeId, Term};

/// Randomized to avoid synchronized elections across replicas (the
/// "split vote" failure mode); kept at 10-20x the heartbeat interval so a
/// single missed heartbeat under cross-zone RTT jitter can't trigger a
/// spurious election.
pub const ELECTION_TIMEOUT_RANGE_MS: (u64, u64) = (1000, 2000);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct LeaderState {
    next_index: BTreeMap<NodeId, LogIndex>,
    match_index: BTreeMap<NodeId, LogIndex>,
}

struct Inner<L, T, M> {
    id: NodeId,
    log: L,
    transport: T,
    state_machine: M,
    current_term: AtomicU64,
    voted_for: RwLock<Option<NodeId>>,
    role: RwLock<Role>,
    leader_id: RwLock<Option<NodeId>>,
    membership: RwLock<MembershipState>,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    commit_tx: watch::Sender<LogIndex>,
    leader_state: RwLock<Option<LeaderState>>,
    last_heartbeat_seen: RwLock<std::time::Instant>,
}

/// `L: LogStorage`, `T: RaftTransport`, `M: StateMachine` are generic
/// rather than trait objects: the node is constructed exactly once per
/// process, so there's no need to pay a vtable for something that's never
/// swapped at runtime.
pub struct RaftNode<L, T, M> {
    inner: Arc<Inner<L, T, M>>,
}

impl<L, T, M> Clone for RaftNode<L, T, M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<L, T, M> RaftNode<L, T, M>
where
    L: LogStorage + 'static,
    T: RaftTransport + 'static,
    M: StateMachine + 'static,
{
    pub fn new(id: NodeId, log: L, transport: T, state_machine: M, initial_members: Vec<NodeId>) -> Self {
        let (commit_tx, _) = watch::channel(0);
        let inner = Inner {
            id,
            log,
            transport,
            state_machine,
            current_term: AtomicU64::new(0),
            voted_for: RwLock::new(None),
            role: RwLock::new(Role::Follower),
            leader_id: RwLock::new(None),
            membership: RwLock::new(MembershipState::initial(initial_members)),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            commit_tx,
            leader_state: RwLock::new(None),
            last_heartbeat_seen: RwLock::new(std::time::Instant::now()),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn current_term(&self) -> Term {
        self.inner.current_term.load(Ordering::Acquire)
    }

    pub async fn role(&self) -> Role {
        *self.inner.role.read().await
    }

    pub async fn is_leader(&self) -> bool {
        matches!(*self.inner.role.read().await, Role::Leader)
    }

    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.inner.leader_id.read().await.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.commit_index.load(Ordering::Acquire)
    }

    /// Count of voting members in the current configuration (both halves,
    /// while a joint reconfiguration is in flight).
    pub async fn voter_count(&self) -> usize {
        self.inner.membership.read().await.all_voters().len()
    }

    /// True while membership is mid-reconfiguration, i.e. a joint
    /// configuration hasn't yet collapsed back to a single stable one.
    pub async fn has_pending_reconfiguration(&self) -> bool {
        matches!(*self.inner.membership.read().await, MembershipState::Joint { .. })
    }

    /// Appends `data` to the leader's log and waits for it to commit (or
    /// for `deadline`'s remaining budget to run out, or for this node to
    /// step down as leader first).
    pub async fn propose(&self, data: LogEntryData) -> Result<Proposal, ConsensusError> {
        let role = self.role().await;
        if role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                term: self.current_term(),
                leader_hint: self.leader_hint().await,
            });
        }
        let term = self.current_term();
        let index = self.inner.log.last_index().await + 1;
        self.inner
            .log
            .append(vec![LogEntry { index, term, data }])
            .await
            .map_err(|e| ConsensusError::Storage(e.to_string()))?;

        if let Some(state) = self.inner.leader_state.write().await.as_mut() {
            state.next_index.insert(self.inner.id.clone(), index + 1);
            state.match_index.insert(self.inner.id.clone(), index);
        }

        Ok(Proposal { term, index })
    }

    /// Blocks until `proposal` resolves to [`ProposalStatus::Committed`]
    /// or [`ProposalStatus::Failed`], whichever happens first.
    pub async fn await_commit(&self, proposal: Proposal) -> ProposalStatus {
        let mut rx = self.inner.commit_tx.subscribe();
        loop {
            match self.proposal_status(proposal).await {
                ProposalStatus::Pending => {
                    if rx.changed().await.is_err() {
                        return ProposalStatus::Unavailable;
                    }
                }
                other => return other,
            }
        }
    }

    pub async fn proposal_status(&self, proposal: Proposal) -> ProposalStatus {
        let first_retained = self.inner.log.first_retained_index().await;
        if proposal.index < first_retained {
            return ProposalStatus::Missing;
        }
        if proposal.index <= self.commit_index() {
            return match self.inner.log.entry_at(proposal.index).await {
                Ok(Some(entry)) if entry.term == proposal.term => ProposalStatus::Committed,
                Ok(Some(_)) => ProposalStatus::Failed,
                Ok(None) => ProposalStatus::Missing,
                Err(_) => ProposalStatus::Unavailable,
            };
        }
        match self.inner.log.entry_at(proposal.index).await {
            Ok(Some(entry)) if entry.term != proposal.term => ProposalStatus::Failed,
            Ok(Some(_)) => ProposalStatus::Pending,
            Ok(None) => ProposalStatus::Missing,
            Err(_) => ProposalStatus::Unavailable,
        }
    }

    /// Returns the commit index only if this node has, within the current
    /// heartbeat interval, confirmed a majority of followers still
    /// recognize it as leader — the read-index technique that makes a
    /// leader-local read linearizable without going through the log.
    pub async fn read_linearizable(&self) -> Result<LogIndex, ConsensusError> {
        if self.role().await != Role::Leader {
            return Err(ConsensusError::NotLeader { term: self.current_term(), leader_hint: self.leader_hint().await });
        }
        let acked = self.heartbeat_round().await;
        let membership = self.inner.membership.read().await;
        if membership.has_quorum(&acked) {
            Ok(self.commit_index())
        } else {
            Err(ConsensusError::NotLeader { term: self.current_term(), leader_hint: None })
        }
    }

    pub fn read_stale(&self) -> LogIndex {
        self.inner.last_applied.load(Ordering::Acquire)
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut current_term = self.current_term();
        if req.term < current_term {
            return RequestVoteResponse { term: current_term, vote_granted: false };
        }
        if req.term > current_term {
            self.step_down(req.term).await;
            current_term = req.term;
        }

        let last_log_index = self.inner.log.last_index().await;
        let last_log_term = self.inner.log.last_term().await;
        let candidate_up_to_date = (req.last_log_term, req.last_log_index) >= (last_log_term, last_log_index);

        let mut voted_for = self.inner.voted_for.write().await;
        let can_vote = voted_for.as_ref().is_none_or(|v| *v == req.candidate_id);

        if can_vote && candidate_up_to_date {
            *voted_for = Some(req.candidate_id);
            *self.inner.last_heartbeat_seen.write().await = std::time::Instant::now();
            RequestVoteResponse { term: current_term, vote_granted: true }
        } else {
            RequestVoteResponse { term: current_term, vote_granted: false }
        }
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let current_term = self.current_term();
        if req.term < current_term {
            return AppendEntriesResponse {
                term: current_term,
                success: false,
                last_log_index: self.inner.log.last_index().await,
            };
        }
        if req.term > current_term || self.role().await != Role::Follower {
            self.step_down(req.term).await;
        }
        *self.inner.leader_id.write().await = Some(req.leader_id.clone());
        *self.inner.last_heartbeat_seen.write().await = std::time::Instant::now();

        if req.prev_log_index > 0 {
            match self.inner.log.entry_at(req.prev_log_index).await {
                Ok(Some(entry)) if entry.term == req.prev_log_term => {}
                _ => {
                    return AppendEntriesResponse {
                        term: req.term,
                        success: false,
                        last_log_index: self.inner.log.last_index().await,
                    };
                }
            }
        }

        if !req.entries.is_empty() {
            let _ = self.inner.log.truncate_from(req.prev_log_index + 1).await;
            let _ = self.inner.log.append(req.entries).await;
        }

        let last_index = self.inner.log.last_index().await;
        if req.leader_commit > self.commit_index() {
            let new_commit = req.leader_commit.min(last_index);
            self.advance_commit(new_commit).await;
        }

        AppendEntriesResponse { term: req.term, success: true, last_log_index: last_index }
    }

    pub async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let current_term = self.current_term();
        if req.term < current_term {
            return InstallSnapshotResponse { term: current_term };
        }
        self.inner.state_machine.restore(&req.state_machine_bytes);
        let _ = self.inner.log.compact_before(req.last_included_index + 1).await;
        self.inner.commit_index.fetch_max(req.last_included_index, Ordering::AcqRel);
        self.inner.last_applied.store(req.last_included_index, Ordering::Release);
        *self.inner.membership.write().await = MembershipState::Stable(req.configuration);
        InstallSnapshotResponse { term: req.term }
    }

    async fn step_down(&self, new_term: Term) {
        self.inner.current_term.store(new_term, Ordering::Release);
        *self.inner.voted_for.write().await = None;
        *self.inner.role.write().await = Role::Follower;
        *self.inner.leader_state.write().await = None;
    }

    async fn advance_commit(&self, new_commit: LogIndex) {
        // Apply before publishing the new commit index: a caller that wakes
        // on `proposal_status` becoming `Committed` must see the state
        // machine already reflect the entry, not just the log.
        self.apply_up_to(new_commit).await;
        self.inner.commit_index.store(new_commit, Ordering::Release);
        let _ = self.inner.commit_tx.send(new_commit);
    }

    /// Walks every not-yet-applied committed entry in order and hands its
    /// `Command` payload to the state machine; `Noop`/`Config` entries only
    /// occupy a log index and are skipped.
    async fn apply_up_to(&self, new_commit: LogIndex) {
        let already_applied = self.inner.last_applied.load(Ordering::Acquire);
        let mut index = already_applied + 1;
        while index <= new_commit {
            if let Ok(Some(entry)) = self.inner.log.entry_at(index).await {
                if let LogEntryData::Command { payload, .. } = &entry.data {
                    self.inner.state_machine.apply(index, payload);
                }
            }
            self.inner.last_applied.store(index, Ordering::Release);
            index += 1;
        }
    }

    /// One election attempt: increments term, votes for self, requests
    /// votes from every peer concurrently, becomes leader on majority.
    pub async fn start_election(&self) {
        let next_term = self.current_term() + 1;
        self.inner.current_term.store(next_term, Ordering::Release);
        *self.inner.role.write().await = Role::Candidate;
        *self.inner.voted_for.write().await = Some(self.inner.id.clone());
        *self.inner.leader_id.write().await = None;
        *self.inner.last_heartbeat_seen.write().await = std::time::Instant::now();

        let last_log_index = self.inner.log.last_index().await;
        let last_log_term = self.inner.log.last_term().await;
        let peers: Vec<NodeId> = self
            .inner
            .membership
            .read()
            .await
            .all_voters()
            .into_iter()
            .filter(|p| *p != self.inner.id)
            .collect();

        let mut acked = std::collections::BTreeSet::new();
        acked.insert(self.inner.id.clone());

        for peer in peers {
            let req = RequestVoteRequest {
                term: next_term,
                candidate_id: self.inner.id.clone(),
                last_log_index,
                last_log_term,
            };
            match self.inner.transport.send_request_vote(&peer, req).await {
                Ok(resp) if resp.vote_granted && resp.term == next_term => {
                    acked.insert(peer);
                }
                Ok(resp) if resp.term > next_term => {
                    self.step_down(resp.term).await;
                    return;
                }
                _ => {}
            }
        }

        if self.current_term() != next_term || self.role().await != Role::Candidate {
            return;
        }

        let has_quorum = self.inner.membership.read().await.has_quorum(&acked);
        if has_quorum {
            self.become_leader().await;
        }
    }

    async fn become_leader(&self) {
        info!(node_id = %self.inner.id, term = self.current_term(), "became leader");
        *self.inner.role.write().await = Role::Leader;
        *self.inner.leader_id.write().await = Some(self.inner.id.clone());
        let last_index = self.inner.log.last_index().await;
        let peers: Vec<NodeId> = self
            .inner
            .membership
            .read()
            .await
            .all_voters()
            .into_iter()
            .filter(|p| *p != self.inner.id)
            .collect();
        let mut next_index = BTreeMap::new();
        let mut match_index = BTreeMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_index + 1);
            match_index.insert(peer, 0);
        }
        *self.inner.leader_state.write().await = Some(LeaderState { next_index, match_index });

        // Commit a no-op so entries from prior terms become safely
        // committed under the current term, per the Raft commit rule.
        let _ = self.propose(LogEntryData::Noop).await;
    }

    /// Sends `AppendEntries` (heartbeat, possibly carrying new entries) to
    /// every peer once and advances `commit_index` if a majority now
    /// match. Returns the set of peers (including self) that
    /// acknowledged, for [`Self::read_linearizable`]'s quorum check.
    pub async fn heartbeat_round(&self) -> std::collections::BTreeSet<NodeId> {
        let mut acked = std::collections::BTreeSet::new();
        acked.insert(self.inner.id.clone());

        let Some(peers) = self.leader_peer_targets().await else {
            return acked;
        };
        let term = self.current_term();
        let commit_index = self.commit_index();

        for peer in peers {
            let next_idx = {
                let state = self.inner.leader_state.read().await;
                state.as_ref().and_then(|s| s.next_index.get(&peer).copied()).unwrap_or(1)
            };
            let prev_log_index = next_idx.saturating_sub(1);
            let prev_log_term = match self.inner.log.entry_at(prev_log_index).await {
                Ok(Some(e)) => e.term,
                _ => 0,
            };
            let entries = self.inner.log.entries_from(next_idx, 256).await.unwrap_or_default();
            let req = AppendEntriesRequest {
                term,
                leader_id: self.inner.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };
            match self.inner.transport.send_append_entries(&peer, req).await {
                Ok(resp) if resp.success && resp.term == term => {
                    acked.insert(peer.clone());
                    if let Some(state) = self.inner.leader_state.write().await.as_mut() {
                        state.match_index.insert(peer.clone(), resp.last_log_index);
                        state.next_index.insert(peer, resp.last_log_index + 1);
                    }
                }
                Ok(resp) if resp.term > term => {
                    self.step_down(resp.term).await;
                    return acked;
                }
                Ok(resp) => {
                    if let Some(state) = self.inner.leader_state.write().await.as_mut() {
                        let next = state.next_index.entry(peer).or_insert(1);
                        *next = (*next).saturating_sub(1).max(1).min(resp.last_log_index + 1);
                    }
                }
                Err(err) => {
                    debug!(peer = %peer, error = %err, "append_entries failed");
                }
            }
        }

        self.try_advance_commit_from_matches().await;
        acked
    }

    async fn leader_peer_targets(&self) -> Option<Vec<NodeId>> {
        if self.role().await != Role::Leader {
            return None;
        }
        let state = self.inner.leader_state.read().await;
        state.as_ref().map(|s| s.next_index.keys().cloned().collect())
    }

    async fn try_advance_commit_from_matches(&self) {
        let term = self.current_term();
        let last_index = self.inner.log.last_index().await;
        let Some(state) = self.inner.leader_state.read().await.as_ref().map(|s| s.match_index.clone()) else {
            return;
        };
        let membership = self.inner.membership.read().await.clone();

        let mut candidate_index = self.commit_index();
        for index in (self.commit_index() + 1)..=last_index {
            let acked: std::collections::BTreeSet<NodeId> = state
                .iter()
                .filter(|(_, matched)| **matched >= index)
                .map(|(node, _)| node.clone())
                .chain(std::iter::once(self.inner.id.clone()))
                .collect();
            if membership.has_quorum(&acked) {
                if let Ok(Some(entry)) = self.inner.log.entry_at(index).await {
                    if entry.term == term {
                        candidate_index = index;
                    }
                }
            } else {
                break;
            }
        }
        if candidate_index > self.commit_index() {
            self.advance_commit(candidate_index).await;
        }
    }

    async fn election_timeout_elapsed(&self) -> bool {
        let timeout_ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE_MS.0..=ELECTION_TIMEOUT_RANGE_MS.1);
        let last_seen = *self.inner.last_heartbeat_seen.read().await;
        last_seen.elapsed() >= Duration::from_millis(timeout_ms)
    }

    /// The background loop: on a follower/candidate, watches for election
    /// timeout; on a leader, sends heartbeats on a fixed interval. Runs
    /// until `shutdown` is canceled.
    pub async fn run<R: AsyncRuntime>(self, runtime: Arc<R>, shutdown: nimbus_core::contract::Cancellation) {
        loop {
            if shutdown.is_canceled() {
                return;
            }
            match self.role().await {
                Role::Leader => {
                    self.heartbeat_round().await;
                    runtime.sleep(HEARTBEAT_INTERVAL).await;
                }
                Role::Follower | Role::Candidate => {
                    if self.election_timeout_elapsed().await {
                        warn!(node_id = %self.inner.id, "election timeout elapsed, starting election");
                        self.start_election().await;
                    }
                    runtime.sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;
    use crate::snapshot::test_support::RecordingStateMachine;
    use std::collections::HashMap;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct LoopbackTransport {
        peers: TokioMutex<HashMap<NodeId, RaftNode<InMemoryLog, LoopbackTransport, RecordingStateMachine>>>,
    }

    #[async_trait::async_trait]
    impl RaftTransport for LoopbackTransport {
        async fn send_append_entries(
            &self,
            peer: &NodeId,
            request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, crate::transport::TransportError> {
            let peers = self.peers.lock().await;
            let node = peers.get(peer).ok_or_else(|| crate::transport::TransportError::Unreachable(peer.clone()))?;
            Ok(node.handle_append_entries(request).await)
        }

        async fn send_request_vote(
            &self,
            peer: &NodeId,
            request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse, crate::transport::TransportError> {
            let peers = self.peers.lock().await;
            let node = peers.get(peer).ok_or_else(|| crate::transport::TransportError::Unreachable(peer.clone()))?;
            Ok(node.handle_request_vote(request).await)
        }

        async fn send_install_snapshot(
            &self,
            peer: &NodeId,
            request: InstallSnapshotRequest,
        ) -> Result<InstallSnapshotResponse, crate::transport::TransportError> {
            let peers = self.peers.lock().await;
            let node = peers.get(peer).ok_or_else(|| crate::transport::TransportError::Unreachable(peer.clone()))?;
            Ok(node.handle_install_snapshot(request).await)
        }
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself_leader_and_commits() {
        let id = NodeId::new("solo");
        let node = RaftNode::new(
            id.clone(),
            InMemoryLog::new(),
            LoopbackTransport::default(),
            RecordingStateMachine::default(),
            vec![id],
        );
        node.start_election().await;
        assert_eq!(node.role().await, Role::Leader);

        let proposal = node.propose(LogEntryData::Command { idempotency_key: None, payload: b"hi".to_vec() }).await.unwrap();
        node.heartbeat_round().await;
        assert_eq!(node.proposal_status(proposal).await, ProposalStatus::Committed);
    }

    #[tokio::test]
    async fn non_leader_rejects_propose_with_not_leader() {
        let id = NodeId::new("follower-only");
        let node = RaftNode::new(
            id.clone(),
            InMemoryLog::new(),
            LoopbackTransport::default(),
            RecordingStateMachine::default(),
            vec![id, NodeId::new("other")],
        );
        let err = node.propose(LogEntryData::Noop).await.unwrap_err();
        assert!(matches!(err, ConsensusError::NotLeader { .. }));
    }
}
