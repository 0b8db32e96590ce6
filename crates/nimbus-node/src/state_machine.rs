//! The concrete [`StateMachine`] the State Store replicates, and the
//! [`RegistryStore`] adapter that routes writes through a [`RaftNode`]
//! proposal instead of applying them locally. Reads never touch the log:
//! they go straight to [`RegistryStateMachineCore`], which already holds
//! everything committed up to `last_applied`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nimbus_consensus::log::{LogEntryData, LogStorage};
use nimbus_consensus::node::RaftNode;
use nimbus_consensus::propose::ProposalStatus;
use nimbus_consensus::snapshot::StateMachine;
use nimbus_consensus::transport::RaftTransport;
use nimbus_consensus::types::LogIndex;
use nimbus_core::ids::NodeId;
use nimbus_fabric::ChunkDigest;
use nimbus_registry::{ModelDescriptor, ModelKey, PlacementRecord, RegistryError, RegistryStore, RepairTask, TaskId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Every mutation the registry can make, serialized into a log entry's
/// `Command` payload. Mirrors [`RegistryStore`]'s write methods one for
/// one so applying a command is just replaying that same call locally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RegistryCommand {
    InsertDescriptor(ModelDescriptor),
    UpsertPlacement(PlacementRecord),
    RemovePlacement { digest: ChunkDigest, node: NodeId },
    EnqueueTask(RepairTask),
    CompleteTask(TaskId),
    RequeueTaskWithBackoff(TaskId),
}

#[derive(Default, Serialize, Deserialize)]
struct StateSnapshot {
    descriptors: Vec<ModelDescriptor>,
    placements: Vec<PlacementRecord>,
    tasks: Vec<RepairTask>,
}

/// The registry's applied state, kept in `DashMap`s so `apply` (called
/// synchronously from the consensus crate's commit path) never has to
/// cross an `.await` point.
#[derive(Default)]
pub struct RegistryStateMachineCore {
    descriptors_by_key: DashMap<ModelKey, ChunkDigest>,
    descriptors_by_digest: DashMap<ChunkDigest, ModelDescriptor>,
    placements: DashMap<(ChunkDigest, NodeId), PlacementRecord>,
    tasks: DashMap<TaskId, RepairTask>,
}

impl RegistryStateMachineCore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_command(&self, command: RegistryCommand) {
        match command {
            RegistryCommand::InsertDescriptor(descriptor) => {
                if let Some(existing) = self.descriptors_by_key.get(&descriptor.key) {
                    if *existing != descriptor.digest {
                        warn!(model = %descriptor.key, "ignoring committed insert with a conflicting digest");
                        return;
                    }
                }
                self.descriptors_by_key.insert(descriptor.key.clone(), descriptor.digest);
                self.descriptors_by_digest.insert(descriptor.digest, descriptor);
            }
            RegistryCommand::UpsertPlacement(record) => {
                self.placements.insert((record.model_digest, record.node_id.clone()), record);
            }
            RegistryCommand::RemovePlacement { digest, node } => {
                self.placements.remove(&(digest, node));
            }
            RegistryCommand::EnqueueTask(task) => {
                self.tasks.insert(task.id, task);
            }
            RegistryCommand::CompleteTask(id) => {
                self.tasks.remove(&id);
            }
            RegistryCommand::RequeueTaskWithBackoff(id) => {
                if let Some(mut task) = self.tasks.get_mut(&id) {
                    task.attempt += 1;
                }
            }
        }
    }

    fn descriptor_by_key(&self, key: &ModelKey) -> Option<ModelDescriptor> {
        let digest = *self.descriptors_by_key.get(key)?;
        self.descriptors_by_digest.get(&digest).map(|e| e.clone())
    }

    fn descriptor_by_digest(&self, digest: &ChunkDigest) -> Option<ModelDescriptor> {
        self.descriptors_by_digest.get(digest).map(|e| e.clone())
    }

    fn all_descriptors(&self) -> Vec<ModelDescriptor> {
        self.descriptors_by_digest.iter().map(|e| e.value().clone()).collect()
    }

    fn placements_for(&self, digest: &ChunkDigest) -> Vec<PlacementRecord> {
        self.placements.iter().filter(|e| e.key().0 == *digest).map(|e| e.value().clone()).collect()
    }

    fn pending_tasks(&self) -> Vec<RepairTask> {
        self.tasks.iter().map(|e| e.value().clone()).collect()
    }
}

impl StateMachine for RegistryStateMachineCore {
    fn apply(&self, _entry_index: LogIndex, command: &[u8]) {
        match serde_json::from_slice::<RegistryCommand>(command) {
            Ok(command) => self.apply_command(command),
            Err(err) => warn!(%err, "dropping committed entry with an undecodable registry command"),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let snapshot = StateSnapshot {
            descriptors: self.all_descriptors(),
            placements: self.placements.iter().map(|e| e.value().clone()).collect(),
            tasks: self.pending_tasks(),
        };
        serde_json::to_vec(&snapshot).unwrap_or_default()
    }

    fn restore(&self, bytes: &[u8]) {
        let Ok(snapshot) = serde_json::from_slice::<StateSnapshot>(bytes) else {
            warn!("dropping an undecodable snapshot during restore");
            return;
        };
        self.descriptors_by_key.clear();
        self.descriptors_by_digest.clear();
        self.placements.clear();
        self.tasks.clear();
        for descriptor in snapshot.descriptors {
            self.descriptors_by_key.insert(descriptor.key.clone(), descriptor.digest);
            self.descriptors_by_digest.insert(descriptor.digest, descriptor);
        }
        for placement in snapshot.placements {
            self.placements.insert((placement.model_digest, placement.node_id.clone()), placement);
        }
        for task in snapshot.tasks {
            self.tasks.insert(task.id, task);
        }
    }
}

/// `StateMachine` is implemented for this newtype rather than directly on
/// `Arc<RegistryStateMachineCore>`: `nimbus-node` also needs a live handle
/// to the same core for reads, so the core is shared by `Arc` while this
/// thin wrapper is what's handed by value into [`RaftNode::new`].
#[derive(Clone)]
pub struct SharedStateMachine(pub Arc<RegistryStateMachineCore>);

impl StateMachine for SharedStateMachine {
    fn apply(&self, entry_index: LogIndex, command: &[u8]) {
        self.0.apply(entry_index, command)
    }

    fn snapshot(&self) -> Vec<u8> {
        self.0.snapshot()
    }

    fn restore(&self, bytes: &[u8]) {
        self.0.restore(bytes)
    }
}

/// [`RegistryStore`] backed by a live [`RaftNode`]: writes propose a
/// [`RegistryCommand`] and block until it commits (or fails), reads go
/// straight to the locally-applied [`RegistryStateMachineCore`].
pub struct RaftRegistryStore<L, T> {
    node: RaftNode<L, T, SharedStateMachine>,
    core: Arc<RegistryStateMachineCore>,
}

impl<L, T> RaftRegistryStore<L, T>
where
    L: LogStorage + 'static,
    T: RaftTransport + 'static,
{
    pub fn new(node: RaftNode<L, T, SharedStateMachine>, core: Arc<RegistryStateMachineCore>) -> Self {
        Self { node, core }
    }

    async fn propose_and_wait(&self, command: RegistryCommand) -> Result<(), RegistryError> {
        let payload = serde_json::to_vec(&command).map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;
        let proposal = self
            .node
            .propose(LogEntryData::Command { idempotency_key: None, payload })
            .await
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;
        match self.node.await_commit(proposal).await {
            ProposalStatus::Committed => Ok(()),
            other => Err(RegistryError::StoreUnavailable(format!("registry proposal did not commit: {other:?}"))),
        }
    }

    /// Fires a write and logs the outcome instead of surfacing it: used
    /// by the [`RegistryStore`] methods whose trait signature has no
    /// `Result` to carry a "not leader, retry" failure back through.
    async fn propose_best_effort(&self, command: RegistryCommand) {
        if let Err(err) = self.propose_and_wait(command).await {
            warn!(%err, "best-effort registry write did not commit");
        }
    }
}

#[async_trait]
impl<L, T> RegistryStore for RaftRegistryStore<L, T>
where
    L: LogStorage + 'static,
    T: RaftTransport + 'static,
{
    async fn insert_descriptor(&self, descriptor: ModelDescriptor) -> Result<(), RegistryError> {
        if let Some(existing) = self.core.descriptor_by_key(&descriptor.key) {
            if existing.digest != descriptor.digest {
                return Err(RegistryError::DigestConflict { name: descriptor.key.name, version: descriptor.key.version });
            }
            return Ok(());
        }
        self.propose_and_wait(RegistryCommand::InsertDescriptor(descriptor)).await
    }

    async fn descriptor_by_key(&self, key: &ModelKey) -> Option<ModelDescriptor> {
        self.core.descriptor_by_key(key)
    }

    async fn descriptor_by_digest(&self, digest: &ChunkDigest) -> Option<ModelDescriptor> {
        self.core.descriptor_by_digest(digest)
    }

    async fn all_descriptors(&self) -> Vec<ModelDescriptor> {
        self.core.all_descriptors()
    }

    async fn placements_for(&self, digest: &ChunkDigest) -> Vec<PlacementRecord> {
        self.core.placements_for(digest)
    }

    async fn upsert_placement(&self, record: PlacementRecord) {
        self.propose_best_effort(RegistryCommand::UpsertPlacement(record)).await;
    }

    async fn remove_placement(&self, digest: &ChunkDigest, node: &NodeId) {
        self.propose_best_effort(RegistryCommand::RemovePlacement { digest: *digest, node: node.clone() }).await;
    }

    async fn enqueue_task(&self, task: RepairTask) {
        self.propose_best_effort(RegistryCommand::EnqueueTask(task)).await;
    }

    async fn pending_tasks(&self) -> Vec<RepairTask> {
        self.core.pending_tasks()
    }

    async fn complete_task(&self, id: TaskId) {
        self.propose_best_effort(RegistryCommand::CompleteTask(id)).await;
    }

    async fn requeue_task_with_backoff(&self, id: TaskId) {
        self.propose_best_effort(RegistryCommand::RequeueTaskWithBackoff(id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_consensus::log::InMemoryLog;
    use nimbus_consensus::rpc::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
        RequestVoteRequest, RequestVoteResponse,
    };
    use nimbus_consensus::transport::TransportError;

    struct NoopTransport;

    #[async_trait]
    impl RaftTransport for NoopTransport {
        async fn send_append_entries(&self, peer: &NodeId, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }
        async fn send_request_vote(&self, peer: &NodeId, _req: RequestVoteRequest) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }
        async fn send_install_snapshot(&self, peer: &NodeId, _req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }
    }

    fn single_node_store() -> RaftRegistryStore<InMemoryLog, NoopTransport> {
        let node_id = NodeId::new("solo");
        let core = Arc::new(RegistryStateMachineCore::new());
        let raft = RaftNode::new(node_id.clone(), InMemoryLog::new(), NoopTransport, SharedStateMachine(core.clone()), vec![node_id]);
        RaftRegistryStore::new(raft, core)
    }

    fn descriptor(name: &str) -> ModelDescriptor {
        let digest = ChunkDigest::of(name.as_bytes());
        ModelDescriptor { key: ModelKey::new(name, "v1"), digest, total_size_bytes: 1024, chunks: vec![digest] }
    }

    #[tokio::test]
    async fn insert_descriptor_is_rejected_without_a_leader() {
        let store = single_node_store();
        // A freshly constructed node starts as a follower; it has never
        // run an election, so every proposal is rejected up front.
        let result = store.insert_descriptor(descriptor("llama")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn re_inserting_the_same_descriptor_is_a_no_op_even_without_a_leader() {
        let store = single_node_store();
        store.core.apply_command(RegistryCommand::InsertDescriptor(descriptor("llama")));
        assert!(store.insert_descriptor(descriptor("llama")).await.is_ok());
    }

    #[tokio::test]
    async fn conflicting_digest_is_rejected_locally_without_a_proposal() {
        let store = single_node_store();
        store.core.apply_command(RegistryCommand::InsertDescriptor(descriptor("llama")));
        let mut conflicting = descriptor("llama");
        conflicting.digest = ChunkDigest::of(b"different-bytes");
        let result = store.insert_descriptor(conflicting).await;
        assert!(matches!(result, Err(RegistryError::DigestConflict { .. })));
    }

    #[test]
    fn apply_and_snapshot_round_trip_through_the_core() {
        let core = RegistryStateMachineCore::new();
        core.apply_command(RegistryCommand::InsertDescriptor(descriptor("llama")));
        let bytes = core.snapshot();

        let restored = RegistryStateMachineCore::new();
        restored.restore(&bytes);
        assert!(restored.descriptor_by_key(&ModelKey::new("llama", "v1")).is_some());
    }

    #[test]
    fn state_machine_apply_drops_undecodable_commands_without_panicking() {
        let core = RegistryStateMachineCore::new();
        core.apply(1, b"not valid json");
        assert!(core.all_descriptors().is_empty());
    }
}
