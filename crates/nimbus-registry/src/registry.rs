//! [`ModelRegistry`]: the facade exposing `register_model` / `list_models`
//! / `locate` / `request_pull` / `request_evict` / `rebalance`, driving
//! the pull protocol and the periodic desired-vs-actual diff described in
//! the placement module.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use nimbus_core::cluster::{ClusterMembership, NodeProfile};
use nimbus_core::ids::NodeId;
use nimbus_core::runtime::wall_clock_epoch_ms;
use nimbus_fabric::ChunkDigest;
use sha2::{Digest as _, Sha256};
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::placement::{can_evict, choose_pull_targets, diagnose_gap, rank_sources, PlacementGap, PlacementPolicy};
use crate::store::RegistryStore;
use crate::task::{RepairTask, TaskId, TaskKind};
use crate::types::{ModelDescriptor, ModelFilter, ModelKey, ModelSummary, PlacementRecord, PlacementState};

/// The subset of [`nimbus_fabric::PeerFabric`] the pull protocol needs,
/// kept as its own trait so this crate isn't generic over the fabric's
/// transport type parameters.
#[async_trait::async_trait]
pub trait ChunkSource: Send + Sync {
    async fn chunk_get(&self, digest: ChunkDigest, holders: &[NodeId]) -> Result<Bytes, nimbus_fabric::FabricError>;
}

pub struct ModelRegistry<S, C> {
    store: Arc<S>,
    chunk_source: Arc<C>,
    policy: PlacementPolicy,
    local_node: NodeId,
}

impl<S, C> ModelRegistry<S, C>
where
    S: RegistryStore,
    C: ChunkSource,
{
    pub fn new(store: Arc<S>, chunk_source: Arc<C>, policy: PlacementPolicy, local_node: NodeId) -> Self {
        Self { store, chunk_source, policy, local_node }
    }

    pub async fn register_model(&self, descriptor: ModelDescriptor) -> Result<(), RegistryError> {
        info!(model = %descriptor.key, digest = %descriptor.digest, "registering model");
        self.store.insert_descriptor(descriptor).await
    }

    pub async fn list_models(&self, filter: ModelFilter) -> Vec<ModelSummary> {
        let mut summaries = Vec::new();
        for descriptor in self.store.all_descriptors().await {
            if let Some(name) = &filter.name {
                if &descriptor.key.name != name {
                    continue;
                }
            }
            let placements = self.store.placements_for(&descriptor.digest).await;
            let ready_node_count = placements.iter().filter(|p| p.is_ready()).count();
            if filter.only_with_ready_replica && ready_node_count == 0 {
                continue;
            }
            summaries.push(ModelSummary { key: descriptor.key, digest: descriptor.digest, total_size_bytes: descriptor.total_size_bytes, ready_node_count });
        }
        summaries
    }

    pub async fn locate(&self, key: &ModelKey) -> Result<Vec<NodeId>, RegistryError> {
        let descriptor = self.store.descriptor_by_key(key).await.ok_or_else(|| RegistryError::UnknownModel(key.to_string()))?;
        let placements = self.store.placements_for(&descriptor.digest).await;
        let ready: Vec<NodeId> = placements.into_iter().filter(|p| p.is_ready()).map(|p| p.node_id).collect();
        if ready.is_empty() {
            return Err(RegistryError::NoReplica(key.to_string()));
        }
        Ok(ready)
    }

    /// Writes `Placement(pending)` and enqueues a `Pull` task for the
    /// target worker to execute via [`Self::execute_pull`].
    pub async fn request_pull(&self, model_digest: ChunkDigest, target_node: NodeId) -> Result<TaskId, RegistryError> {
        let now = wall_clock_epoch_ms();
        self.store.upsert_placement(PlacementRecord::pending(model_digest, target_node.clone(), now)).await;
        let id = self.next_task_id();
        let task = RepairTask { id, kind: TaskKind::Pull { model_digest, target_node }, attempt: 0, created_at_epoch_ms: now };
        self.store.enqueue_task(task).await;
        Ok(id)
    }

    pub async fn request_evict(&self, model_digest: ChunkDigest, node: NodeId) -> Result<TaskId, RegistryError> {
        let placements = self.store.placements_for(&model_digest).await;
        if !can_evict(&self.policy, &placements, &node) {
            return Err(RegistryError::WouldUnderReplicate { model: model_digest.to_string(), node: node.to_string() });
        }
        let now = wall_clock_epoch_ms();
        let id = self.next_task_id();
        let task = RepairTask { id, kind: TaskKind::Evict { model_digest, node }, attempt: 0, created_at_epoch_ms: now };
        self.store.enqueue_task(task).await;
        Ok(id)
    }

    /// Diffs desired vs. actual placement for every registered model and
    /// emits `Pull` tasks to close any gap. Does not itself evict — the
    /// spec keeps eviction an explicit, separately-authorized operation.
    pub async fn rebalance(&self, membership: &ClusterMembership) -> Result<Vec<TaskId>, RegistryError> {
        let node_zones: HashMap<NodeId, String> = membership.all().map(|m| (m.profile.node_id.clone(), m.profile.failure_zone.clone())).collect();
        let candidates: Vec<NodeProfile> = membership.all().map(|m| m.profile.clone()).collect();

        let mut emitted = Vec::new();
        for descriptor in self.store.all_descriptors().await {
            let placements = self.store.placements_for(&descriptor.digest).await;
            match diagnose_gap(&self.policy, &placements, &node_zones) {
                PlacementGap::Satisfied => continue,
                PlacementGap::NeedsPull { count } => {
                    let targets = choose_pull_targets(&candidates, &placements, count);
                    if targets.is_empty() {
                        warn!(model = %descriptor.key, "rebalance found a gap but no free candidate nodes");
                        continue;
                    }
                    for target in targets {
                        let id = self.request_pull(descriptor.digest, target.node_id.clone()).await?;
                        emitted.push(id);
                    }
                }
            }
        }
        Ok(emitted)
    }

    /// The pull protocol: discover sources, fetch and verify every chunk
    /// in zone/load preference order, verify the assembled manifest
    /// digest, then flip the placement to ready. On any failure the
    /// placement moves to `failed` and the task is requeued with
    /// exponential backoff up to [`MAX_TASK_ATTEMPTS`], after which it is
    /// left in the store for operator attention (quarantined).
    pub async fn execute_pull(&self, task: &RepairTask, caller_zone: &str, source_candidates: &[NodeProfile]) -> Result<(), RegistryError> {
        let TaskKind::Pull { model_digest, target_node } = &task.kind else {
            return Ok(());
        };
        let descriptor = self
            .store
            .descriptor_by_digest(model_digest)
            .await
            .ok_or_else(|| RegistryError::UnknownModel(model_digest.to_string()))?;

        let ranked_sources: Vec<NodeId> = rank_sources(caller_zone, source_candidates).into_iter().map(|n| n.node_id.clone()).collect();

        let mut hasher = Sha256::new();
        let mut assembled_ok = true;
        for chunk_digest in &descriptor.chunks {
            match self.chunk_source.chunk_get(*chunk_digest, &ranked_sources).await {
                Ok(bytes) => hasher.update(&bytes),
                Err(err) => {
                    assembled_ok = false;
                    self.fail_pull(model_digest, target_node, &err.to_string()).await;
                    return Err(RegistryError::Fabric(err));
                }
            }
        }

        if assembled_ok {
            let manifest_digest = hasher.finalize();
            let expected = model_digest.as_bytes();
            if manifest_digest.as_slice() != expected.as_slice() {
                self.fail_pull(model_digest, target_node, "manifest digest mismatch").await;
                return Err(RegistryError::ManifestDigestMismatch);
            }
        }

        let now = wall_clock_epoch_ms();
        let mut record = PlacementRecord::pending(*model_digest, target_node.clone(), now);
        record.transition(PlacementState::Ready, now);
        self.store.upsert_placement(record).await;
        self.store.complete_task(task.id).await;
        Ok(())
    }

    async fn fail_pull(&self, model_digest: &ChunkDigest, node: &NodeId, reason: &str) {
        let now = wall_clock_epoch_ms();
        let mut record = PlacementRecord::pending(*model_digest, node.clone(), now);
        record.fail(reason, now);
        self.store.upsert_placement(record).await;
    }

    /// Advances every pending task's retry accounting. Tasks that have
    /// exhausted their retry budget are left alone (quarantined); the
    /// caller is expected to surface those via an ops event for operator
    /// attention.
    pub async fn sweep_quarantine(&self) -> Vec<TaskId> {
        let mut quarantined = Vec::new();
        for task in self.store.pending_tasks().await {
            if task.is_quarantined() {
                quarantined.push(task.id);
            } else {
                self.store.requeue_task_with_backoff(task.id).await;
            }
        }
        quarantined
    }

    fn next_task_id(&self) -> TaskId {
        TaskId::new(rand_task_seed(&self.local_node))
    }
}

/// Task IDs only need to be unique within this node's outstanding task
/// set; the store itself is the source of truth once a task is enqueued,
/// so a node-local monotonic-ish seed is sufficient.
fn rand_task_seed(local_node: &NodeId) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    local_node.hash(&mut hasher);
    wall_clock_epoch_ms().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRegistryStore;
    use nimbus_core::cluster::{ClusterMembership, MemberRecord};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct FakeChunkSource {
        chunks: Mutex<HashMap<ChunkDigest, Bytes>>,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ChunkSource for FakeChunkSource {
        async fn chunk_get(&self, digest: ChunkDigest, _holders: &[NodeId]) -> Result<Bytes, nimbus_fabric::FabricError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.chunks.lock().await.get(&digest).cloned().ok_or(nimbus_fabric::FabricError::ChunkNotFound(digest.to_string()))
        }
    }

    fn profile(id: &str, zone: &str) -> NodeProfile {
        NodeProfile {
            node_id: NodeId::new(id),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
            failure_zone: zone.into(),
            total_capacity_bytes: 1000,
            available_capacity_bytes: 1000,
            gpu_count: 1,
        }
    }

    fn member(id: &str, zone: &str) -> MemberRecord {
        MemberRecord { profile: profile(id, zone), joined_at_epoch_ms: 0, voting: true }
    }

    #[tokio::test]
    async fn register_then_locate_round_trips() {
        let store = Arc::new(InMemoryRegistryStore::new());
        let chunk_source = Arc::new(FakeChunkSource { chunks: Mutex::new(HashMap::new()), calls: AtomicU32::new(0) });
        let registry = ModelRegistry::new(store.clone(), chunk_source, PlacementPolicy::default(), NodeId::new("a"));

        let chunk = Bytes::from_static(b"weights");
        let digest = ChunkDigest::of(&chunk);
        let descriptor = ModelDescriptor { key: ModelKey::new("llama", "v1"), digest, total_size_bytes: chunk.len() as u64, chunks: vec![digest] };
        registry.register_model(descriptor).await.unwrap();

        let err = registry.locate(&ModelKey::new("llama", "v1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoReplica(_)));

        registry.request_pull(digest, NodeId::new("worker-1")).await.unwrap();
        let placements = store.placements_for(&digest).await;
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].state, PlacementState::Pending);
    }

    #[tokio::test]
    async fn execute_pull_rejects_assembled_bytes_that_do_not_match_the_model_digest() {
        let store = Arc::new(InMemoryRegistryStore::new());
        let chunk_a = Bytes::from_static(b"part-one");
        let chunk_b = Bytes::from_static(b"part-two");
        let digest_a = ChunkDigest::of(&chunk_a);
        let digest_b = ChunkDigest::of(&chunk_b);

        // A descriptor's `digest` is meant to be the manifest digest of the
        // assembled chunks; here it's deliberately set to something else so
        // the mismatch path in `execute_pull` is exercised.
        let wrong_digest = ChunkDigest::of(b"not the real manifest");

        let mut chunks = HashMap::new();
        chunks.insert(digest_a, chunk_a);
        chunks.insert(digest_b, chunk_b);
        let chunk_source = Arc::new(FakeChunkSource { chunks: Mutex::new(chunks), calls: AtomicU32::new(0) });

        let registry = ModelRegistry::new(store.clone(), chunk_source, PlacementPolicy::default(), NodeId::new("a"));
        let descriptor = ModelDescriptor {
            key: ModelKey::new("llama", "v1"),
            digest: wrong_digest,
            total_size_bytes: 16,
            chunks: vec![digest_a, digest_b],
        };
        registry.register_model(descriptor.clone()).await.unwrap();

        let task = RepairTask { id: TaskId::new(1), kind: TaskKind::Pull { model_digest: wrong_digest, target_node: NodeId::new("worker-1") }, attempt: 0, created_at_epoch_ms: 0 };
        let result = registry.execute_pull(&task, "zone-a", &[profile("holder", "zone-a")]).await;
        assert!(matches!(result, Err(RegistryError::ManifestDigestMismatch)));
    }

    #[tokio::test]
    async fn rebalance_emits_pull_for_underreplicated_model() {
        let store = Arc::new(InMemoryRegistryStore::new());
        let chunk_source = Arc::new(FakeChunkSource { chunks: Mutex::new(HashMap::new()), calls: AtomicU32::new(0) });
        let policy = PlacementPolicy { replication_factor: 2, require_zone_diversity: false };
        let registry = ModelRegistry::new(store.clone(), chunk_source, policy, NodeId::new("a"));

        let chunk = Bytes::from_static(b"weights");
        let digest = ChunkDigest::of(&chunk);
        let descriptor = ModelDescriptor { key: ModelKey::new("llama", "v1"), digest, total_size_bytes: 7, chunks: vec![digest] };
        registry.register_model(descriptor).await.unwrap();
        registry.request_pull(digest, NodeId::new("a")).await.unwrap();
        store.upsert_placement(PlacementRecord { model_digest: digest, node_id: NodeId::new("a"), state: PlacementState::Ready, updated_at_epoch_ms: 0, failure_reason: None }).await;

        let mut membership = ClusterMembership::default();
        membership.upsert(member("a", "zone-a"));
        membership.upsert(member("b", "zone-b"));

        let emitted = registry.rebalance(&membership).await.unwrap();
        assert_eq!(emitted.len(), 1);
        let placements = store.placements_for(&digest).await;
        assert!(placements.iter().any(|p| p.node_id == NodeId::new("b")));
    }

    #[tokio::test]
    async fn request_evict_rejected_when_it_would_underreplicate() {
        let store = Arc::new(InMemoryRegistryStore::new());
        let chunk_source = Arc::new(FakeChunkSource { chunks: Mutex::new(HashMap::new()), calls: AtomicU32::new(0) });
        let policy = PlacementPolicy { replication_factor: 2, require_zone_diversity: false };
        let registry = ModelRegistry::new(store.clone(), chunk_source, policy, NodeId::new("a"));
        let digest = ChunkDigest::of(b"weights");
        store.upsert_placement(PlacementRecord { model_digest: digest, node_id: NodeId::new("a"), state: PlacementState::Ready, updated_at_epoch_ms: 0, failure_reason: None }).await;
        store.upsert_placement(PlacementRecord { model_digest: digest, node_id: NodeId::new("b"), state: PlacementState::Ready, updated_at_epoch_ms: 0, failure_reason: None }).await;

        let err = registry.request_evict(digest, NodeId::new("a")).await.unwrap_err();
        assert!(matches!(err, RegistryError::WouldUnderReplicate { .. }));
    }
}
