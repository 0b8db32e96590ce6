//! Abstraction over the State Store's view of registry metadata. Writes
//! in the real deployment go through a Raft proposal and only take effect
//! once committed and applied; `nimbus-node` supplies that adapter. Tests
//! and this crate's own unit tests use [`InMemoryRegistryStore`], which
//! applies writes immediately (as if every proposal commits instantly on
//! a single-node cluster).

use std::collections::BTreeMap;

use async_trait::async_trait;
use nimbus_core::ids::NodeId;
use nimbus_fabric::ChunkDigest;
use parking_lot::RwLock;

use crate::task::{RepairTask, TaskId};
use crate::types::{ModelDescriptor, ModelKey, PlacementRecord};

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn insert_descriptor(&self, descriptor: ModelDescriptor) -> Result<(), crate::error::RegistryError>;

    async fn descriptor_by_key(&self, key: &ModelKey) -> Option<ModelDescriptor>;

    async fn descriptor_by_digest(&self, digest: &ChunkDigest) -> Option<ModelDescriptor>;

    async fn all_descriptors(&self) -> Vec<ModelDescriptor>;

    async fn placements_for(&self, digest: &ChunkDigest) -> Vec<PlacementRecord>;

    async fn upsert_placement(&self, record: PlacementRecord);

    async fn remove_placement(&self, digest: &ChunkDigest, node: &NodeId);

    async fn enqueue_task(&self, task: RepairTask);

    async fn pending_tasks(&self) -> Vec<RepairTask>;

    async fn complete_task(&self, id: TaskId);

    async fn requeue_task_with_backoff(&self, id: TaskId);
}

#[derive(Default)]
struct Inner {
    descriptors_by_key: BTreeMap<ModelKey, ChunkDigest>,
    descriptors_by_digest: BTreeMap<ChunkDigest, ModelDescriptor>,
    placements: BTreeMap<(ChunkDigest, NodeId), PlacementRecord>,
    tasks: BTreeMap<TaskId, RepairTask>,
    next_task_id: u64,
}

pub struct InMemoryRegistryStore {
    inner: RwLock<Inner>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }

    pub fn next_task_id(&self) -> TaskId {
        let mut inner = self.inner.write();
        let id = TaskId::new(inner.next_task_id);
        inner.next_task_id += 1;
        id
    }
}

impl Default for InMemoryRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn insert_descriptor(&self, descriptor: ModelDescriptor) -> Result<(), crate::error::RegistryError> {
        let mut inner = self.inner.write();
        if let Some(existing_digest) = inner.descriptors_by_key.get(&descriptor.key).cloned() {
            if existing_digest != descriptor.digest {
                return Err(crate::error::RegistryError::DigestConflict {
                    name: descriptor.key.name.clone(),
                    version: descriptor.key.version.clone(),
                });
            }
            return Ok(());
        }
        inner.descriptors_by_key.insert(descriptor.key.clone(), descriptor.digest);
        inner.descriptors_by_digest.insert(descriptor.digest, descriptor);
        Ok(())
    }

    async fn descriptor_by_key(&self, key: &ModelKey) -> Option<ModelDescriptor> {
        let inner = self.inner.read();
        let digest = inner.descriptors_by_key.get(key)?;
        inner.descriptors_by_digest.get(digest).cloned()
    }

    async fn descriptor_by_digest(&self, digest: &ChunkDigest) -> Option<ModelDescriptor> {
        self.inner.read().descriptors_by_digest.get(digest).cloned()
    }

    async fn all_descriptors(&self) -> Vec<ModelDescriptor> {
        self.inner.read().descriptors_by_digest.values().cloned().collect()
    }

    async fn placements_for(&self, digest: &ChunkDigest) -> Vec<PlacementRecord> {
        self.inner
            .read()
            .placements
            .iter()
            .filter(|((d, _), _)| d == digest)
            .map(|(_, record)| record.clone())
            .collect()
    }

    async fn upsert_placement(&self, record: PlacementRecord) {
        let key = (record.model_digest, record.node_id.clone());
        self.inner.write().placements.insert(key, record);
    }

    async fn remove_placement(&self, digest: &ChunkDigest, node: &NodeId) {
        self.inner.write().placements.remove(&(*digest, node.clone()));
    }

    async fn enqueue_task(&self, task: RepairTask) {
        self.inner.write().tasks.insert(task.id, task);
    }

    async fn pending_tasks(&self) -> Vec<RepairTask> {
        self.inner.read().tasks.values().cloned().collect()
    }

    async fn complete_task(&self, id: TaskId) {
        self.inner.write().tasks.remove(&id);
    }

    async fn requeue_task_with_backoff(&self, id: TaskId) {
        if let Some(task) = self.inner.write().tasks.get_mut(&id) {
            task.attempt += 1;
        }
    }
}
