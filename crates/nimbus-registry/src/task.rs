//! Repair tasks the registry emits when desired and actual placement
//! diverge. Stored in the State Store and picked up by the owning worker.

use nimbus_core::ids::NodeId;
use nimbus_fabric::ChunkDigest;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TaskKind {
    Pull { model_digest: ChunkDigest, target_node: NodeId },
    Evict { model_digest: ChunkDigest, node: NodeId },
    Migrate { model_digest: ChunkDigest, from: NodeId, to: NodeId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepairTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub attempt: u32,
    pub created_at_epoch_ms: u64,
}

/// Exponential backoff cap before a repeatedly-failing task is quarantined
/// for operator attention rather than retried forever.
pub const MAX_TASK_ATTEMPTS: u32 = 8;

impl RepairTask {
    pub fn is_quarantined(&self) -> bool {
        self.attempt >= MAX_TASK_ATTEMPTS
    }
}
