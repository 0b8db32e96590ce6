//! Data model: [`ModelDescriptor`] (immutable once registered) and
//! [`PlacementRecord`] (mutable, State-Store-owned).

use nimbus_core::ids::NodeId;
use nimbus_fabric::ChunkDigest;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub name: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into() }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Immutable once registered: the content digest and chunk list are the
/// identity of this exact build of the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub key: ModelKey,
    pub digest: ChunkDigest,
    pub total_size_bytes: u64,
    pub chunks: Vec<ChunkDigest>,
}

impl ModelDescriptor {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementState {
    Pending,
    Ready,
    Evicting,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub model_digest: ChunkDigest,
    pub node_id: NodeId,
    pub state: PlacementState,
    pub updated_at_epoch_ms: u64,
    pub failure_reason: Option<String>,
}

impl PlacementRecord {
    pub fn pending(model_digest: ChunkDigest, node_id: NodeId, now_ms: u64) -> Self {
        Self { model_digest, node_id, state: PlacementState::Pending, updated_at_epoch_ms: now_ms, failure_reason: None }
    }

    pub fn is_ready(&self) -> bool {
        self.state == PlacementState::Ready
    }

    pub fn transition(&mut self, state: PlacementState, now_ms: u64) {
        self.state = state;
        self.updated_at_epoch_ms = now_ms;
        if state != PlacementState::Failed {
            self.failure_reason = None;
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now_ms: u64) {
        self.state = PlacementState::Failed;
        self.updated_at_epoch_ms = now_ms;
        self.failure_reason = Some(reason.into());
    }
}

/// A filter over `list_models`; every field left `None` is unconstrained.
#[derive(Clone, Debug, Default)]
pub struct ModelFilter {
    pub name: Option<String>,
    pub only_with_ready_replica: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSummary {
    pub key: ModelKey,
    pub digest: ChunkDigest,
    pub total_size_bytes: u64,
    pub ready_node_count: usize,
}
