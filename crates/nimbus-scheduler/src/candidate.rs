//! Resolves the candidate set for a model: intersects the registry's
//! `locate()` result with the scheduler's live stats table, so a node
//! that's `ready` in the registry but unreachable in the fabric's
//! liveness view is simply absent rather than scored as if idle.

use std::sync::Arc;

use dashmap::DashMap;
use nimbus_core::ids::NodeId;
use nimbus_core::model::HealthReport;
use nimbus_registry::ModelKey;

use crate::error::SchedulerError;
use crate::scoring::CandidateStats;

#[async_trait::async_trait]
pub trait PlacementLookup: Send + Sync {
    async fn locate(&self, model: &ModelKey) -> Result<Vec<NodeId>, nimbus_registry::RegistryError>;
}

/// Live per-node counters refreshed by the fabric's liveness gossip and by
/// the scheduler's own in-flight table; cheap, lock-free-ish reads via
/// `DashMap`'s sharded locking.
#[derive(Default)]
pub struct NodeStatsTable {
    stats: DashMap<NodeId, LiveStats>,
}

#[derive(Clone, Debug)]
struct LiveStats {
    zone: String,
    load: f64,
    health: HealthReport,
    in_flight: u32,
    declared_concurrency: u32,
}

impl NodeStatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, node: NodeId, zone: String, load: f64, health: HealthReport, declared_concurrency: u32) {
        let mut entry = self.stats.entry(node).or_insert_with(|| LiveStats { zone: zone.clone(), load, health: health.clone(), in_flight: 0, declared_concurrency });
        entry.zone = zone;
        entry.load = load;
        entry.health = health;
        entry.declared_concurrency = declared_concurrency.max(1);
    }

    pub fn mark_dispatched(&self, node: &NodeId) {
        if let Some(mut entry) = self.stats.get_mut(node) {
            entry.in_flight += 1;
        }
    }

    pub fn mark_completed(&self, node: &NodeId) {
        if let Some(mut entry) = self.stats.get_mut(node) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    fn stats_for(&self, node: &NodeId) -> Option<CandidateStats> {
        self.stats.get(node).map(|s| CandidateStats {
            node_id: node.clone(),
            zone: s.zone.clone(),
            load: s.load,
            health: s.health.clone(),
            queue_depth: s.in_flight as f64 / s.declared_concurrency as f64,
        })
    }

    pub fn aggregate_capacity(&self) -> u32 {
        self.stats.iter().map(|s| s.declared_concurrency).sum()
    }

    pub fn aggregate_in_flight(&self) -> u32 {
        self.stats.iter().map(|s| s.in_flight).sum()
    }
}

/// Resolves `model -> candidate stats`, rejecting with `NoReplica` if the
/// registry has no ready placement (the spec's short grace period before
/// `auto_pull` kicks in is handled one layer up, by the caller retrying
/// once after triggering a pull).
pub async fn resolve_candidates<P: PlacementLookup>(
    registry: &P,
    stats: &NodeStatsTable,
    model: &ModelKey,
) -> Result<Vec<CandidateStats>, SchedulerError> {
    let nodes = registry.locate(model).await.map_err(|e| match e {
        nimbus_registry::RegistryError::NoReplica(_) => SchedulerError::NoReplica(model.to_string()),
        other => SchedulerError::Registry(other),
    })?;

    let candidates: Vec<CandidateStats> = nodes.iter().filter_map(|n| stats.stats_for(n)).collect();
    if candidates.is_empty() {
        return Err(SchedulerError::NoReplica(model.to_string()));
    }
    Ok(candidates)
}

pub type SharedStats = Arc<NodeStatsTable>;

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::model::ComponentStatus;

    struct FakeRegistry(Vec<NodeId>);

    #[async_trait::async_trait]
    impl PlacementLookup for FakeRegistry {
        async fn locate(&self, _model: &ModelKey) -> Result<Vec<NodeId>, nimbus_registry::RegistryError> {
            if self.0.is_empty() {
                Err(nimbus_registry::RegistryError::NoReplica("m".into()))
            } else {
                Ok(self.0.clone())
            }
        }
    }

    #[tokio::test]
    async fn resolve_candidates_drops_nodes_missing_from_the_stats_table() {
        let registry = FakeRegistry(vec![NodeId::new("a"), NodeId::new("b")]);
        let stats = NodeStatsTable::new();
        stats.update(NodeId::new("a"), "zone-a".into(), 0.2, HealthReport::ready(), 10);

        let resolved = resolve_candidates(&registry, &stats, &ModelKey::new("m", "v1")).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].node_id, NodeId::new("a"));
    }

    #[tokio::test]
    async fn resolve_candidates_fails_with_no_replica_when_registry_is_empty() {
        let registry = FakeRegistry(vec![]);
        let stats = NodeStatsTable::new();
        let err = resolve_candidates(&registry, &stats, &ModelKey::new("m", "v1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoReplica(_)));
    }

    #[test]
    fn queue_depth_normalizes_by_declared_concurrency() {
        let stats = NodeStatsTable::new();
        stats.update(NodeId::new("a"), "zone-a".into(), 0.1, HealthReport::ready(), 4);
        stats.mark_dispatched(&NodeId::new("a"));
        stats.mark_dispatched(&NodeId::new("a"));
        let candidate = stats.stats_for(&NodeId::new("a")).unwrap();
        assert!((candidate.queue_depth - 0.5).abs() < f64::EPSILON);
        assert!(matches!(ComponentStatus::Ready, ComponentStatus::Ready));
    }
}
