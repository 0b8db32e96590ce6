//! Candidate scoring: `score = w_load·(1−load) + w_locality·locality +
//! w_health·health − w_queue·queue_depth`. Weights default to favoring
//! load, then locality, then health, per the spec.

use nimbus_core::ids::NodeId;
use nimbus_core::model::HealthReport;

#[derive(Clone, Copy, Debug)]
pub struct ScoreWeights {
    pub w_load: f64,
    pub w_locality: f64,
    pub w_health: f64,
    pub w_queue: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { w_load: 0.4, w_locality: 0.3, w_health: 0.2, w_queue: 0.1 }
    }
}

/// A worker's current standing as observed by the scheduler, refreshed
/// from fabric liveness gossip and the node's own reported concurrency.
#[derive(Clone, Debug)]
pub struct CandidateStats {
    pub node_id: NodeId,
    pub zone: String,
    /// EWMA utilization in `[0, 1]`.
    pub load: f64,
    pub health: HealthReport,
    /// Current in-flight requests normalized by declared concurrency, in `[0, 1]`.
    pub queue_depth: f64,
}

impl CandidateStats {
    pub fn score(&self, weights: ScoreWeights, caller_zone: &str) -> f64 {
        let locality = if self.zone == caller_zone { 1.0 } else { 0.0 };
        weights.w_load * (1.0 - self.load.clamp(0.0, 1.0))
            + weights.w_locality * locality
            + weights.w_health * self.health.score()
            - weights.w_queue * self.queue_depth.clamp(0.0, 1.0)
    }
}

/// Selects the highest-scoring candidate, breaking ties by lexicographic
/// node ID (smallest wins) as the spec requires for determinism across
/// replicas that computed the same scores independently.
pub fn select_best<'a>(candidates: &'a [CandidateStats], weights: ScoreWeights, caller_zone: &str) -> Option<&'a CandidateStats> {
    candidates.iter().min_by(|a, b| {
        let a_score = a.score(weights, caller_zone);
        let b_score = b.score(weights, caller_zone);
        b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.node_id.cmp(&b.node_id))
    })
}

/// Ranks candidates best-first; used by the failover path to pick the
/// next-best target after a transient dispatch failure.
pub fn rank_candidates(candidates: &[CandidateStats], weights: ScoreWeights, caller_zone: &str) -> Vec<NodeId> {
    let mut scored: Vec<(NodeId, f64)> = candidates.iter().map(|c| (c.node_id.clone(), c.score(weights, caller_zone))).collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
    scored.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::model::{ComponentStatus, HealthReport};

    fn stats(id: &str, zone: &str, load: f64, status: ComponentStatus) -> CandidateStats {
        CandidateStats { node_id: NodeId::new(id), zone: zone.into(), load, health: HealthReport { status, message: None }, queue_depth: 0.0 }
    }

    #[test]
    fn same_zone_candidate_outranks_equal_load_remote_candidate() {
        let local = stats("a", "zone-a", 0.5, ComponentStatus::Ready);
        let remote = stats("b", "zone-b", 0.5, ComponentStatus::Ready);
        let best = select_best(&[local, remote], ScoreWeights::default(), "zone-a").unwrap();
        assert_eq!(best.node_id, NodeId::new("a"));
    }

    #[test]
    fn lower_load_wins_over_locality_at_default_weights() {
        let busy_local = stats("a", "zone-a", 0.9, ComponentStatus::Ready);
        let idle_remote = stats("b", "zone-b", 0.0, ComponentStatus::Ready);
        let best = select_best(&[busy_local, idle_remote], ScoreWeights::default(), "zone-a").unwrap();
        assert_eq!(best.node_id, NodeId::new("b"));
    }

    #[test]
    fn ties_break_by_lexicographic_node_id() {
        let a = stats("a", "zone-a", 0.5, ComponentStatus::Ready);
        let z = stats("z", "zone-a", 0.5, ComponentStatus::Ready);
        let best = select_best(&[z, a], ScoreWeights::default(), "zone-a").unwrap();
        assert_eq!(best.node_id, NodeId::new("a"));
    }
}
