//! Cluster-aggregate admission control: a submission exceeding the sum of
//! every candidate node's declared concurrency is rejected with
//! `Overloaded` and a `Retry-After` hint, per §4.D.

use std::time::Duration;

use crate::candidate::NodeStatsTable;
use crate::error::SchedulerError;

/// Default backoff suggested to a caller who was rejected for being over
/// the cluster-aggregate capacity; short enough that a well-behaved
/// client's retry lands inside most requests' deadlines.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_millis(250);

pub fn check_admission(stats: &NodeStatsTable) -> Result<(), SchedulerError> {
    let capacity = stats.aggregate_capacity();
    let in_flight = stats.aggregate_in_flight();
    if capacity > 0 && in_flight >= capacity {
        return Err(SchedulerError::Overloaded { retry_after_ms: DEFAULT_RETRY_AFTER.as_millis() as u64 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::ids::NodeId;
    use nimbus_core::model::HealthReport;

    #[test]
    fn admits_when_under_capacity() {
        let stats = NodeStatsTable::new();
        stats.update(NodeId::new("a"), "zone-a".into(), 0.1, HealthReport::ready(), 4);
        assert!(check_admission(&stats).is_ok());
    }

    #[test]
    fn rejects_when_aggregate_capacity_is_exhausted() {
        let stats = NodeStatsTable::new();
        stats.update(NodeId::new("a"), "zone-a".into(), 0.1, HealthReport::ready(), 1);
        stats.mark_dispatched(&NodeId::new("a"));
        let err = check_admission(&stats).unwrap_err();
        assert!(matches!(err, SchedulerError::Overloaded { .. }));
    }
}
