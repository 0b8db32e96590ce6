//! The Scheduler component's top-level orchestrator: admission, candidate
//! resolution, scoring, and dispatch-with-failover behind `submit`/`cancel`.

use std::sync::Arc;

use dashmap::DashMap;
use nimbus_core::ids::{NodeId, RequestId};
use tracing::{info, warn};

use crate::admission::check_admission;
use crate::candidate::{resolve_candidates, NodeStatsTable, PlacementLookup};
use crate::dispatch::{dispatch_with_failover, DispatchOutcome, DispatchTransport};
use crate::error::SchedulerError;
use crate::scoring::{rank_candidates, ScoreWeights};
use crate::types::{InferenceRequest, RequestState};

pub struct SchedulerConfig {
    pub weights: ScoreWeights,
    pub local_zone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { weights: ScoreWeights::default(), local_zone: String::new() }
    }
}

/// Generic over the placement lookup and dispatch transport so this crate
/// never names `ModelRegistry<...>` or `PeerFabric<...>`'s concrete
/// transport parameters.
pub struct Scheduler<P, D> {
    registry: Arc<P>,
    dispatch: Arc<D>,
    stats: Arc<NodeStatsTable>,
    config: SchedulerConfig,
    states: DashMap<RequestId, RequestState>,
}

impl<P, D> Scheduler<P, D>
where
    P: PlacementLookup,
    D: DispatchTransport,
{
    pub fn new(registry: Arc<P>, dispatch: Arc<D>, stats: Arc<NodeStatsTable>, config: SchedulerConfig) -> Self {
        Self { registry, dispatch, stats, config, states: DashMap::new() }
    }

    pub fn stats(&self) -> &Arc<NodeStatsTable> {
        &self.stats
    }

    pub fn state_of(&self, request_id: RequestId) -> Option<RequestState> {
        self.states.get(&request_id).map(|s| *s)
    }

    fn transition(&self, request_id: RequestId, to: RequestState) -> Result<(), SchedulerError> {
        let mut entry = self.states.entry(request_id).or_insert(RequestState::New);
        let from = *entry;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(SchedulerError::IllegalTransition(crate::types::IllegalTransition { from, to }));
        }
        *entry = to;
        Ok(())
    }

    fn fail(&self, request_id: RequestId) {
        if let Some(mut entry) = self.states.get_mut(&request_id) {
            if !entry.is_terminal() {
                *entry = RequestState::Failed;
            }
        }
    }

    /// Runs one request through admission, candidate resolution, scoring,
    /// and dispatch-with-failover. Returns the first token plus the
    /// remaining stream once a node has committed to serving the request.
    pub async fn submit(&self, mut request: InferenceRequest) -> Result<DispatchOutcome, SchedulerError> {
        self.states.insert(request.id, RequestState::New);

        if !request.has_budget_remaining() {
            self.fail(request.id);
            return Err(SchedulerError::DeadlineExpired);
        }

        if let Err(err) = check_admission(&self.stats) {
            self.fail(request.id);
            return Err(err);
        }
        self.transition(request.id, RequestState::Admitted)?;

        let candidates = match resolve_candidates(self.registry.as_ref(), &self.stats, &request.model).await {
            Ok(c) => c,
            Err(err) => {
                self.fail(request.id);
                return Err(err);
            }
        };
        let ranked = rank_candidates(&candidates, self.config.weights, &self.config.local_zone);

        self.transition(request.id, RequestState::Dispatched)?;

        match dispatch_with_failover(self.dispatch.as_ref(), &mut request, &ranked).await {
            Ok(outcome) => {
                self.stats.mark_dispatched(&outcome.node);
                self.transition(request.id, RequestState::Streaming)?;
                info!(request_id = %request.id, node = %outcome.node, "request dispatched");
                Ok(outcome)
            }
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "dispatch exhausted every candidate");
                self.fail(request.id);
                Err(err)
            }
        }
    }

    /// Marks a streaming request as finished and releases its in-flight
    /// slot on the node that served it. Call once the response stream ends
    /// or errors out mid-stream (a mid-stream error is not a failover
    /// candidate — the request already committed).
    pub fn complete(&self, request_id: RequestId, node: &NodeId, succeeded: bool) {
        self.stats.mark_completed(node);
        if let Some(mut entry) = self.states.get_mut(&request_id) {
            *entry = if succeeded { RequestState::Done } else { RequestState::Failed };
        }
    }

    /// Cancels a request that has not yet reached a terminal state.
    pub fn cancel(&self, request_id: RequestId) -> Result<(), SchedulerError> {
        self.transition(request_id, RequestState::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nimbus_core::contract::{Cancellation, Deadline};
    use nimbus_core::model::HealthReport;
    use nimbus_core::security::SecurityContextSnapshot;
    use nimbus_registry::ModelKey;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FakeRegistry(Vec<NodeId>);

    #[async_trait::async_trait]
    impl PlacementLookup for FakeRegistry {
        async fn locate(&self, _model: &ModelKey) -> Result<Vec<NodeId>, nimbus_registry::RegistryError> {
            Ok(self.0.clone())
        }
    }

    struct FakeDispatch;

    #[async_trait::async_trait]
    impl DispatchTransport for FakeDispatch {
        async fn dispatch(
            &self,
            _node: &NodeId,
            _request: &InferenceRequest,
        ) -> Result<mpsc::Receiver<Result<Bytes, SchedulerError>>, SchedulerError> {
            let (tx, rx) = mpsc::channel(4);
            tx.send(Ok(Bytes::from_static(b"tok"))).await.unwrap();
            Ok(rx)
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            id: nimbus_core::ids::RequestId::new(),
            security: SecurityContextSnapshot::anonymous(),
            model: ModelKey::new("llama", "v1"),
            payload: Bytes::new(),
            stream: true,
            deadline: Deadline::after(Duration::from_secs(5)),
            cancellation: Cancellation::new(),
            priority: 0,
            attempt_count: 0,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn submit_dispatches_to_the_only_candidate_and_marks_it_in_flight() {
        let stats = Arc::new(NodeStatsTable::new());
        stats.update(NodeId::new("a"), "zone-a".into(), 0.1, HealthReport::ready(), 4);
        let scheduler = Scheduler::new(Arc::new(FakeRegistry(vec![NodeId::new("a")])), Arc::new(FakeDispatch), stats.clone(), SchedulerConfig::default());

        let req = request();
        let id = req.id;
        let outcome = scheduler.submit(req).await.unwrap();
        assert_eq!(outcome.node, NodeId::new("a"));
        assert_eq!(scheduler.state_of(id), Some(RequestState::Streaming));
        assert_eq!(stats.aggregate_in_flight(), 1);

        scheduler.complete(id, &outcome.node, true);
        assert_eq!(scheduler.state_of(id), Some(RequestState::Done));
        assert_eq!(stats.aggregate_in_flight(), 0);
    }

    #[tokio::test]
    async fn submit_fails_fast_when_no_node_hosts_the_model() {
        let stats = Arc::new(NodeStatsTable::new());
        let scheduler = Scheduler::new(Arc::new(FakeRegistry(vec![])), Arc::new(FakeDispatch), stats, SchedulerConfig::default());
        let req = request();
        let id = req.id;
        let err = scheduler.submit(req).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoReplica(_)));
        assert_eq!(scheduler.state_of(id), Some(RequestState::Failed));
    }

    #[tokio::test]
    async fn submit_rejects_a_request_whose_deadline_already_passed() {
        let stats = Arc::new(NodeStatsTable::new());
        let scheduler = Scheduler::new(Arc::new(FakeRegistry(vec![NodeId::new("a")])), Arc::new(FakeDispatch), stats, SchedulerConfig::default());
        let mut req = request();
        req.deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let err = scheduler.submit(req).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DeadlineExpired));
    }
}
