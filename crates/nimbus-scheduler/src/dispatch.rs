//! Dispatch and failover. A request is re-dispatched to the next-best
//! candidate on any failure observed before its first response byte; once a
//! first token has been observed the request is committed to that node for
//! the remainder of the stream (§4.D invariant: "A request that received
//! any response byte is never re-dispatched").

use bytes::Bytes;
use nimbus_core::ids::NodeId;
use tokio::sync::mpsc;

use crate::error::SchedulerError;
use crate::types::InferenceRequest;

/// Abstracts opening a dispatch stream to a node over the fabric, so this
/// module never touches `PeerFabric`'s transport generics directly.
#[async_trait::async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn dispatch(
        &self,
        node: &NodeId,
        request: &InferenceRequest,
    ) -> Result<mpsc::Receiver<Result<Bytes, SchedulerError>>, SchedulerError>;
}

pub struct DispatchOutcome {
    pub node: NodeId,
    pub first_token: Bytes,
    pub remaining: mpsc::Receiver<Result<Bytes, SchedulerError>>,
}

/// Walks `ranked_nodes` best-first, dispatching to each until one yields a
/// first token. Pre-first-token failures (connection refused, the peer
/// closing the stream with no bytes, a transport error) are absorbed here
/// and the next candidate is tried, provided the request still has attempt
/// and deadline budget; once any token is received, the function returns
/// committed to that node and will not be called again for this request.
pub async fn dispatch_with_failover<T: DispatchTransport>(
    transport: &T,
    request: &mut InferenceRequest,
    ranked_nodes: &[NodeId],
) -> Result<DispatchOutcome, SchedulerError> {
    let mut last_err = SchedulerError::NoReplica(request.model.to_string());

    for node in ranked_nodes {
        if request.cancellation.is_canceled() {
            return Err(SchedulerError::Canceled);
        }
        if !request.has_budget_remaining() {
            return Err(last_err);
        }
        request.attempt_count += 1;

        let mut receiver = match transport.dispatch(node, request).await {
            Ok(receiver) => receiver,
            Err(err) => {
                last_err = err;
                continue;
            }
        };

        match receiver.recv().await {
            Some(Ok(first_token)) => {
                return Ok(DispatchOutcome { node: node.clone(), first_token, remaining: receiver });
            }
            Some(Err(err)) => {
                last_err = err;
                continue;
            }
            None => {
                last_err = SchedulerError::Transient(format!("node {node} closed the stream before any token"));
                continue;
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::contract::{Cancellation, Deadline};
    use nimbus_core::ids::RequestId;
    use nimbus_core::security::SecurityContextSnapshot;
    use nimbus_registry::ModelKey;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn request() -> InferenceRequest {
        InferenceRequest {
            id: RequestId::default(),
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

    enum Behavior {
        RefuseConnection,
        CloseWithoutTokens,
        EmitToken(&'static str),
    }

    struct ScriptedTransport {
        behaviors: Mutex<HashMap<NodeId, Behavior>>,
    }

    #[async_trait::async_trait]
    impl DispatchTransport for ScriptedTransport {
        async fn dispatch(
            &self,
            node: &NodeId,
            _request: &InferenceRequest,
        ) -> Result<mpsc::Receiver<Result<Bytes, SchedulerError>>, SchedulerError> {
            let behavior = self.behaviors.lock().await.remove(node);
            match behavior {
                Some(Behavior::RefuseConnection) | None => Err(SchedulerError::Transient("refused".into())),
                Some(Behavior::CloseWithoutTokens) => {
                    let (_tx, rx) = mpsc::channel(1);
                    Ok(rx)
                }
                Some(Behavior::EmitToken(text)) => {
                    let (tx, rx) = mpsc::channel(4);
                    tx.send(Ok(Bytes::from_static(text.as_bytes()))).await.unwrap();
                    Ok(rx)
                }
            }
        }
    }

    #[tokio::test]
    async fn fails_over_to_next_candidate_on_pre_first_token_failure() {
        let mut behaviors = HashMap::new();
        behaviors.insert(NodeId::new("a"), Behavior::RefuseConnection);
        behaviors.insert(NodeId::new("b"), Behavior::EmitToken("hello"));
        let transport = ScriptedTransport { behaviors: Mutex::new(behaviors) };

        let mut req = request();
        let outcome = dispatch_with_failover(&transport, &mut req, &[NodeId::new("a"), NodeId::new("b")]).await.unwrap();
        assert_eq!(outcome.node, NodeId::new("b"));
        assert_eq!(outcome.first_token, Bytes::from_static(b"hello"));
        assert_eq!(req.attempt_count, 2);
    }

    #[tokio::test]
    async fn stream_closed_with_no_tokens_is_treated_as_failover_eligible() {
        let mut behaviors = HashMap::new();
        behaviors.insert(NodeId::new("a"), Behavior::CloseWithoutTokens);
        behaviors.insert(NodeId::new("b"), Behavior::EmitToken("ok"));
        let transport = ScriptedTransport { behaviors: Mutex::new(behaviors) };

        let mut req = request();
        let outcome = dispatch_with_failover(&transport, &mut req, &[NodeId::new("a"), NodeId::new("b")]).await.unwrap();
        assert_eq!(outcome.node, NodeId::new("b"));
    }

    #[tokio::test]
    async fn exhausting_every_candidate_surfaces_the_last_error() {
        let mut behaviors = HashMap::new();
        behaviors.insert(NodeId::new("a"), Behavior::RefuseConnection);
        behaviors.insert(NodeId::new("b"), Behavior::RefuseConnection);
        let transport = ScriptedTransport { behaviors: Mutex::new(behaviors) };

        let mut req = request();
        req.max_attempts = 10;
        let err = dispatch_with_failover(&transport, &mut req, &[NodeId::new("a"), NodeId::new("b")]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Transient(_)));
    }

    #[tokio::test]
    async fn respects_a_canceled_request_before_dispatching() {
        let transport = ScriptedTransport { behaviors: Mutex::new(HashMap::new()) };
        let mut req = request();
        req.cancellation.cancel();
        let err = dispatch_with_failover(&transport, &mut req, &[NodeId::new("a")]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Canceled));
    }
}
