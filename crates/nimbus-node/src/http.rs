//! The HTTP surface: `axum` routes for the eight endpoints the external
//! interface names (`/health`, `/api/models*`, `/api/generate`,
//! `/api/chat`, `/api/cluster/*`, `/metrics`), wired through the Security
//! Envelope on every route but `/health` and `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::Stream;
use nimbus_consensus::{ConfigChange, LogEntryData, LogStorage, ProposalStatus, RaftNode, RaftTransport, StateMachine};
use nimbus_core::cluster::{ClusterMembership, MemberRecord, NodeProfile};
use nimbus_core::contract::{Cancellation, Deadline};
use nimbus_core::error::{IntoNimbusError, NimbusError};
use nimbus_core::ids::{NodeId, RequestId};
use nimbus_core::security::SecurityContextSnapshot;
use nimbus_registry::{ChunkSource, ModelFilter, ModelKey, ModelRegistry, RegistryStore};
use nimbus_scheduler::{DispatchTransport, InferenceRequest, PlacementLookup, Scheduler};
use nimbus_security::{Credential, SecurityEnvelope, SecurityError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use futures::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::fabric_net::PeerAddressBook;

/// The subset of `RaftNode` the HTTP layer needs, kept object-safe so
/// `AppState` doesn't have to carry the node's own `L`/`T`/`M` type
/// parameters alongside the scheduler's and registry's.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    fn local_node(&self) -> &NodeId;
    async fn is_leader(&self) -> bool;
    async fn leader_hint(&self) -> Option<NodeId>;
    fn current_term(&self) -> u64;
    fn commit_index(&self) -> u64;
    async fn voter_count(&self) -> usize;
    async fn has_pending_reconfiguration(&self) -> bool;
    async fn propose_join(&self, node_id: NodeId) -> Result<(), NimbusError>;
}

#[async_trait]
impl<L, T, M> ClusterControl for RaftNode<L, T, M>
where
    L: LogStorage + 'static,
    T: RaftTransport + 'static,
    M: StateMachine + 'static,
{
    fn local_node(&self) -> &NodeId {
        self.id()
    }

    async fn is_leader(&self) -> bool {
        RaftNode::is_leader(self).await
    }

    async fn leader_hint(&self) -> Option<NodeId> {
        RaftNode::leader_hint(self).await
    }

    fn current_term(&self) -> u64 {
        RaftNode::current_term(self)
    }

    fn commit_index(&self) -> u64 {
        RaftNode::commit_index(self)
    }

    async fn voter_count(&self) -> usize {
        RaftNode::voter_count(self).await
    }

    async fn has_pending_reconfiguration(&self) -> bool {
        RaftNode::has_pending_reconfiguration(self).await
    }

    async fn propose_join(&self, node_id: NodeId) -> Result<(), NimbusError> {
        let proposal = self
            .propose(LogEntryData::Config(ConfigChange::AddLearner(node_id)))
            .await
            .map_err(|err| NimbusError::not_leader(None).with_source(err))?;
        match self.await_commit(proposal).await {
            ProposalStatus::Committed => Ok(()),
            other => Err(NimbusError::transient(format!("join did not commit: {other:?}"))),
        }
    }
}

pub struct AppState<P, D, RS, RC> {
    pub security: Arc<SecurityEnvelope>,
    pub scheduler: Arc<Scheduler<P, D>>,
    pub registry: Arc<ModelRegistry<RS, RC>>,
    pub cluster: Arc<RwLock<ClusterMembership>>,
    pub addresses: Arc<PeerAddressBook>,
    pub raft: Arc<dyn ClusterControl>,
}

impl<P, D, RS, RC> Clone for AppState<P, D, RS, RC> {
    fn clone(&self) -> Self {
        Self {
            security: self.security.clone(),
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
            cluster: self.cluster.clone(),
            addresses: self.addresses.clone(),
            raft: self.raft.clone(),
        }
    }
}

pub fn router<P, D, RS, RC>(state: AppState<P, D, RS, RC>) -> Router
where
    P: PlacementLookup + 'static,
    D: DispatchTransport + 'static,
    RS: RegistryStore + 'static,
    RC: ChunkSource + 'static,
{
    Router::new()
        .route("/health", get(health::<P, D, RS, RC>))
        .route("/api/models", get(list_models::<P, D, RS, RC>))
        .route("/api/models/pull", post(pull_model::<P, D, RS, RC>))
        .route("/api/generate", post(generate::<P, D, RS, RC>))
        .route("/api/chat", post(chat::<P, D, RS, RC>))
        .route("/api/cluster/status", get(cluster_status::<P, D, RS, RC>))
        .route("/api/cluster/join", post(cluster_join::<P, D, RS, RC>))
        .route("/metrics", get(metrics::<P, D, RS, RC>))
        .with_state(state)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
}

/// Wraps a [`NimbusError`] as an `axum` response: status from
/// `ErrorKind::http_status`, body the `{"error": {...}}` envelope, and a
/// `Retry-After` header when the error carries one (§6, §7).
struct ApiError(NimbusError);

impl From<NimbusError> for ApiError {
    fn from(err: NimbusError) -> Self {
        Self(err)
    }
}

impl From<SecurityError> for ApiError {
    fn from(err: SecurityError) -> Self {
        Self(err.into_nimbus_error())
    }
}

impl From<nimbus_registry::RegistryError> for ApiError {
    fn from(err: nimbus_registry::RegistryError) -> Self {
        Self(err.into_nimbus_error())
    }
}

impl From<nimbus_scheduler::SchedulerError> for ApiError {
    fn from(err: nimbus_scheduler::SchedulerError) -> Self {
        Self(err.into_nimbus_error())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self.0.to_envelope())).into_response();
        if let Some(ms) = self.0.retry_after_ms() {
            let seconds = ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Extracts the request's credential and request ID from headers, the way
/// every handler needs to before calling into the envelope. Credential
/// precedence: `Authorization: Bearer ...` first, then `X-API-Key`, else
/// anonymous (§6 cross-cutting headers).
fn extract_credential(headers: &HeaderMap) -> Credential {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Credential::BearerJwt(token.to_string());
        }
    }
    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Credential::ApiKey(api_key.to_string());
    }
    Credential::None
}

fn request_id_of(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn remote_ip_of(headers: &HeaderMap) -> String {
    headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string).unwrap_or_else(|| "unknown".to_string())
}

async fn authenticate<P, D, RS, RC>(
    state: &AppState<P, D, RS, RC>,
    headers: &HeaderMap,
) -> Result<SecurityContextSnapshot, ApiError> {
    let credential = extract_credential(headers);
    let remote_ip = remote_ip_of(headers);
    let request_id = request_id_of(headers);
    let context = state
        .security
        .authenticate(&credential, |_identity| vec!["operator".to_string()])
        .await
        .map_err(|err| ApiError(err.into_nimbus_error().with_request_id(request_id.clone())))?;
    state
        .security
        .rate_check(context.identity().principal(), &remote_ip)
        .await
        .map_err(|err| ApiError(err.into_nimbus_error().with_request_id(request_id.clone())))?;
    Ok(context)
}

async fn health<P, D, RS, RC>(State(state): State<AppState<P, D, RS, RC>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ready",
        "node_id": state.raft.local_node().to_string(),
        "is_leader": state.raft.is_leader().await,
        "term": state.raft.current_term(),
        "commit_index": state.raft.commit_index(),
        "active_nodes": state.raft.voter_count().await,
        "subsystems": {
            "consensus": true,
            "registry": true,
            "scheduler": true,
            "security": true,
        },
    }))
}

#[derive(Deserialize)]
struct ModelsQuery {
    name: Option<String>,
}

async fn list_models<P, D, RS, RC>(
    State(state): State<AppState<P, D, RS, RC>>,
    headers: HeaderMap,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    RS: RegistryStore,
    RC: ChunkSource,
{
    authenticate(&state, &headers).await?;
    let filter = ModelFilter { name: query.name, only_with_ready_replica: false };
    let summaries = state.registry.list_models(filter).await;
    Ok(Json(serde_json::json!({ "models": summaries })))
}

#[derive(Deserialize)]
struct PullRequest {
    name: String,
}

async fn pull_model<P, D, RS, RC>(
    State(state): State<AppState<P, D, RS, RC>>,
    headers: HeaderMap,
    Json(body): Json<PullRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError>
where
    RS: RegistryStore,
    RC: ChunkSource,
{
    let context = authenticate(&state, &headers).await?;
    state.security.authorize(&context, "models.pull", &body.name).await?;

    let filter = ModelFilter { name: Some(body.name.clone()), only_with_ready_replica: false };
    let summary = state
        .registry
        .list_models(filter)
        .await
        .into_iter()
        .next()
        .ok_or_else(|| NimbusError::not_found(format!("no model named {}", body.name)))?;

    let target_node = state.raft.local_node().clone();
    let task_id = state.registry.request_pull(summary.digest, target_node).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "task_id": task_id.to_string() }))))
}

#[derive(Deserialize)]
struct GenerateRequest {
    model: String,
    #[serde(default)]
    version: String,
    prompt: String,
    #[serde(default)]
    stream: bool,
    #[serde(default = "default_deadline_ms")]
    deadline_ms: u64,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[allow(dead_code)]
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    model: String,
    #[serde(default)]
    version: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default = "default_deadline_ms")]
    deadline_ms: u64,
}

fn default_deadline_ms() -> u64 {
    30_000
}

#[derive(Serialize)]
struct TokenEvent {
    token: String,
}

async fn generate<P, D, RS, RC>(
    State(state): State<AppState<P, D, RS, RC>>,
    headers: HeaderMap,
    Json(body): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError>
where
    P: PlacementLookup,
    D: DispatchTransport,
{
    let context = authenticate(&state, &headers).await?;
    state.security.authorize(&context, "inference.generate", &body.model).await?;
    let prompt = match state.security.scan(context.identity().principal(), &body.prompt, "operator").await? {
        nimbus_security::ScanVerdict::Clean => body.prompt,
        nimbus_security::ScanVerdict::Masked(masked) => masked,
        nimbus_security::ScanVerdict::Blocked { rule } => {
            return Err(ApiError(NimbusError::blocked_by_policy(format!("prompt blocked by rule {rule}"))))
        }
    };

    let request = InferenceRequest {
        id: RequestId::new(),
        security: context,
        model: ModelKey::new(body.model, body.version),
        payload: Bytes::from(prompt.into_bytes()),
        stream: body.stream,
        deadline: Deadline::after(Duration::from_millis(body.deadline_ms)),
        cancellation: Cancellation::new(),
        priority: 0,
        attempt_count: 0,
        max_attempts: 3,
    };

    let outcome = state.scheduler.submit(request).await?;
    Ok(token_stream(outcome.first_token, outcome.remaining))
}

async fn chat<P, D, RS, RC>(
    State(state): State<AppState<P, D, RS, RC>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError>
where
    P: PlacementLookup,
    D: DispatchTransport,
{
    let context = authenticate(&state, &headers).await?;
    state.security.authorize(&context, "inference.chat", &body.model).await?;

    let transcript = body.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
    let transcript = match state.security.scan(context.identity().principal(), &transcript, "operator").await? {
        nimbus_security::ScanVerdict::Clean => transcript,
        nimbus_security::ScanVerdict::Masked(masked) => masked,
        nimbus_security::ScanVerdict::Blocked { rule } => {
            return Err(ApiError(NimbusError::blocked_by_policy(format!("message blocked by rule {rule}"))))
        }
    };

    let request = InferenceRequest {
        id: RequestId::new(),
        security: context,
        model: ModelKey::new(body.model, body.version),
        payload: Bytes::from(transcript.into_bytes()),
        stream: body.stream,
        deadline: Deadline::after(Duration::from_millis(body.deadline_ms)),
        cancellation: Cancellation::new(),
        priority: 0,
        attempt_count: 0,
        max_attempts: 3,
    };

    let outcome = state.scheduler.submit(request).await?;
    Ok(token_stream(outcome.first_token, outcome.remaining))
}

/// Turns the scheduler's first-token-plus-receiver pair into an SSE
/// stream. A token that fails to decode as UTF-8 is sent as a lossy
/// string rather than dropped, since the echo backend and any future
/// backend both emit whole words, never split multi-byte sequences.
fn token_stream(first_token: Bytes, remaining: mpsc::Receiver<Result<Bytes, nimbus_scheduler::SchedulerError>>) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let first = futures::stream::once(async move { first_token });
    let rest = ReceiverStream::new(remaining).take_while(|item| futures::future::ready(item.is_ok())).map(|item| item.unwrap_or_default());
    let combined = first.chain(rest).map(|bytes| {
        let token = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Event::default().json_data(TokenEvent { token }).unwrap_or_else(|_| Event::default().data("<encoding error>")))
    });
    Sse::new(combined).keep_alive(KeepAlive::default())
}

async fn cluster_status<P, D, RS, RC>(State(state): State<AppState<P, D, RS, RC>>) -> Json<serde_json::Value> {
    let members: Vec<_> = state.cluster.read().all().cloned().collect();
    Json(serde_json::json!({
        "local_node": state.raft.local_node().to_string(),
        "is_leader": state.raft.is_leader().await,
        "leader_id": state.raft.leader_hint().await.map(|n| n.to_string()),
        "term": state.raft.current_term(),
        "commit_index": state.raft.commit_index(),
        "size": state.raft.voter_count().await,
        "pending_changes": state.raft.has_pending_reconfiguration().await,
        "members": members,
    }))
}

#[derive(Deserialize)]
struct JoinRequest {
    node_id: String,
    address: std::net::SocketAddr,
    failure_zone: String,
    total_capacity_bytes: u64,
    available_capacity_bytes: u64,
    gpu_count: u32,
}

async fn cluster_join<P, D, RS, RC>(
    State(state): State<AppState<P, D, RS, RC>>,
    headers: HeaderMap,
    Json(body): Json<JoinRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    state.security.authorize(&context, "cluster.join", &body.node_id).await?;

    let node_id = NodeId::new(body.node_id.clone());
    state.addresses.record(node_id.clone(), body.address);
    state.raft.propose_join(node_id.clone()).await?;

    let profile = NodeProfile {
        node_id: node_id.clone(),
        address: body.address,
        failure_zone: body.failure_zone,
        total_capacity_bytes: body.total_capacity_bytes,
        available_capacity_bytes: body.available_capacity_bytes,
        gpu_count: body.gpu_count,
    };
    state.cluster.write().upsert(MemberRecord { profile, joined_at_epoch_ms: nimbus_core::runtime::wall_clock_epoch_ms(), voting: false });

    Ok(Json(serde_json::json!({ "joined": node_id.to_string() })))
}

async fn metrics<P, D, RS, RC>(State(state): State<AppState<P, D, RS, RC>>) -> impl IntoResponse {
    let body = crate::observability::render_metrics(state.scheduler.stats(), state.raft.as_ref());
    ([("content-type", "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_wins_over_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        headers.insert("x-api-key", HeaderValue::from_static("ops:secret"));
        assert!(matches!(extract_credential(&headers), Credential::BearerJwt(token) if token == "abc.def.ghi"));
    }

    #[test]
    fn absent_headers_yield_anonymous_credential() {
        let headers = HeaderMap::new();
        assert!(matches!(extract_credential(&headers), Credential::None));
    }

    #[test]
    fn request_id_falls_back_to_a_generated_uuid() {
        let headers = HeaderMap::new();
        let id = request_id_of(&headers);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn request_id_echoes_an_incoming_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-123"));
        assert_eq!(request_id_of(&headers), "req-123");
    }
}
