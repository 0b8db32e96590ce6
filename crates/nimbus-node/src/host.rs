//! The composition root: wires every subsystem into one running node.
//! Nothing here contains subsystem logic; it only constructs, in
//! dependency order, and hands the result to `main.rs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nimbus_consensus::RaftNode;
use nimbus_core::cluster::ClusterMembership;
use nimbus_core::contract::Cancellation;
use nimbus_core::ids::NodeId;
use nimbus_core::runtime::TokioRuntime;
use nimbus_core::security::{PolicyEffect, PolicyRule};
use nimbus_fabric::{InMemoryDiscovery, PeerFabric, PeerFabricConfig};
use nimbus_registry::{ModelRegistry, PlacementPolicy};
use nimbus_scheduler::{NodeStatsTable, Scheduler, SchedulerConfig};
use nimbus_security::{Authenticator, PolicyStore, RateLimitConfig, RateLimiter, RequestScanner, SecurityEnvelope, StepUpLedger};
use parking_lot::RwLock;

use crate::adapters::{FabricChunkSource, FabricDispatchTransport, RegistryPlacementLookup};
use crate::certs::LocalCertificateAuthority;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::fabric_net::{FileChunkStore, PeerAddressBook, QuicTransport};
use crate::http::{self, AppState, ClusterControl};
use crate::identity::{build_local_identity, load_or_create_node_id};
use crate::layout::DataDir;
use crate::observability::FileAuditRecorder;
use crate::raft_log::FileLogStorage;
use crate::raft_transport::FabricRaftTransport;
use crate::rpc::{EchoInferenceBackend, RpcServer};
use crate::state_machine::{RaftRegistryStore, RegistryStateMachineCore, SharedStateMachine};

type Transport = FabricRaftTransport<QuicTransport, QuicTransport, FileChunkStore>;
type Fabric = PeerFabric<QuicTransport, QuicTransport, FileChunkStore>;
type RegistryStoreImpl = RaftRegistryStore<FileLogStorage, Transport>;
type ChunkSourceAdapter = FabricChunkSource<QuicTransport, QuicTransport, FileChunkStore>;
type PlacementLookupAdapter = RegistryPlacementLookup<RegistryStoreImpl, ChunkSourceAdapter>;
type DispatchAdapter = FabricDispatchTransport<QuicTransport, QuicTransport, FileChunkStore>;

/// Every long-lived handle `main.rs` needs after construction: the router
/// to serve, the Raft node to drive, and the data this process needs to
/// validate before binding a socket.
pub struct Node {
    pub config: NodeConfig,
    pub router: axum::Router,
    pub raft: RaftNode<FileLogStorage, Transport, SharedStateMachine>,
    pub quic: Arc<QuicTransport>,
}

/// Builds every component in dependency order and returns a [`Node`]
/// ready to be served. Does not bind the HTTP listener or spawn the Raft
/// driver loop; `main.rs` owns the process's actual running.
pub async fn build(config: NodeConfig) -> Result<Node, NodeError> {
    if config.bootstrap && config.join.is_some() {
        return Err(NodeError::Configuration("--bootstrap and --join are mutually exclusive".to_string()));
    }
    if !config.bootstrap && config.join.is_none() {
        return Err(NodeError::Configuration("one of --bootstrap or --join is required on first boot".to_string()));
    }

    let data_dir = DataDir::open(&config.data_dir)?;
    let node_id = load_or_create_node_id(&data_dir, if config.node_id.is_empty() { None } else { Some(config.node_id.as_str()) })?;

    let ca = Arc::new(LocalCertificateAuthority::load_or_create(&data_dir)?);
    let identity = build_local_identity(&ca, &node_id)?;

    let addresses = Arc::new(PeerAddressBook::new());
    let quic = QuicTransport::bind(config.rpc_bind, &identity, ca.ca_cert_der(), addresses.clone())?;

    let discovery = InMemoryDiscovery::new();
    let chunk_store = Arc::new(FileChunkStore::new(data_dir.clone()));
    let fabric: Arc<Fabric> = Arc::new(PeerFabric::new(
        identity,
        PeerFabricConfig { low_water: config.fabric_low_water, high_water: config.fabric_high_water, ..PeerFabricConfig::default() },
        discovery,
        quic.clone(),
        quic.clone(),
        chunk_store.clone(),
    ));
    quic.attach_registrar(fabric.clone());

    let log_storage = FileLogStorage::open(&data_dir)?;
    let raft_transport = Transport::new(fabric.clone());
    let state_core = Arc::new(RegistryStateMachineCore::new());
    let state_machine = SharedStateMachine(state_core.clone());

    // Both bootstrap and join start the local Raft log knowing only
    // itself; a joining node's membership catches up through ordinary
    // log replication once the leader commits the `AddLearner` entry
    // `cluster_join`'s HTTP handler proposes on its behalf.
    let raft = RaftNode::new(node_id.clone(), log_storage, raft_transport, state_machine, vec![node_id.clone()]);

    let rpc_server = Arc::new(RpcServer::new(raft.clone(), chunk_store.clone(), Arc::new(EchoInferenceBackend), node_id.clone()));
    quic.attach_handler(rpc_server);

    let registry_store = Arc::new(RegistryStoreImpl::new(raft.clone(), state_core));
    let chunk_source = Arc::new(ChunkSourceAdapter::new(fabric.clone()));
    let placement_policy = PlacementPolicy { replication_factor: config.replication_factor, require_zone_diversity: config.require_zone_diversity };
    let registry = Arc::new(ModelRegistry::new(registry_store, chunk_source, placement_policy, node_id.clone()));

    let stats = Arc::new(NodeStatsTable::new());
    let placement_lookup = Arc::new(PlacementLookupAdapter::new(registry.clone()));
    let dispatch_transport = Arc::new(DispatchAdapter::new(fabric.clone()));
    let scheduler_config = SchedulerConfig { weights: Default::default(), local_zone: config.scheduler_local_zone.clone() };
    let scheduler = Arc::new(Scheduler::new(placement_lookup, dispatch_transport, stats, scheduler_config));

    let audit = Arc::new(FileAuditRecorder::open(&data_dir.audit_log_path())?);
    let authenticator = Authenticator::new(config.oidc_issuer.clone().unwrap_or_default(), config.jwt_audience.clone());
    let policy = PolicyStore::new(default_policy_rules());
    let step_up = StepUpLedger::new(Duration::from_secs(15 * 60));
    let rate_limiter = RateLimiter::new(RateLimitConfig::default());
    let scanner = RequestScanner::new(Vec::new());
    let security = Arc::new(SecurityEnvelope::new(authenticator, policy, step_up, rate_limiter, scanner, audit));

    let cluster = Arc::new(RwLock::new(ClusterMembership::new()));
    let raft_control: Arc<dyn ClusterControl> = Arc::new(raft.clone());

    let state = AppState { security, scheduler, registry, cluster, addresses, raft: raft_control };
    let router = http::router(state);

    Ok(Node { config, router, raft, quic })
}

/// Default RBAC policy: every authenticated principal gets the
/// `operator` role (see `http::authenticate`), and `operator` can reach
/// every action. A deployment that needs narrower roles replaces this
/// table, not the envelope wiring around it.
fn default_policy_rules() -> Vec<PolicyRule> {
    vec![PolicyRule { role: "operator".to_string(), action: "*".to_string(), resource_pattern: "*".to_string(), effect: PolicyEffect::Allow }]
}

/// Spawns the Raft driver loop on a fresh [`TokioRuntime`] and returns a
/// [`Cancellation`] the caller can trigger to stop it.
pub fn spawn_raft_driver(raft: RaftNode<FileLogStorage, Transport, SharedStateMachine>) -> Cancellation {
    let cancellation = Cancellation::new();
    let runtime = Arc::new(TokioRuntime::new());
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        raft.run(runtime, shutdown).await;
    });
    cancellation
}

/// Sends this node's profile to an existing member's `/api/cluster/join`
/// endpoint. Only meaningful when `--join` was given; bootstrap nodes
/// never call this.
pub async fn request_join(join_target: SocketAddr, config: &NodeConfig, node_id: &NodeId) -> Result<(), NodeError> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "node_id": node_id.as_str(),
        "address": config.rpc_bind,
        "failure_zone": config.failure_zone,
        "total_capacity_bytes": 0,
        "available_capacity_bytes": 0,
        "gpu_count": 0,
    });
    let url = format!("http://{join_target}/api/cluster/join");
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|err| NodeError::Configuration(format!("join request to {url} failed: {err}")))?;
    if !response.status().is_success() {
        return Err(NodeError::Configuration(format!("join request to {url} returned {}", response.status())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlagOverrides;

    #[tokio::test]
    async fn bootstrap_and_join_together_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let overrides = FlagOverrides {
            data_dir: Some(tmp.path().to_path_buf()),
            bootstrap: true,
            join: Some("127.0.0.1:1".parse().unwrap()),
            http_bind: Some("127.0.0.1:0".parse().unwrap()),
            rpc_bind: Some("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        let config = NodeConfig::load(overrides).unwrap();
        let result = build(config).await;
        assert!(matches!(result, Err(NodeError::Configuration(_))));
    }

    #[tokio::test]
    async fn neither_bootstrap_nor_join_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let overrides = FlagOverrides {
            data_dir: Some(tmp.path().to_path_buf()),
            http_bind: Some("127.0.0.1:0".parse().unwrap()),
            rpc_bind: Some("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        let config = NodeConfig::load(overrides).unwrap();
        let result = build(config).await;
        assert!(matches!(result, Err(NodeError::Configuration(_))));
    }
}
