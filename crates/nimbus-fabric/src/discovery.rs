//! Peer discovery over a DHT-style rendezvous mechanism: nodes publish
//! their [`MemberRecord`] under one or more rendezvous strings (cluster
//! name, failure zone, "has-gpu"), and other nodes query by rendezvous
//! string to find candidates without needing a full membership list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nimbus_core::cluster::{DiscoveryEvent, MemberRecord};
use nimbus_core::ids::NodeId;
use tokio::sync::broadcast;

use crate::error::FabricError;

#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn publish_record(&self, rendezvous: Vec<String>, record: MemberRecord) -> Result<(), FabricError>;

    async fn find_peers(&self, rendezvous: &str, limit: usize) -> Result<Vec<MemberRecord>, FabricError>;

    async fn forget(&self, node_id: &NodeId) -> Result<(), FabricError>;

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// A process-local stand-in for the DHT: good enough for integration tests
/// and single-process simulations of a cluster. The production variant
/// gossips these records over the QUIC connections opened by
/// [`crate::connection::ConnectionManager`], which this type doesn't know
/// about — discovery and connection management are deliberately decoupled.
pub struct InMemoryDiscovery {
    records: DashMap<NodeId, MemberRecord>,
    buckets: DashMap<String, Vec<NodeId>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl InMemoryDiscovery {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self { records: DashMap::new(), buckets: DashMap::new(), events })
    }
}

impl Default for InMemoryDiscovery {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { records: DashMap::new(), buckets: DashMap::new(), events }
    }
}

#[async_trait]
impl PeerDiscovery for InMemoryDiscovery {
    async fn publish_record(&self, rendezvous: Vec<String>, record: MemberRecord) -> Result<(), FabricError> {
        let node_id = record.profile.node_id.clone();
        let is_new = !self.records.contains_key(&node_id);
        self.records.insert(node_id.clone(), record.clone());
        for key in rendezvous {
            let mut bucket = self.buckets.entry(key).or_default();
            if !bucket.contains(&node_id) {
                bucket.push(node_id.clone());
            }
        }
        let event = if is_new { DiscoveryEvent::Joined(record) } else { DiscoveryEvent::Updated(record) };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn find_peers(&self, rendezvous: &str, limit: usize) -> Result<Vec<MemberRecord>, FabricError> {
        let Some(bucket) = self.buckets.get(rendezvous) else {
            return Ok(Vec::new());
        };
        Ok(bucket
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .take(limit)
            .collect())
    }

    async fn forget(&self, node_id: &NodeId) -> Result<(), FabricError> {
        self.records.remove(node_id);
        for mut bucket in self.buckets.iter_mut() {
            bucket.retain(|id| id != node_id);
        }
        let _ = self.events.send(DiscoveryEvent::Left(node_id.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

/// Groups member records by the failure zones currently represented,
/// used by the registry when picking zone-independent replication
/// targets.
pub fn group_by_zone(records: &[MemberRecord]) -> HashMap<String, Vec<&MemberRecord>> {
    let mut grouped: HashMap<String, Vec<&MemberRecord>> = HashMap::new();
    for record in records {
        grouped.entry(record.profile.failure_zone.clone()).or_default().push(record);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn record(id: &str) -> MemberRecord {
        MemberRecord {
            profile: nimbus_core::cluster::NodeProfile {
                node_id: NodeId::new(id),
                address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
                failure_zone: "zone-a".into(),
                total_capacity_bytes: 100,
                available_capacity_bytes: 50,
                gpu_count: 1,
            },
            joined_at_epoch_ms: 0,
            voting: true,
        }
    }

    #[tokio::test]
    async fn find_peers_returns_published_records() {
        let discovery = InMemoryDiscovery::new();
        discovery.publish_record(vec!["cluster-prod".into()], record("a")).await.unwrap();
        let peers = discovery.find_peers("cluster-prod", 10).await.unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn forget_removes_from_all_buckets() {
        let discovery = InMemoryDiscovery::new();
        discovery.publish_record(vec!["cluster-prod".into()], record("a")).await.unwrap();
        discovery.forget(&NodeId::new("a")).await.unwrap();
        let peers = discovery.find_peers("cluster-prod", 10).await.unwrap();
        assert!(peers.is_empty());
    }
}
