//! Cluster membership and service-discovery vocabulary shared by the
//! consensus, fabric and registry crates.
//!
//! `nimbus-core` fixes the shapes; the actual gossip/DHT discovery
//! mechanism lives in `nimbus-fabric`, and Raft's view of membership
//! (joint consensus during reconfiguration) lives in `nimbus-consensus`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// A resource profile advertised by a node during discovery: how much
/// capacity it has and what it currently holds, feeding both placement
/// and scheduling decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub failure_zone: String,
    pub total_capacity_bytes: u64,
    pub available_capacity_bytes: u64,
    pub gpu_count: u32,
}

impl NodeProfile {
    pub fn load_fraction(&self) -> f64 {
        if self.total_capacity_bytes == 0 {
            1.0
        } else {
            1.0 - (self.available_capacity_bytes as f64 / self.total_capacity_bytes as f64)
        }
    }
}

/// One entry in the gossiped membership table. Mirrors Raft's
/// configuration entry but adds the fabric-level fields (address, zone)
/// that Raft itself doesn't need to know about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub profile: NodeProfile,
    pub joined_at_epoch_ms: u64,
    pub voting: bool,
}

/// A point-in-time view of cluster membership, consulted by the scheduler
/// for candidate resolution and by the registry for placement.
#[derive(Clone, Debug, Default)]
pub struct ClusterMembership {
    members: BTreeMap<NodeId, MemberRecord>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: MemberRecord) {
        self.members.insert(record.profile.node_id.clone(), record);
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<MemberRecord> {
        self.members.remove(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&MemberRecord> {
        self.members.get(node_id)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values().filter(|m| m.voting)
    }

    pub fn all(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members whose `failure_zone` differs from `zone`, used by the
    /// registry to pick replication targets that satisfy zone
    /// fault-independence.
    pub fn members_outside_zone<'a>(&'a self, zone: &'a str) -> impl Iterator<Item = &'a MemberRecord> {
        self.members.values().filter(move |m| m.profile.failure_zone != zone)
    }
}

/// A membership change as observed by a gossip/DHT listener. The fabric
/// emits these; the registry and scheduler subscribe to keep their local
/// membership snapshots current without polling.
#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryEvent {
    Joined(MemberRecord),
    Updated(MemberRecord),
    Left(NodeId),
    /// The discovery channel itself is unhealthy; consumers should fall
    /// back to their last known-good snapshot rather than treat this as
    /// "the cluster shrank to zero".
    DiscoveryDegraded { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn profile(id: &str, zone: &str) -> NodeProfile {
        NodeProfile {
            node_id: NodeId::new(id),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
            failure_zone: zone.to_string(),
            total_capacity_bytes: 100,
            available_capacity_bytes: 40,
            gpu_count: 1,
        }
    }

    #[test]
    fn members_outside_zone_excludes_same_zone() {
        let mut cluster = ClusterMembership::new();
        cluster.upsert(MemberRecord { profile: profile("a", "us-east"), joined_at_epoch_ms: 0, voting: true });
        cluster.upsert(MemberRecord { profile: profile("b", "us-west"), joined_at_epoch_ms: 0, voting: true });

        let outside: Vec<_> = cluster.members_outside_zone("us-east").map(|m| m.profile.node_id.clone()).collect();
        assert_eq!(outside, vec![NodeId::new("b")]);
    }

    #[test]
    fn load_fraction_reflects_available_capacity() {
        let p = profile("a", "us-east");
        assert!((p.load_fraction() - 0.6).abs() < f64::EPSILON);
    }
}
