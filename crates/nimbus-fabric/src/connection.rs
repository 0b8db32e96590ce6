//! Connection lifecycle management: opens and closes QUIC connections to
//! peers, enforcing low/high water marks so the fabric doesn't accumulate
//! an unbounded number of idle connections under high peer churn.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbus_core::ids::NodeId;
use nimbus_core::security::negotiation::NegotiatedIdentity;
use parking_lot::RwLock;

use crate::error::FabricError;

/// One live peer connection as tracked by the manager. The actual QUIC
/// `Connection` handle lives in the field the production transport layer
/// adds around this; here it's represented abstractly since
/// `nimbus-consensus`/`nimbus-registry`/`nimbus-scheduler` only need to
/// know a connection exists, not its QUIC internals.
pub struct PeerConnection {
    pub peer: NodeId,
    pub negotiated: NegotiatedIdentity,
    pub opened_at: Instant,
    pub last_active: RwLock<Instant>,
}

impl PeerConnection {
    pub fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }
}

/// Enforces `low_water <= connections <= high_water`: below `low_water`
/// the manager proactively redials known-good peers to keep the mesh
/// connected; at `high_water` new *unsolicited* connections are refused
/// until the idlest existing connection is reaped.
pub struct ConnectionManager {
    connections: RwLock<BTreeMap<NodeId, Arc<PeerConnection>>>,
    low_water: usize,
    high_water: usize,
    idle_reap_after: Duration,
}

impl ConnectionManager {
    pub fn new(low_water: usize, high_water: usize, idle_reap_after: Duration) -> Self {
        assert!(low_water <= high_water, "low water mark must not exceed high water mark");
        Self { connections: RwLock::new(BTreeMap::new()), low_water, high_water, idle_reap_after }
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_below_low_water(&self) -> bool {
        self.count() < self.low_water
    }

    pub fn get(&self, peer: &NodeId) -> Option<Arc<PeerConnection>> {
        self.connections.read().get(peer).cloned()
    }

    /// Admits a newly-established connection, reaping the idlest existing
    /// one first if already at `high_water`. Returns an error only when
    /// every existing connection is still active enough that none can be
    /// reaped to make room.
    pub fn admit(&self, conn: PeerConnection) -> Result<Arc<PeerConnection>, FabricError> {
        let mut connections = self.connections.write();
        if connections.len() >= self.high_water && !connections.contains_key(&conn.peer) {
            let idlest = connections
                .iter()
                .max_by_key(|(_, c)| c.idle_for())
                .map(|(id, c)| (id.clone(), c.idle_for()));
            match idlest {
                Some((id, idle)) if idle >= self.idle_reap_after => {
                    connections.remove(&id);
                }
                _ => {
                    return Err(FabricError::ConnectionManagerFull {
                        current: connections.len(),
                        high_water: self.high_water,
                    });
                }
            }
        }
        let arc = Arc::new(conn);
        connections.insert(arc.peer.clone(), arc.clone());
        Ok(arc)
    }

    pub fn remove(&self, peer: &NodeId) {
        self.connections.write().remove(peer);
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.connections.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> PeerConnection {
        PeerConnection {
            peer: NodeId::new(id),
            negotiated: NegotiatedIdentity {
                peer_fingerprint: format!("fp-{id}"),
                tls_version: nimbus_core::security::negotiation::TlsVersion::Tls13,
            },
            opened_at: Instant::now(),
            last_active: RwLock::new(Instant::now()),
        }
    }

    #[test]
    fn admits_connections_up_to_high_water() {
        let manager = ConnectionManager::new(1, 2, Duration::from_secs(60));
        manager.admit(conn("a")).unwrap();
        manager.admit(conn("b")).unwrap();
        assert_eq!(manager.count(), 2);
    }

    #[test]
    fn refuses_new_connection_when_full_and_nothing_idle_enough() {
        let manager = ConnectionManager::new(1, 1, Duration::from_secs(3600));
        manager.admit(conn("a")).unwrap();
        assert!(manager.admit(conn("b")).is_err());
    }

    #[test]
    fn below_low_water_is_reported() {
        let manager = ConnectionManager::new(2, 4, Duration::from_secs(60));
        assert!(manager.is_below_low_water());
        manager.admit(conn("a")).unwrap();
        manager.admit(conn("b")).unwrap();
        assert!(!manager.is_below_low_water());
    }
}
