//! The fabric's notion of "who am I" and "who is this peer", backed by a
//! self-signed certificate issued from the cluster's local CA and
//! persisted under `identity/node.key` (see the node's persisted layout).

use nimbus_core::ids::NodeId;
use nimbus_core::security::negotiation::CertificateLifecycle;
use sha2::{Digest, Sha256};

/// This node's fabric identity: a stable [`NodeId`] plus the certificate
/// it presents during mutual TLS.
#[derive(Clone)]
pub struct LocalIdentity {
    node_id: NodeId,
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
    lifecycle: CertificateLifecycle,
}

impl LocalIdentity {
    pub fn new(node_id: NodeId, certificate_der: Vec<u8>, private_key_der: Vec<u8>, lifecycle: CertificateLifecycle) -> Self {
        Self { node_id, certificate_der, private_key_der, lifecycle }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    pub fn lifecycle(&self) -> &CertificateLifecycle {
        &self.lifecycle
    }

    /// Hex-encoded SHA-256 of the DER-encoded certificate, the value
    /// carried in `PeerIdentity::certificate_fingerprint` on the other end
    /// of the connection.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.certificate_der)
    }
}

pub fn fingerprint_of(certificate_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(certificate_der);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let cert = vec![1, 2, 3, 4];
        assert_eq!(fingerprint_of(&cert), fingerprint_of(&cert));
    }
}
