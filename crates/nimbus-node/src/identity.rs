//! Loads or mints this node's stable [`NodeId`] and builds the
//! [`LocalIdentity`] the Peer Fabric presents during mutual TLS. The
//! node's identity key is a random 16-byte value persisted at
//! `identity/node.key`, hex-encoded into the `NodeId` so it stays stable
//! across restarts; a fresh value is only ever generated once, on first
//! boot of an empty data directory.

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::ids::NodeId;
use nimbus_fabric::LocalIdentity;
use rand::RngCore;

use crate::certs::LocalCertificateAuthority;
use crate::error::NodeError;
use crate::layout::{atomic_write, DataDir};

/// Validity of the leaf certificate minted for this node's fabric
/// identity; short enough that `CertificateRotator`'s renewal threshold
/// (a third of total validity) fires well before any plausible outage.
const LEAF_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(30 * 24 * 3600);

pub fn load_or_create_node_id(data_dir: &DataDir, configured: Option<&str>) -> Result<NodeId, NodeError> {
    if let Some(configured) = configured {
        if !configured.is_empty() {
            return Ok(NodeId::new(configured));
        }
    }

    let key_path = data_dir.identity_key_path();
    if key_path.exists() {
        let raw = std::fs::read(&key_path)?;
        return Ok(NodeId::new(hex::encode(raw)));
    }

    let mut seed = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut seed);
    atomic_write(&key_path, &seed)?;
    Ok(NodeId::new(hex::encode(seed)))
}

/// Builds this node's [`LocalIdentity`], issuing a fresh leaf certificate
/// from the local CA on every boot (cheap, and sidesteps tracking a
/// separate leaf-renewal schedule across restarts).
pub fn build_local_identity(ca: &Arc<LocalCertificateAuthority>, node_id: &NodeId) -> Result<LocalIdentity, NodeError> {
    let (cert_der, key_der, lifecycle) = ca.issue_leaf(node_id.as_str(), LEAF_CERTIFICATE_VALIDITY)?;
    Ok(LocalIdentity::new(node_id.clone(), cert_der, key_der, lifecycle))
}
