//! The concrete, `rcgen`-backed certificate authority and issuer that
//! `nimbus-security`'s [`CertificateIssuer`] trait defers to. One CA
//! keypair is generated on first boot and persisted under `certs/ca.*`;
//! every subsequent node restart reuses it so peers don't have to
//! re-trust a new root on every rolling restart.

use std::time::Duration;

use nimbus_core::security::negotiation::CertificateLifecycle;
use nimbus_security::CertificateIssuer;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::error::NodeError;
use crate::layout::{atomic_write, DataDir};

pub struct LocalCertificateAuthority {
    ca_cert_der: Vec<u8>,
    ca_key_pair: KeyPair,
    ca_cert: rcgen::Certificate,
}

impl LocalCertificateAuthority {
    /// Loads the CA from `certs/ca.{crt,key}` if present, otherwise mints
    /// a fresh self-signed root and persists it.
    pub fn load_or_create(data_dir: &DataDir) -> Result<Self, NodeError> {
        let ca_cert_path = data_dir.ca_cert_path();
        let ca_key_path = data_dir.ca_key_path();

        if ca_cert_path.exists() && ca_key_path.exists() {
            let cert_der = std::fs::read(&ca_cert_path)?;
            let key_der = std::fs::read(&ca_key_path)?;
            let key_pair = KeyPair::try_from(key_der.as_slice()).map_err(|e| NodeError::Certificate(format!("loading CA key: {e}")))?;
            let params = CertificateParams::from_ca_cert_der(&cert_der.clone().into()).map_err(|e| NodeError::Certificate(format!("parsing CA cert: {e}")))?;
            let cert = params.self_signed(&key_pair).map_err(|e| NodeError::Certificate(format!("re-deriving CA cert: {e}")))?;
            return Ok(Self { ca_cert_der: cert_der, ca_key_pair: key_pair, ca_cert: cert });
        }

        let key_pair = KeyPair::generate().map_err(|e| NodeError::Certificate(format!("generating CA key: {e}")))?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| NodeError::Certificate(format!("building CA params: {e}")))?;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "nimbus-local-ca");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).map_err(|e| NodeError::Certificate(format!("self-signing CA: {e}")))?;
        let cert_der = cert.der().to_vec();
        let key_der = key_pair.serialize_der();

        atomic_write(&ca_cert_path, &cert_der)?;
        atomic_write(&ca_key_path, &key_der)?;

        Ok(Self { ca_cert_der: cert_der, ca_key_pair: key_pair, ca_cert: cert })
    }

    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca_cert_der
    }

    /// Issues a leaf certificate for `node_id`, signed by this CA.
    pub fn issue_leaf(&self, node_id: &str, validity: Duration) -> Result<(Vec<u8>, Vec<u8>, CertificateLifecycle), NodeError> {
        let leaf_key = KeyPair::generate().map_err(|e| NodeError::Certificate(format!("generating leaf key: {e}")))?;
        let mut params = CertificateParams::new(vec![node_id.to_string()]).map_err(|e| NodeError::Certificate(format!("building leaf params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        params.distinguished_name = dn;
        let not_before = std::time::SystemTime::now();
        let not_after = not_before + validity;
        params.not_before = not_before.into();
        params.not_after = not_after.into();

        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key_pair)
            .map_err(|e| NodeError::Certificate(format!("issuing leaf cert: {e}")))?;

        let lifecycle = CertificateLifecycle { not_before, not_after, issuer: "nimbus-local-ca".to_string() };
        Ok((leaf_cert.der().to_vec(), leaf_key.serialize_der(), lifecycle))
    }
}

/// Bridges [`LocalCertificateAuthority`] to `nimbus-security`'s
/// [`CertificateIssuer`] seam, which only asks for validity and hands back
/// `(lifecycle, cert_der, key_der)`.
pub struct RcgenCertificateIssuer {
    ca: std::sync::Arc<LocalCertificateAuthority>,
    node_id: String,
}

impl RcgenCertificateIssuer {
    pub fn new(ca: std::sync::Arc<LocalCertificateAuthority>, node_id: String) -> Self {
        Self { ca, node_id }
    }
}

impl CertificateIssuer for RcgenCertificateIssuer {
    fn issue(&self, validity: Duration) -> (CertificateLifecycle, Vec<u8>, Vec<u8>) {
        // CertificateRotator's contract has no fallible path; a signing
        // failure here means the local CA material is corrupt, which is
        // unrecoverable at the process level.
        let (cert_der, key_der, lifecycle) = self
            .ca
            .issue_leaf(&self.node_id, validity)
            .expect("local CA must be able to issue a leaf certificate");
        (lifecycle, cert_der, key_der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        let ca1 = LocalCertificateAuthority::load_or_create(&data_dir).unwrap();
        let ca2 = LocalCertificateAuthority::load_or_create(&data_dir).unwrap();
        assert_eq!(ca1.ca_cert_der(), ca2.ca_cert_der());
    }

    #[test]
    fn issued_leaf_is_signed_by_the_local_ca() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        let ca = LocalCertificateAuthority::load_or_create(&data_dir).unwrap();
        let (cert_der, key_der, lifecycle) = ca.issue_leaf("node-a", Duration::from_secs(86400)).unwrap();
        assert!(!cert_der.is_empty());
        assert!(!key_der.is_empty());
        assert_eq!(lifecycle.issuer, "nimbus-local-ca");
    }
}
