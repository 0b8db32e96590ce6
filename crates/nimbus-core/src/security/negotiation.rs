//! TLS negotiation contracts shared between the fabric's connection
//! manager and the node's certificate lifecycle manager. The concrete
//! rustls/tokio-rustls wiring lives in `nimbus-fabric` and `nimbus-node`;
//! this module only fixes the vocabulary both sides agree on.

use std::time::SystemTime;

/// Minimum TLS protocol version the fabric will negotiate. The spec fixes
/// this at 1.3 for all inter-node connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsVersion {
    Tls13,
}

/// A description of a locally-issued certificate's lifecycle state, used
/// by the node's renewal loop to decide when to rotate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateLifecycle {
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub issuer: String,
}

impl CertificateLifecycle {
    /// Renewal begins once less than this fraction of the certificate's
    /// total validity window remains, matching common ACME-style clients.
    const RENEWAL_THRESHOLD: f64 = 0.33;

    pub fn total_validity(&self) -> std::time::Duration {
        self.not_after
            .duration_since(self.not_before)
            .unwrap_or_default()
    }

    pub fn remaining(&self, now: SystemTime) -> std::time::Duration {
        self.not_after.duration_since(now).unwrap_or_default()
    }

    pub fn needs_renewal(&self, now: SystemTime) -> bool {
        let total = self.total_validity().as_secs_f64();
        if total <= 0.0 {
            return true;
        }
        let remaining = self.remaining(now).as_secs_f64();
        remaining / total < Self::RENEWAL_THRESHOLD
    }
}

/// Outcome of a mutual-TLS handshake as seen from the application layer,
/// after the transport has already validated the certificate chain against
/// the cluster's local CA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiatedIdentity {
    pub peer_fingerprint: String,
    pub tls_version: TlsVersion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn needs_renewal_when_past_threshold() {
        let now = SystemTime::now();
        let cert = CertificateLifecycle {
            not_before: now - Duration::from_secs(90 * 86400),
            not_after: now + Duration::from_secs(10 * 86400),
            issuer: "nimbus-local-ca".into(),
        };
        assert!(cert.needs_renewal(now));
    }

    #[test]
    fn fresh_certificate_does_not_need_renewal() {
        let now = SystemTime::now();
        let cert = CertificateLifecycle {
            not_before: now,
            not_after: now + Duration::from_secs(90 * 86400),
            issuer: "nimbus-local-ca".into(),
        };
        assert!(!cert.needs_renewal(now));
    }
}
