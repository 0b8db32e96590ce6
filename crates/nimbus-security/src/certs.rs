//! Local-CA certificate lifecycle for inter-node mutual TLS: renewal ahead
//! of expiry, retaining the previous certificate through one grace window
//! so a rolling restart never has a node briefly mistrusted by its peers.

use std::time::{Duration, SystemTime};

use nimbus_core::security::negotiation::CertificateLifecycle;
use parking_lot::RwLock;

/// Something that can mint a new leaf certificate from the local CA.
/// `nimbus-node` supplies the concrete `rcgen`-backed implementation; this
/// crate only drives the rotation policy.
pub trait CertificateIssuer: Send + Sync {
    fn issue(&self, validity: Duration) -> (CertificateLifecycle, Vec<u8>, Vec<u8>);
}

struct Slot {
    lifecycle: CertificateLifecycle,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

/// Holds the active certificate plus, during a rotation's grace window,
/// the previous one — so peers that haven't yet observed the new cert can
/// still complete a handshake against the old one.
pub struct CertificateRotator<I: CertificateIssuer> {
    issuer: I,
    validity: Duration,
    grace_window: Duration,
    active: RwLock<Slot>,
    previous: RwLock<Option<(Slot, SystemTime)>>,
}

impl<I: CertificateIssuer> CertificateRotator<I> {
    pub fn new(issuer: I, validity: Duration, grace_window: Duration) -> Self {
        let (lifecycle, cert_der, key_der) = issuer.issue(validity);
        Self {
            issuer,
            validity,
            grace_window,
            active: RwLock::new(Slot { lifecycle, cert_der, key_der }),
            previous: RwLock::new(None),
        }
    }

    pub fn active_cert_der(&self) -> Vec<u8> {
        self.active.read().cert_der.clone()
    }

    /// Certificates a peer's handshake may still be validated against:
    /// the active one, plus the previous one if still inside its grace
    /// window.
    pub fn trusted_cert_ders(&self, now: SystemTime) -> Vec<Vec<u8>> {
        let mut certs = vec![self.active.read().cert_der.clone()];
        if let Some((slot, expires_at)) = self.previous.read().as_ref() {
            if now < *expires_at {
                certs.push(slot.cert_der.clone());
            }
        }
        certs
    }

    /// Rotates if the active certificate needs renewal; a no-op otherwise.
    /// Returns whether a rotation happened.
    pub fn tick(&self, now: SystemTime) -> bool {
        let needs_renewal = self.active.read().lifecycle.needs_renewal(now);
        if !needs_renewal {
            return false;
        }
        let (new_lifecycle, new_cert_der, new_key_der) = self.issuer.issue(self.validity);
        let retiring = {
            let mut active = self.active.write();
            std::mem::replace(&mut *active, Slot { lifecycle: new_lifecycle, cert_der: new_cert_der, key_der: new_key_der })
        };
        *self.previous.write() = Some((retiring, now + self.grace_window));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIssuer {
        issued: std::sync::atomic::AtomicU32,
    }

    impl CertificateIssuer for FixedIssuer {
        fn issue(&self, validity: Duration) -> (CertificateLifecycle, Vec<u8>, Vec<u8>) {
            let generation = self.issued.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let now = SystemTime::now();
            let lifecycle = CertificateLifecycle { not_before: now, not_after: now + validity, issuer: "nimbus-local-ca".into() };
            (lifecycle, vec![generation as u8], vec![generation as u8])
        }
    }

    #[test]
    fn tick_does_not_rotate_a_fresh_certificate() {
        let rotator = CertificateRotator::new(FixedIssuer { issued: Default::default() }, Duration::from_secs(86400), Duration::from_secs(3600));
        assert!(!rotator.tick(SystemTime::now()));
    }

    #[test]
    fn tick_rotates_a_soon_to_expire_certificate_and_keeps_the_old_one_during_grace() {
        let rotator = CertificateRotator::new(FixedIssuer { issued: Default::default() }, Duration::from_secs(10), Duration::from_secs(3600));
        let near_expiry = SystemTime::now() + Duration::from_secs(9);
        assert!(rotator.tick(near_expiry));

        let trusted = rotator.trusted_cert_ders(near_expiry);
        assert_eq!(trusted.len(), 2);
    }

    #[test]
    fn previous_certificate_drops_out_after_grace_window() {
        let rotator = CertificateRotator::new(FixedIssuer { issued: Default::default() }, Duration::from_secs(10), Duration::from_secs(1));
        let near_expiry = SystemTime::now() + Duration::from_secs(9);
        rotator.tick(near_expiry);

        let long_after = near_expiry + Duration::from_secs(10);
        let trusted = rotator.trusted_cert_ders(long_after);
        assert_eq!(trusted.len(), 1);
    }
}
