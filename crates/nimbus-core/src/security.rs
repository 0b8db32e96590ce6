//! Security primitives shared by every component that needs to know "who
//! is calling, and are they allowed to do this": the core identity and
//! policy vocabulary the `nimbus-security` crate builds its concrete
//! authenticator/authorizer on top of.
//!
//! `nimbus-core` only defines the shapes; it never talks to a JWKS
//! endpoint or an OIDC provider. That keeps this crate free of network
//! dependencies while still letting every other component agree on what a
//! "principal" looks like.

pub mod negotiation;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// How a caller authenticated, if at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    Anonymous,
    ApiKey { key_id: String },
    Jwt { subject: String, issuer: String },
    MutualTls { peer_fingerprint: String },
}

impl Identity {
    pub fn principal(&self) -> &str {
        match self {
            Identity::Anonymous => "anonymous",
            Identity::ApiKey { key_id } => key_id,
            Identity::Jwt { subject, .. } => subject,
            Identity::MutualTls { peer_fingerprint } => peer_fingerprint,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

/// The identity a node presents to other nodes over the fabric, distinct
/// from an HTTP caller's [`Identity`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity {
    pub node_id: String,
    pub certificate_fingerprint: String,
}

/// Named security classes a `SecurityPolicy` rule can reference, e.g.
/// `admin` requiring step-up authentication beyond plain RBAC membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityClass {
    Public,
    Authenticated,
    Admin,
}

/// One RBAC rule: does `role` get `effect` on `action` against resources
/// matching `resource_pattern`. Deny rules are always evaluated before
/// allow rules (deny-precedes-allow), so ordering within the policy's rule
/// list does not matter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub role: String,
    pub action: String,
    pub resource_pattern: String,
    pub effect: PolicyEffect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

/// An authenticated principal's roles and the minimum security class the
/// caller must have cleared via step-up auth (step-up is evaluated by
/// `nimbus-security`; this just records the outcome).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Authorization {
    roles: BTreeSet<String>,
    cleared_class: Option<SecurityClass>,
}

impl Authorization {
    pub fn new(roles: impl IntoIterator<Item = String>) -> Self {
        Self { roles: roles.into_iter().collect(), cleared_class: None }
    }

    pub fn with_cleared_class(mut self, class: SecurityClass) -> Self {
        self.cleared_class = Some(class);
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn cleared_class(&self) -> Option<SecurityClass> {
        self.cleared_class
    }
}

/// An immutable, cheap-to-clone snapshot of "who is making this call",
/// carried on [`crate::contract::CallContext`]. `allow_insecure` exists
/// only for local development/test harnesses and must never be set `true`
/// from a network-facing listener.
#[derive(Clone, Debug)]
pub struct SecurityContextSnapshot {
    identity: Arc<Identity>,
    peer_identity: Option<Arc<PeerIdentity>>,
    authorization: Arc<Authorization>,
    allow_insecure: bool,
}

impl SecurityContextSnapshot {
    pub fn anonymous() -> Self {
        Self {
            identity: Arc::new(Identity::Anonymous),
            peer_identity: None,
            authorization: Arc::new(Authorization::default()),
            allow_insecure: false,
        }
    }

    pub fn new(identity: Identity, authorization: Authorization) -> Self {
        Self {
            identity: Arc::new(identity),
            peer_identity: None,
            authorization: Arc::new(authorization),
            allow_insecure: false,
        }
    }

    pub fn with_peer_identity(mut self, peer: PeerIdentity) -> Self {
        self.peer_identity = Some(Arc::new(peer));
        self
    }

    /// Only ever set by test harnesses and local dev bootstrapping; a
    /// network listener must reject a snapshot with this flag set.
    pub fn allow_insecure_for_tests() -> Self {
        Self { allow_insecure: true, ..Self::anonymous() }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer_identity.as_deref()
    }

    pub fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    /// Returns an error if this snapshot is anonymous and insecure access
    /// was not explicitly allowed. Call sites that require authentication
    /// use this as a single gate instead of re-checking `Identity::Anonymous`.
    pub fn ensure_secure(&self) -> Result<(), crate::error::NimbusError> {
        if self.allow_insecure || !self.identity.is_anonymous() {
            Ok(())
        } else {
            Err(crate::error::NimbusError::unauthorized("authentication required"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_secure_rejects_anonymous_by_default() {
        let snap = SecurityContextSnapshot::anonymous();
        assert!(snap.ensure_secure().is_err());
    }

    #[test]
    fn ensure_secure_allows_insecure_override_for_tests() {
        let snap = SecurityContextSnapshot::allow_insecure_for_tests();
        assert!(snap.ensure_secure().is_ok());
    }

    #[test]
    fn authorization_tracks_roles() {
        let auth = Authorization::new(["operator".to_string()]);
        assert!(auth.has_role("operator"));
        assert!(!auth.has_role("admin"));
    }
}
