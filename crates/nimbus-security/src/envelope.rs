//! [`SecurityEnvelope`]: the facade every external ingress calls through.
//! Composes authentication, authorization, rate limiting, scanning, and
//! audit behind the five operations the spec names, so `nimbus-node`'s
//! HTTP/RPC listeners never touch the individual subsystems directly.

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::audit::{AuditOutcome, AuditRecorder};
use nimbus_core::security::{Authorization, Identity, SecurityContextSnapshot};

use crate::authn::{Authenticator, Credential};
use crate::authz::{PolicyStore, StepUpLedger};
use crate::error::SecurityError;
use crate::ratelimit::RateLimiter;
use crate::scanner::{RequestScanner, ScanVerdict};

pub struct SecurityEnvelope {
    authenticator: Authenticator,
    policy: PolicyStore,
    step_up: StepUpLedger,
    rate_limiter: RateLimiter,
    scanner: RequestScanner,
    audit: Arc<dyn AuditRecorder>,
}

impl SecurityEnvelope {
    pub fn new(
        authenticator: Authenticator,
        policy: PolicyStore,
        step_up: StepUpLedger,
        rate_limiter: RateLimiter,
        scanner: RequestScanner,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self { authenticator, policy, step_up, rate_limiter, scanner, audit }
    }

    /// `authenticate(request) -> principal | error`. Looks up each role a
    /// principal holds from `roles_for`, a thin seam so the envelope never
    /// hardcodes a role-assignment source (it comes from the State Store
    /// in `nimbus-node`, a static map in tests).
    pub async fn authenticate(&self, credential: &Credential, roles_for: impl Fn(&Identity) -> Vec<String>) -> Result<SecurityContextSnapshot, SecurityError> {
        let identity = match self.authenticator.authenticate(credential) {
            Ok(identity) => identity,
            Err(err) => {
                self.audit.record("unknown", "authenticate", AuditOutcome::Denied, Some(err.to_string())).await.ok();
                return Err(err);
            }
        };
        let roles = roles_for(&identity);
        let authorization = Authorization::new(roles);
        self.audit.record(identity.principal(), "authenticate", AuditOutcome::Allowed, None).await.ok();
        Ok(SecurityContextSnapshot::new(identity, authorization))
    }

    /// `authorize(principal, action, resource) -> allow/deny`.
    pub async fn authorize(&self, context: &SecurityContextSnapshot, action: &str, resource: &str) -> Result<(), SecurityError> {
        let freshness = self.step_up.freshness_for(context.identity().principal());
        let result = self.policy.authorize(context.authorization(), action, resource, freshness);
        let outcome = if result.is_ok() { AuditOutcome::Allowed } else { AuditOutcome::Denied };
        let detail = result.as_ref().err().map(|e: &SecurityError| e.to_string());
        self.audit.record(context.identity().principal(), action, outcome, detail).await.ok();
        result
    }

    pub fn record_step_up(&self, principal: &str) {
        self.step_up.record_step_up(principal);
    }

    /// `rate_check(principal, ip) -> allow/delay/deny`. Consults the
    /// per-principal, per-IP, and global buckets, in that order, so the
    /// first exhausted budget determines the wait hint returned to the
    /// caller.
    pub async fn rate_check(&self, principal: &str, remote_ip: &str) -> Result<(), SecurityError> {
        for key in [format!("principal:{principal}"), format!("ip:{remote_ip}"), "global".to_string()] {
            if let Err(err) = self.rate_limiter.check(&key, 1.0) {
                self.audit.record(principal, "rate_check", AuditOutcome::Denied, Some(err.to_string())).await.ok();
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn check_geo(&self, country_code: &str) -> Result<(), SecurityError> {
        self.rate_limiter.check_geo(country_code)
    }

    /// `scan(payload, role) -> clean | masked | blocked`.
    pub async fn scan(&self, principal: &str, payload: &str, role: &str) -> Result<ScanVerdict, SecurityError> {
        let verdict = self.scanner.scan(payload, role);
        match &verdict {
            ScanVerdict::Clean => {}
            ScanVerdict::Masked(_) => {
                self.audit.record(principal, "scan", AuditOutcome::Quarantined, Some("payload masked".into())).await.ok();
            }
            ScanVerdict::Blocked { rule } => {
                self.audit.record(principal, "scan", AuditOutcome::Blocked, Some(format!("rule {rule}"))).await.ok();
                return Err(SecurityError::BlockedByScan { rule: rule.clone() });
            }
        }
        Ok(verdict)
    }

    /// `record(event)` — direct audit passthrough for callers (e.g. the
    /// scheduler's admission rejection) that need to log a decision made
    /// outside the envelope's own operations.
    pub async fn record(&self, principal: &str, action: &str, outcome: AuditOutcome, detail: Option<String>) {
        self.audit.record(principal, action, outcome, detail).await.ok();
    }

    pub fn step_up_freshness_window(&self) -> Duration {
        Duration::from_secs(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::audit::InMemoryAuditRecorder;
    use std::time::Duration;

    fn envelope() -> SecurityEnvelope {
        let authenticator = Authenticator::new("nimbus", "nimbus-api");
        authenticator.register_api_key("ops", "s3cr3t");
        let policy = PolicyStore::new(vec![nimbus_core::security::PolicyRule {
            role: "operator".into(),
            action: "models.pull".into(),
            resource_pattern: "*".into(),
            effect: nimbus_core::security::PolicyEffect::Allow,
        }]);
        SecurityEnvelope::new(
            authenticator,
            policy,
            StepUpLedger::new(Duration::from_secs(300)),
            RateLimiter::new(crate::ratelimit::RateLimitConfig::default()),
            RequestScanner::with_default_rules(crate::scanner::ScanAction::Block, crate::scanner::ScanAction::Block).unwrap(),
            Arc::new(InMemoryAuditRecorder::new()),
        )
    }

    #[tokio::test]
    async fn authenticate_then_authorize_round_trips_for_a_permitted_action() {
        let envelope = envelope();
        let credential = Credential::ApiKey("ops:s3cr3t".into());
        let context = envelope.authenticate(&credential, |_| vec!["operator".to_string()]).await.unwrap();
        assert!(envelope.authorize(&context, "models.pull", "llama").await.is_ok());
    }

    #[tokio::test]
    async fn authorize_denies_an_action_with_no_matching_rule() {
        let envelope = envelope();
        let credential = Credential::ApiKey("ops:s3cr3t".into());
        let context = envelope.authenticate(&credential, |_| vec!["operator".to_string()]).await.unwrap();
        assert!(envelope.authorize(&context, "models.delete", "llama").await.is_err());
    }

    #[tokio::test]
    async fn scan_blocks_an_injection_payload() {
        let envelope = envelope();
        let err = envelope.scan("alice", "'; DROP TABLE users; --", "user").await.unwrap_err();
        assert!(matches!(err, SecurityError::BlockedByScan { .. }));
    }
}
