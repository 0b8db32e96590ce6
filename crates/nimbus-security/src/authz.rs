//! Role-based authorization: deny precedes allow, and administrative
//! actions require a recent interactive authentication (step-up) on top of
//! plain permission membership.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nimbus_core::security::{Authorization, PolicyEffect, PolicyRule, SecurityClass};
use parking_lot::RwLock;

use crate::error::SecurityError;

/// Glob-lite resource matching: `*` matches any single path segment,
/// `**` matches the remainder. Kept intentionally small; the rule set is
/// expected to be dozens of entries, not an arbitrary regex DSL.
fn resource_matches(pattern: &str, resource: &str) -> bool {
    if pattern == "*" || pattern == resource {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return resource == prefix || resource.starts_with(&format!("{prefix}/"));
    }
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let resource_parts: Vec<&str> = resource.split('/').collect();
    pattern_parts.len() == resource_parts.len()
        && pattern_parts.iter().zip(resource_parts.iter()).all(|(p, r)| *p == "*" || p == r)
}

/// Actions that require step-up authentication regardless of role, per the
/// spec's "membership change, policy change" carve-out.
fn requires_step_up(action: &str) -> bool {
    action.starts_with("cluster.membership.") || action.starts_with("policy.")
}

pub struct PolicyStore {
    rules: RwLock<Vec<PolicyRule>>,
}

impl PolicyStore {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules: RwLock::new(rules) }
    }

    pub fn replace_rules(&self, rules: Vec<PolicyRule>) {
        *self.rules.write() = rules;
    }

    /// Deny-precedes-allow: every matching deny rule short-circuits to
    /// `Denied` before any allow rule is consulted.
    fn evaluate(&self, roles: &[&str], action: &str, resource: &str) -> PolicyEffect {
        let rules = self.rules.read();
        let applicable: Vec<&PolicyRule> = rules
            .iter()
            .filter(|r| roles.contains(&r.role.as_str()) && resource_matches(&r.action, action) && resource_matches(&r.resource_pattern, resource))
            .collect();

        if applicable.iter().any(|r| r.effect == PolicyEffect::Deny) {
            return PolicyEffect::Deny;
        }
        if applicable.iter().any(|r| r.effect == PolicyEffect::Allow) {
            return PolicyEffect::Allow;
        }
        PolicyEffect::Deny
    }

    pub fn authorize(&self, authorization: &Authorization, action: &str, resource: &str, step_up_cleared_within: Option<Duration>) -> Result<(), SecurityError> {
        let roles: Vec<&str> = authorization.roles().collect();
        if self.evaluate(&roles, action, resource) != PolicyEffect::Allow {
            return Err(SecurityError::Forbidden { action: action.to_string(), resource: resource.to_string() });
        }
        if requires_step_up(action) {
            let cleared = authorization.cleared_class() == Some(SecurityClass::Admin);
            let fresh = step_up_cleared_within.is_some();
            if !cleared || !fresh {
                return Err(SecurityError::StepUpRequired);
            }
        }
        Ok(())
    }
}

/// Tracks when each principal last completed an interactive (step-up)
/// authentication, so `authorize` can require it be "recent".
pub struct StepUpLedger {
    last_cleared: RwLock<HashMap<String, Instant>>,
    freshness_window: Duration,
}

impl StepUpLedger {
    pub fn new(freshness_window: Duration) -> Self {
        Self { last_cleared: RwLock::new(HashMap::new()), freshness_window }
    }

    pub fn record_step_up(&self, principal: &str) {
        self.last_cleared.write().insert(principal.to_string(), Instant::now());
    }

    pub fn freshness_for(&self, principal: &str) -> Option<Duration> {
        let ledger = self.last_cleared.read();
        let cleared_at = ledger.get(principal)?;
        let elapsed = cleared_at.elapsed();
        (elapsed <= self.freshness_window).then_some(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::security::PolicyRule;

    fn rule(role: &str, action: &str, resource_pattern: &str, effect: PolicyEffect) -> PolicyRule {
        PolicyRule { role: role.into(), action: action.into(), resource_pattern: resource_pattern.into(), effect }
    }

    #[test]
    fn deny_rule_wins_over_matching_allow_rule() {
        let store = PolicyStore::new(vec![
            rule("operator", "models.*", "*", PolicyEffect::Allow),
            rule("operator", "models.delete", "*", PolicyEffect::Deny),
        ]);
        let auth = Authorization::new(["operator".to_string()]);
        let err = store.authorize(&auth, "models.delete", "llama", None).unwrap_err();
        assert!(matches!(err, SecurityError::Forbidden { .. }));
    }

    #[test]
    fn unmatched_action_defaults_to_denied() {
        let store = PolicyStore::new(vec![]);
        let auth = Authorization::new(["operator".to_string()]);
        assert!(store.authorize(&auth, "models.pull", "llama", None).is_err());
    }

    #[test]
    fn membership_change_requires_step_up_even_with_allow_rule() {
        let store = PolicyStore::new(vec![rule("admin", "cluster.membership.add", "*", PolicyEffect::Allow)]);
        let auth = Authorization::new(["admin".to_string()]).with_cleared_class(SecurityClass::Admin);
        assert!(store.authorize(&auth, "cluster.membership.add", "node-1", None).is_err());
        assert!(store.authorize(&auth, "cluster.membership.add", "node-1", Some(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn step_up_ledger_reports_stale_clearance_as_absent() {
        let ledger = StepUpLedger::new(Duration::from_millis(0));
        ledger.record_step_up("alice");
        std::thread::sleep(Duration::from_millis(5));
        assert!(ledger.freshness_for("alice").is_none());
    }
}
