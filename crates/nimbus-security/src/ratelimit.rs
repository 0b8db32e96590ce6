//! Token-bucket rate limiting per (principal, remote-IP, global), with
//! persistent exponential-backoff IP bans escalating to a permanent ban
//! past a repeated-offender threshold, plus optional geo-restriction.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use nimbus_core::limits::{TokenBucket, ViolationCounter};
use nimbus_core::types::BudgetDecision;

use crate::error::SecurityError;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub burst_capacity: f64,
    pub sustained_per_second: f64,
    /// Consecutive violations before a temporary ban escalates.
    pub ban_threshold: i64,
    pub ban_duration: Duration,
    /// Number of *times banned* before a temporary ban converts permanent.
    pub permanent_ban_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 20.0,
            sustained_per_second: 5.0,
            ban_threshold: 5,
            ban_duration: Duration::from_secs(60),
            permanent_ban_threshold: 3,
        }
    }
}

struct PerKeyState {
    bucket: TokenBucket,
    violations: ViolationCounter,
    times_banned: std::sync::atomic::AtomicU32,
}

/// One rate limiter instance per scope (principal, IP, or the single
/// global bucket); the envelope owns three of these.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, PerKeyState>,
    permanent_bans: DashMap<String, ()>,
    geo_allow_list: Option<HashSet<String>>,
    geo_block_list: Option<HashSet<String>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            permanent_bans: DashMap::new(),
            geo_allow_list: None,
            geo_block_list: None,
        }
    }

    pub fn with_geo_allow_list(mut self, countries: HashSet<String>) -> Self {
        self.geo_allow_list = Some(countries);
        self
    }

    pub fn with_geo_block_list(mut self, countries: HashSet<String>) -> Self {
        self.geo_block_list = Some(countries);
        self
    }

    pub fn check_geo(&self, country_code: &str) -> Result<(), SecurityError> {
        if let Some(block) = &self.geo_block_list {
            if block.contains(country_code) {
                return Err(SecurityError::Banned);
            }
        }
        if let Some(allow) = &self.geo_allow_list {
            if !allow.contains(country_code) {
                return Err(SecurityError::Banned);
            }
        }
        Ok(())
    }

    /// Checks and spends one token from `key`'s bucket (e.g. `"principal:alice"`,
    /// `"ip:10.0.0.4"`, or `"global"`). A repeated offender who crosses the
    /// temporary-ban threshold enough times is banned permanently.
    pub fn check(&self, key: &str, cost: f64) -> Result<(), SecurityError> {
        if self.permanent_bans.contains_key(key) {
            return Err(SecurityError::Banned);
        }

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| PerKeyState {
            bucket: TokenBucket::new(self.config.burst_capacity, self.config.sustained_per_second),
            violations: ViolationCounter::new(self.config.ban_threshold, self.config.ban_duration),
            times_banned: std::sync::atomic::AtomicU32::new(0),
        });

        if entry.violations.is_banned() {
            return Err(SecurityError::Banned);
        }

        match entry.bucket.check(cost) {
            BudgetDecision::Granted => Ok(()),
            BudgetDecision::Denied { retry_after_ms } => {
                if entry.violations.record_violation() {
                    let times = entry.times_banned.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
                    if times >= self.config.permanent_ban_threshold {
                        drop(entry);
                        self.permanent_bans.insert(key.to_string(), ());
                        return Err(SecurityError::Banned);
                    }
                }
                Err(SecurityError::RateLimited { retry_after_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_config() -> RateLimitConfig {
        RateLimitConfig { burst_capacity: 1.0, sustained_per_second: 0.0, ban_threshold: 2, ban_duration: Duration::from_secs(60), permanent_ban_threshold: 2 }
    }

    #[test]
    fn grants_within_burst_then_denies() {
        let limiter = RateLimiter::new(tight_config());
        assert!(limiter.check("principal:alice", 1.0).is_ok());
        assert!(matches!(limiter.check("principal:alice", 1.0), Err(SecurityError::RateLimited { .. })));
    }

    #[test]
    fn repeated_violations_escalate_into_a_temporary_ban() {
        let limiter = RateLimiter::new(tight_config());
        limiter.check("principal:bob", 1.0).unwrap();
        // First denial: one violation recorded, below the ban threshold.
        assert!(matches!(limiter.check("principal:bob", 1.0), Err(SecurityError::RateLimited { .. })));
        // Second denial crosses ban_threshold=2: this call still reports
        // RateLimited, but it has now armed a temporary ban.
        assert!(matches!(limiter.check("principal:bob", 1.0), Err(SecurityError::RateLimited { .. })));
        // The temporary ban is active for every subsequent call.
        assert!(matches!(limiter.check("principal:bob", 1.0), Err(SecurityError::Banned)));
    }

    #[test]
    fn geo_block_list_rejects_listed_country() {
        let limiter = RateLimiter::new(RateLimitConfig::default()).with_geo_block_list(["KP".to_string()].into_iter().collect());
        assert!(limiter.check_geo("KP").is_err());
        assert!(limiter.check_geo("US").is_ok());
    }

    #[test]
    fn geo_allow_list_rejects_everything_not_listed() {
        let limiter = RateLimiter::new(RateLimitConfig::default()).with_geo_allow_list(["US".to_string()].into_iter().collect());
        assert!(limiter.check_geo("US").is_ok());
        assert!(limiter.check_geo("FR").is_err());
    }
}
