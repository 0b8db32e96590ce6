//! Token-bucket rate limiting and fixed-capacity admission budgets,
//! shared by the scheduler's admission control and the security envelope's
//! per-principal rate limiting. Both need "is there room for one more",
//! they just spend against different resources.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::{BudgetDecision, BudgetKind, BudgetSnapshot};

/// A fixed-capacity counter: admission slots, concurrent chunk transfers.
/// Unlike the rate limiter below, there's no refill; capacity is freed
/// explicitly by dropping the returned [`BudgetLease`].
pub struct AdmissionBudget {
    kind: BudgetKind,
    capacity: u64,
    in_use: AtomicU64,
}

impl AdmissionBudget {
    pub fn new(kind: BudgetKind, capacity: u64) -> Self {
        Self { kind, capacity, in_use: AtomicU64::new(0) }
    }

    pub fn try_acquire(&self) -> Option<BudgetLease<'_>> {
        loop {
            let current = self.in_use.load(Ordering::Acquire);
            if current >= self.capacity {
                return None;
            }
            if self
                .in_use
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(BudgetLease { budget: self });
            }
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot { kind: self.kind, capacity: self.capacity, in_use: self.in_use.load(Ordering::Relaxed) }
    }
}

/// RAII lease on an [`AdmissionBudget`] slot; releases the slot on drop so
/// a panicking or canceled request never leaks capacity.
pub struct BudgetLease<'a> {
    budget: &'a AdmissionBudget,
}

impl Drop for BudgetLease<'_> {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A classic token bucket: refills continuously at `refill_rate` tokens
/// per second up to `capacity`, drained one token per admitted call.
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    pub fn check(&self, cost: f64) -> BudgetDecision {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            BudgetDecision::Granted
        } else {
            let deficit = cost - state.tokens;
            let wait_secs = if self.refill_per_second > 0.0 { deficit / self.refill_per_second } else { 1.0 };
            BudgetDecision::Denied { retry_after_ms: (wait_secs * 1000.0).ceil() as u64 }
        }
    }
}

/// Tracks consecutive rate-limit violations for one principal/IP, used to
/// escalate from throttling into a temporary ban once a threshold of
/// violations is crossed within a window.
pub struct ViolationCounter {
    count: AtomicI64,
    ban_threshold: i64,
    ban_duration: Duration,
    banned_until: Mutex<Option<Instant>>,
}

impl ViolationCounter {
    pub fn new(ban_threshold: i64, ban_duration: Duration) -> Self {
        Self {
            count: AtomicI64::new(0),
            ban_threshold,
            ban_duration,
            banned_until: Mutex::new(None),
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(*self.banned_until.lock(), Some(until) if Instant::now() < until)
    }

    /// Record a rate-limit violation; returns `true` if this violation
    /// crossed the ban threshold.
    pub fn record_violation(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.ban_threshold {
            *self.banned_until.lock() = Some(Instant::now() + self.ban_duration);
            self.count.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
        *self.banned_until.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_budget_rejects_past_capacity() {
        let budget = AdmissionBudget::new(BudgetKind::AdmissionSlots, 1);
        let _lease = budget.try_acquire().expect("first acquire succeeds");
        assert!(budget.try_acquire().is_none());
    }

    #[test]
    fn dropping_lease_frees_capacity() {
        let budget = AdmissionBudget::new(BudgetKind::AdmissionSlots, 1);
        {
            let _lease = budget.try_acquire().unwrap();
        }
        assert!(budget.try_acquire().is_some());
    }

    #[test]
    fn token_bucket_denies_when_empty() {
        let bucket = TokenBucket::new(1.0, 0.0);
        assert_eq!(bucket.check(1.0), BudgetDecision::Granted);
        assert!(matches!(bucket.check(1.0), BudgetDecision::Denied { .. }));
    }

    #[test]
    fn violation_counter_bans_past_threshold() {
        let counter = ViolationCounter::new(3, Duration::from_secs(60));
        assert!(!counter.record_violation());
        assert!(!counter.record_violation());
        assert!(counter.record_violation());
        assert!(counter.is_banned());
    }
}
