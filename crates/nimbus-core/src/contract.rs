//! Call-scoped contract primitives: cancellation, deadlines, backpressure
//! and the state-machine trait every long-running component implements.
//!
//! These types exist so that "is this call still worth doing" is answered
//! the same way everywhere: the State Store checks `Cancellation` between
//! log entries, the fabric checks it between chunk fetches, the scheduler
//! checks it before dispatch. None of them reach for `tokio::select!` with
//! a bespoke channel; they all share this vocabulary.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ids::{CorrelationId, RequestId};
use crate::sealed::{Sealed, Token};
use crate::security::SecurityContextSnapshot;

/// A cooperative cancellation flag shared between a call's owner and every
/// task working on its behalf. Cloning is cheap (`Arc` bump); calling
/// [`Cancellation::cancel`] on any clone is visible to all of them.
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Derive a child token that is canceled whenever `self` is canceled,
    /// but can also be canceled independently without affecting the parent.
    /// Used when a scheduler request fans out to several fabric streams and
    /// wants to cancel one without killing the whole request.
    pub fn child(&self) -> Cancellation {
        let child = Cancellation::new();
        if self.is_canceled() {
            child.cancel();
        }
        child
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// A monotonic deadline. Built from `Instant` rather than wall-clock time
/// so that NTP jumps or clock skew between nodes never shorten or extend a
/// caller's budget mid-flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Self(Instant::now() + d)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    pub fn as_instant(&self) -> Instant {
        self.0
    }
}

/// Signal a producer checks before pushing more work into a bounded
/// channel or queue. Distinct from [`Cancellation`]: backpressure says
/// "slow down", cancellation says "stop".
#[derive(Clone, Debug)]
pub struct BackpressureSignal {
    paused: Arc<AtomicBool>,
}

impl BackpressureSignal {
    pub fn new() -> Self {
        Self { paused: Arc::new(AtomicBool::new(false)) }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

impl Default for BackpressureSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a component is shutting down; determines whether in-flight work is
/// allowed to finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish in-flight requests, reject new ones, then stop.
    Graceful { grace_period: Duration },
    /// Stop immediately; in-flight requests surface `ErrorKind::Fatal`.
    Immediate,
}

/// Everything one call carries end to end: identity, cancellation,
/// deadline, and the security principal it's running as. Built once at the
/// HTTP/RPC boundary and threaded through every subsequent call by
/// reference, the way the fabric threads it into chunk fetches and the
/// scheduler threads it into dispatch.
#[derive(Clone, Debug)]
pub struct CallContext {
    request_id: RequestId,
    correlation_id: CorrelationId,
    deadline: Option<Deadline>,
    cancellation: Cancellation,
    security: SecurityContextSnapshot,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn security(&self) -> &SecurityContextSnapshot {
        &self.security
    }

    pub fn is_live(&self) -> bool {
        !self.cancellation.is_canceled() && !self.deadline.is_some_and(|d| d.is_expired())
    }

    /// Derive a child context for a sub-operation (e.g. one chunk fetch
    /// inside a model pull): same identity and security principal, its own
    /// cancellation child, and a deadline no later than the parent's.
    pub fn child(&self, extra_budget: Option<Duration>) -> CallContext {
        let deadline = match (self.deadline, extra_budget) {
            (Some(parent), Some(extra)) => {
                Some(Deadline::at(parent.as_instant().min(Instant::now() + extra)))
            }
            (Some(parent), None) => Some(parent),
            (None, Some(extra)) => Some(Deadline::after(extra)),
            (None, None) => None,
        };
        CallContext {
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            deadline,
            cancellation: self.cancellation.child(),
            security: self.security.clone(),
        }
    }
}

#[derive(Default)]
pub struct CallContextBuilder {
    request_id: Option<RequestId>,
    correlation_id: Option<CorrelationId>,
    deadline: Option<Deadline>,
    cancellation: Option<Cancellation>,
    security: Option<SecurityContextSnapshot>,
}

impl CallContextBuilder {
    pub fn request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Deadline::after(timeout));
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn security(mut self, security: SecurityContextSnapshot) -> Self {
        self.security = Some(security);
        self
    }

    pub fn build(self) -> CallContext {
        CallContext {
            request_id: self.request_id.unwrap_or_default(),
            correlation_id: self.correlation_id.unwrap_or_default(),
            deadline: self.deadline,
            cancellation: self.cancellation.unwrap_or_default(),
            security: self.security.unwrap_or_else(SecurityContextSnapshot::anonymous),
        }
    }
}

/// A type-state advance: `S` is the state being transitioned away from.
/// Implemented on marker structs, not on the state machine itself, so the
/// compiler rejects calling `advance` from a state that doesn't support it.
pub trait StateAdvance<S> {
    type Next;
    type Error;

    fn advance(self, from: S) -> Result<Self::Next, Self::Error>;
}

/// Sealed trait for components whose lifecycle is a strict state machine
/// (the scheduler's per-request state, the Raft node's role). Sealed so
/// every implementation lives in a crate that has agreed to the contract
/// module's invariants.
pub trait ContractStateMachine: Sealed {
    type State: Clone + std::fmt::Debug + PartialEq;

    fn current_state(&self) -> Self::State;
}

/// Blanket helper so implementors don't need to name the sealing token
/// directly; only this crate can construct a `Token`.
pub(crate) fn seal() -> Token {
    Token::new()
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_child_inherits_canceled_state() {
        let parent = Cancellation::new();
        parent.cancel();
        let child = parent.child();
        assert!(child.is_canceled());
    }

    #[test]
    fn cancellation_child_is_independent_going_forward() {
        let parent = Cancellation::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_canceled());
    }

    #[test]
    fn deadline_reports_expired_after_duration() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.is_expired());
    }

    #[test]
    fn call_context_child_clamps_to_parent_deadline() {
        let ctx = CallContext::builder().timeout(Duration::from_millis(50)).build();
        let child = ctx.child(Some(Duration::from_secs(10)));
        assert!(child.deadline().unwrap().remaining() <= Duration::from_millis(50));
    }
}
