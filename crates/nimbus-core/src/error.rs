//! Stable error taxonomy shared by every component in the cluster.
//!
//! The control plane deliberately narrows all failures down to the ten
//! [`ErrorKind`] variants named in the platform's error handling design:
//! each kind carries a fixed propagation rule (retry locally, surface with a
//! hint, halt the component) so that callers never need to pattern-match on
//! human text to decide what to do next.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// The stable, wire-visible error tag. Matches the `kind` field of the
/// `{"error":{"kind":...}}` envelope returned to HTTP callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A write reached a non-leader `State Store` replica.
    NotLeader,
    /// Deadline exceeded before commit or first-token emission.
    Timeout,
    /// Admission or rate limit rejected the request.
    Overloaded,
    /// Referenced model, node, or session does not exist.
    NotFound,
    /// Missing or invalid authentication.
    Unauthorized,
    /// Authenticated but insufficiently permissioned.
    Forbidden,
    /// The request scanner blocked the payload.
    BlockedByPolicy,
    /// A contested write lost a compare-and-swap race (e.g. membership).
    Conflict,
    /// Recoverable I/O or peer error; retried internally up to a cap.
    Transient,
    /// Invariant violation or corrupt state; the component halts.
    Fatal,
}

impl ErrorKind {
    /// HTTP status family this kind maps to (§7: 4xx for caller, 5xx for server).
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotLeader => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::Overloaded => 503,
            ErrorKind::NotFound => 404,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::BlockedByPolicy => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Transient => 503,
            ErrorKind::Fatal => 500,
        }
    }

    /// Whether a caller may retry this error at all, and on what rhythm.
    pub fn retry_advice(self) -> RetryAdvice {
        match self {
            ErrorKind::NotLeader => RetryAdvice::Immediate,
            ErrorKind::Timeout | ErrorKind::Transient => RetryAdvice::Backoff,
            ErrorKind::Overloaded => RetryAdvice::After(Duration::from_millis(500)),
            ErrorKind::Conflict => RetryAdvice::AfterReread,
            ErrorKind::NotFound
            | ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::BlockedByPolicy
            | ErrorKind::Fatal => RetryAdvice::Never,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotLeader => "NotLeader",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Overloaded => "Overloaded",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::BlockedByPolicy => "BlockedByPolicy",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Transient => "Transient",
            ErrorKind::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry guidance attached to an [`ErrorKind`], independent of the specific
/// failure instance. See §7 "Local recovery".
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryAdvice {
    /// Safe to retry immediately against a hinted alternate (e.g. the leader).
    Immediate,
    /// Retry with exponential backoff + jitter, capped by the caller's deadline.
    Backoff,
    /// Retry no sooner than the given duration (carries `Retry-After`).
    After(Duration),
    /// Re-read current state before retrying (optimistic concurrency).
    AfterReread,
    /// Do not retry.
    Never,
}

/// The cluster's canonical error type. Cheap to clone-by-reference via
/// `Arc` at call sites that need to fan an error out to several listeners;
/// the type itself stays a plain owned value to keep `?` ergonomic.
#[derive(Debug)]
pub struct NimbusError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    request_id: Option<String>,
    retry_after_ms: Option<u64>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl NimbusError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: None,
            retry_after_ms: None,
            source: None,
        }
    }

    pub fn not_leader(hint: Option<&str>) -> Self {
        let msg = match hint {
            Some(h) => format!("write reached a non-leader replica; leader hint: {h}"),
            None => "write reached a non-leader replica".to_string(),
        };
        Self::new(ErrorKind::NotLeader, msg)
    }

    pub fn timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn overloaded(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn blocked_by_policy(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::BlockedByPolicy, message)
    }

    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attaches the `Retry-After` hint the HTTP layer surfaces on 429/503
    /// responses (§6 "Cross-cutting").
    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        self.retry_after_ms
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Render the `{"error": {...}}` envelope mandated by §7. `request_id`
    /// falls back to `"unknown"` if none was attached at the error site.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind.as_str(),
                "message": self.message,
                "request_id": self.request_id.as_deref().unwrap_or("unknown"),
            }
        })
    }
}

impl fmt::Display for NimbusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for NimbusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T, E = NimbusError> = std::result::Result<T, E>;

/// Implemented by component-local error enums (Raft, fabric, registry...) so
/// they can be folded into the cluster-wide [`NimbusError`] at component
/// boundaries without losing their `source()` chain.
pub trait IntoNimbusError {
    fn into_nimbus_error(self) -> NimbusError;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_has_stable_shape() {
        let err = NimbusError::not_found("model llama-7b not registered").with_request_id("req-1");
        let envelope = err.to_envelope();
        assert_eq!(envelope["error"]["kind"], "NotFound");
        assert_eq!(envelope["error"]["request_id"], "req-1");
    }

    #[test]
    fn http_status_matches_caller_vs_server_split() {
        assert_eq!(ErrorKind::Unauthorized.http_status() / 100, 4);
        assert_eq!(ErrorKind::Fatal.http_status() / 100, 5);
    }
}
