//! Session lifecycle: a session starts `pending` and graduates to `active`
//! once MFA (when required) is satisfied; revocations are a TTL-indexed
//! set checked on every request so a revoked session stops working
//! immediately rather than waiting for its token to expire naturally.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nimbus_core::ids::SessionId;

use crate::error::SecurityError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
}

struct SessionEntry {
    principal: String,
    status: SessionStatus,
    expires_at: Instant,
}

/// TOTP verification window: accepts the current step and one step on
/// either side to absorb clock skew between client and server.
const TOTP_STEP_TOLERANCE: i64 = 1;

pub struct SessionStore {
    sessions: DashMap<SessionId, SessionEntry>,
    revoked: DashMap<SessionId, Instant>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: DashMap::new(), revoked: DashMap::new() }
    }

    pub fn begin_pending(&self, principal: impl Into<String>, ttl: Duration) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(id, SessionEntry { principal: principal.into(), status: SessionStatus::Pending, expires_at: Instant::now() + ttl });
        id
    }

    /// Graduates a pending session to active once its MFA challenge has
    /// been verified elsewhere (see [`verify_totp`]).
    pub fn graduate(&self, id: SessionId) -> Result<(), SecurityError> {
        let mut entry = self.sessions.get_mut(&id).ok_or_else(|| SecurityError::InvalidToken("unknown session".into()))?;
        entry.status = SessionStatus::Active;
        Ok(())
    }

    pub fn revoke(&self, id: SessionId, retain_for: Duration) {
        self.sessions.remove(&id);
        self.revoked.insert(id, Instant::now() + retain_for);
    }

    pub fn is_revoked(&self, id: SessionId) -> bool {
        self.revoked.get(&id).is_some_and(|until| Instant::now() < *until)
    }

    /// Sweeps expired entries out of the revocation set; the TTL index is
    /// only useful if it's actually bounded in size.
    pub fn sweep_revocations(&self) {
        let now = Instant::now();
        self.revoked.retain(|_, until| now < *until);
    }

    pub fn status(&self, id: SessionId) -> Result<(String, SessionStatus), SecurityError> {
        if self.is_revoked(id) {
            return Err(SecurityError::SessionRevoked(format!("{id:?}")));
        }
        let entry = self.sessions.get(&id).ok_or_else(|| SecurityError::InvalidToken("unknown session".into()))?;
        if Instant::now() >= entry.expires_at {
            return Err(SecurityError::InvalidToken("session expired".into()));
        }
        Ok((entry.principal.clone(), entry.status))
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a TOTP code against the current 30-second step, accepting
/// `TOTP_STEP_TOLERANCE` steps of clock skew in either direction. The HMAC
/// computation itself lives in `nimbus-node`'s secret-backed TOTP
/// generator; this takes the already-derived per-step codes so the
/// security crate never needs the shared secret in scope.
pub fn verify_totp(candidate: &str, valid_codes_by_step_offset: &HashMap<i64, String>) -> bool {
    (-TOTP_STEP_TOLERANCE..=TOTP_STEP_TOLERANCE).any(|offset| valid_codes_by_step_offset.get(&offset).is_some_and(|code| code == candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_session_graduates_to_active() {
        let store = SessionStore::new();
        let id = store.begin_pending("alice", Duration::from_secs(60));
        assert_eq!(store.status(id).unwrap().1, SessionStatus::Pending);
        store.graduate(id).unwrap();
        assert_eq!(store.status(id).unwrap().1, SessionStatus::Active);
    }

    #[test]
    fn revoked_session_is_immediately_rejected() {
        let store = SessionStore::new();
        let id = store.begin_pending("alice", Duration::from_secs(60));
        store.revoke(id, Duration::from_secs(60));
        assert!(matches!(store.status(id), Err(SecurityError::SessionRevoked(_))));
    }

    #[test]
    fn totp_accepts_adjacent_step_for_clock_skew() {
        let mut codes = HashMap::new();
        codes.insert(-1, "111111".to_string());
        codes.insert(0, "222222".to_string());
        codes.insert(1, "333333".to_string());
        assert!(verify_totp("111111", &codes));
        assert!(verify_totp("333333", &codes));
        assert!(!verify_totp("999999", &codes));
    }
}
