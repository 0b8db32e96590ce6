//! The Security Envelope component: authentication, RBAC authorization,
//! rate limiting, request scanning, certificate lifecycle, and audit,
//! wrapping every external ingress point (§4.E).

mod authn;
mod authz;
mod certs;
mod envelope;
mod error;
mod ratelimit;
mod scanner;
mod session;

pub use authn::{generate_pkce_challenge, Authenticator, Credential, OidcProvider, PkceChallenge, SharedAuthenticator};
pub use authz::{PolicyStore, StepUpLedger};
pub use certs::{CertificateIssuer, CertificateRotator};
pub use envelope::SecurityEnvelope;
pub use error::SecurityError;
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use scanner::{RequestScanner, ScanAction, ScanRule, ScanVerdict};
pub use session::{verify_totp, SessionStatus, SessionStore};
