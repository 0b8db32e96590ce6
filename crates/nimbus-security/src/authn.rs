//! Authentication: bearer JWT (RS256), opaque API keys, and OIDC, unified
//! behind one `authenticate` entry point. Session state (pending vs.
//! active, MFA, revocation) is tracked separately in [`crate::session`].

use std::collections::HashSet;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use nimbus_core::security::Identity;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::SecurityError;

/// One bearer credential presented at ingress. The envelope never parses
/// raw header strings itself — `nimbus-node`'s HTTP layer extracts this
/// much and hands it down, keeping header-parsing details out of the
/// security crate's unit tests.
#[derive(Clone, Debug)]
pub enum Credential {
    BearerJwt(String),
    ApiKey(String),
    None,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct JwtClaims {
    sub: String,
    iss: String,
    aud: String,
    exp: u64,
}

/// Verifies RS256-signed JWTs against a fixed issuer/audience, and opaque
/// API keys against a constant-time-compared, SHA-256-hashed table (so a
/// leaked config file never exposes the literal keys).
pub struct Authenticator {
    jwt_decoding_key: Option<DecodingKey>,
    expected_issuer: String,
    expected_audience: String,
    api_key_hashes: RwLock<HashSet<String>>,
}

impl Authenticator {
    pub fn new(expected_issuer: impl Into<String>, expected_audience: impl Into<String>) -> Self {
        Self {
            jwt_decoding_key: None,
            expected_issuer: expected_issuer.into(),
            expected_audience: expected_audience.into(),
            api_key_hashes: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_rs256_public_key(mut self, pem: &[u8]) -> Result<Self, SecurityError> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| SecurityError::InvalidToken(e.to_string()))?;
        self.jwt_decoding_key = Some(key);
        Ok(self)
    }

    pub fn register_api_key(&self, key_id: &str, raw_key: &str) {
        self.api_key_hashes.write().insert(Self::fingerprint(key_id, raw_key));
    }

    fn fingerprint(key_id: &str, raw_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key_id.as_bytes());
        hasher.update(b":");
        hasher.update(raw_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn authenticate(&self, credential: &Credential) -> Result<Identity, SecurityError> {
        match credential {
            Credential::None => Ok(Identity::Anonymous),
            Credential::ApiKey(presented) => self.authenticate_api_key(presented),
            Credential::BearerJwt(token) => self.authenticate_jwt(token),
        }
    }

    fn authenticate_api_key(&self, presented: &str) -> Result<Identity, SecurityError> {
        let (key_id, raw_key) = presented
            .split_once(':')
            .ok_or_else(|| SecurityError::InvalidToken("malformed api key".into()))?;
        let candidate = Self::fingerprint(key_id, raw_key);
        let known = self.api_key_hashes.read();
        let matched = known.iter().any(|stored| {
            stored.as_bytes().ct_eq(candidate.as_bytes()).into()
        });
        if matched {
            Ok(Identity::ApiKey { key_id: key_id.to_string() })
        } else {
            Err(SecurityError::InvalidToken("unknown api key".into()))
        }
    }

    fn authenticate_jwt(&self, token: &str) -> Result<Identity, SecurityError> {
        let key = self.jwt_decoding_key.as_ref().ok_or_else(|| SecurityError::InvalidToken("no RS256 key configured".into()))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.expected_audience]);
        validation.set_issuer(&[&self.expected_issuer]);
        let data = jsonwebtoken::decode::<JwtClaims>(token, key, &validation).map_err(|e| SecurityError::InvalidToken(e.to_string()))?;
        Ok(Identity::Jwt { subject: data.claims.sub, issuer: data.claims.iss })
    }
}

/// A discovered OIDC provider's well-known endpoints. Discovery itself
/// (the HTTP round-trip to `.well-known/openid-configuration`) happens in
/// `nimbus-node`; this type is what the envelope needs once discovery has
/// already happened, plus the nonce/PKCE bookkeeping for one login flow.
#[derive(Clone, Debug)]
pub struct OidcProvider {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

#[derive(Clone, Debug)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
    pub nonce: String,
}

pub fn generate_pkce_challenge() -> PkceChallenge {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;

    let mut verifier_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut verifier_bytes);
    let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut nonce_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);

    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let code_challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    PkceChallenge { code_verifier, code_challenge, nonce }
}

pub type SharedAuthenticator = Arc<Authenticator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_credential_yields_anonymous_identity() {
        let authenticator = Authenticator::new("nimbus", "nimbus-api");
        let identity = authenticator.authenticate(&Credential::None).unwrap();
        assert_eq!(identity, Identity::Anonymous);
    }

    #[test]
    fn registered_api_key_authenticates() {
        let authenticator = Authenticator::new("nimbus", "nimbus-api");
        authenticator.register_api_key("ops-key", "s3cr3t");
        let identity = authenticator.authenticate(&Credential::ApiKey("ops-key:s3cr3t".into())).unwrap();
        assert_eq!(identity, Identity::ApiKey { key_id: "ops-key".into() });
    }

    #[test]
    fn unknown_api_key_is_rejected() {
        let authenticator = Authenticator::new("nimbus", "nimbus-api");
        authenticator.register_api_key("ops-key", "s3cr3t");
        let err = authenticator.authenticate(&Credential::ApiKey("ops-key:wrong".into())).unwrap_err();
        assert!(matches!(err, SecurityError::InvalidToken(_)));
    }

    #[test]
    fn jwt_without_configured_key_is_rejected() {
        let authenticator = Authenticator::new("nimbus", "nimbus-api");
        let err = authenticator.authenticate(&Credential::BearerJwt("whatever".into())).unwrap_err();
        assert!(matches!(err, SecurityError::InvalidToken(_)));
    }

    #[test]
    fn pkce_challenge_is_derived_from_verifier() {
        let challenge = generate_pkce_challenge();
        let mut hasher = Sha256::new();
        hasher.update(challenge.code_verifier.as_bytes());
        let expected = {
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            use base64::Engine;
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        };
        assert_eq!(challenge.code_challenge, expected);
    }
}
