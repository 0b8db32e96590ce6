//! Fetches an OIDC issuer's `.well-known/openid-configuration` document
//! and turns it into the [`OidcProvider`] the Security Envelope needs.
//! The discovery round trip itself is deliberately kept out of
//! `nimbus-security`: that crate's tests run without a network, and the
//! envelope only ever needs the resolved endpoints, never the discovery
//! mechanics.

use nimbus_security::OidcProvider;
use serde::Deserialize;

use crate::error::NodeError;

/// The subset of the discovery document (RFC 8414 / OpenID Connect
/// Discovery 1.0) this node actually uses; a real document has many more
/// fields, all ignored here via `serde`'s default "unknown fields are
/// fine" behavior.
#[derive(Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

/// Fetches `{issuer}/.well-known/openid-configuration` and validates that
/// the document's own `issuer` field matches what was requested, per the
/// OIDC spec's anti-spoofing requirement.
pub async fn discover(issuer: &str) -> Result<OidcProvider, NodeError> {
    let issuer = issuer.trim_end_matches('/');
    let discovery_url = format!("{issuer}/.well-known/openid-configuration");

    let response = reqwest::get(&discovery_url)
        .await
        .map_err(|err| NodeError::OidcDiscovery(format!("fetching {discovery_url}: {err}")))?;
    if !response.status().is_success() {
        return Err(NodeError::OidcDiscovery(format!("{discovery_url} returned {}", response.status())));
    }
    let document: DiscoveryDocument = response
        .json()
        .await
        .map_err(|err| NodeError::OidcDiscovery(format!("parsing discovery document: {err}")))?;

    if document.issuer != issuer {
        return Err(NodeError::OidcDiscovery(format!(
            "discovery document issuer {} does not match requested issuer {issuer}",
            document.issuer
        )));
    }

    Ok(OidcProvider {
        issuer: document.issuer,
        authorization_endpoint: document.authorization_endpoint,
        token_endpoint: document.token_endpoint,
        jwks_uri: document.jwks_uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_document_rejects_unknown_fields_gracefully() {
        let raw = r#"{
            "issuer": "https://issuer.example",
            "authorization_endpoint": "https://issuer.example/authorize",
            "token_endpoint": "https://issuer.example/token",
            "jwks_uri": "https://issuer.example/jwks",
            "response_types_supported": ["code"]
        }"#;
        let doc: DiscoveryDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.issuer, "https://issuer.example");
    }

    #[tokio::test]
    async fn discover_rejects_a_non_http_issuer_without_panicking() {
        let result = discover("not-a-url").await;
        assert!(result.is_err());
    }
}
