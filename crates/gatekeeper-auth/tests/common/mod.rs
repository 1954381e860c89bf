//! Common test utilities for integration tests
//!
//! Provides a wiremock authorization server publishing a JWKS document,
//! the RSA fixtures under `tests/fixtures/`, and token signing helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gatekeeper_auth::{KeyResolver, ResourceServerConfig, StaticKeyResolver};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

pub const ISSUER: &str = "https://auth.example.com";
pub const RESOURCE_URL: &str = "https://mcp.example.com";
pub const SCOPES: [&str; 2] = ["rancher:resources", "rancher:cluster"];
pub const METADATA_URL: &str = "https://mcp.example.com/.well-known/oauth-protected-resource";

pub const PRIMARY_KID: &str = "test-key-1";
pub const ROTATED_KID: &str = "test-key-2";
pub const PRIMARY_PEM: &[u8] = include_bytes!("../fixtures/primary-private.pem");
pub const ROTATED_PEM: &[u8] = include_bytes!("../fixtures/rotated-private.pem");

pub fn primary_jwk() -> Value {
    serde_json::from_str(include_str!("../fixtures/primary-jwk.json")).expect("Invalid fixture")
}

pub fn rotated_jwk() -> Value {
    serde_json::from_str(include_str!("../fixtures/rotated-jwk.json")).expect("Invalid fixture")
}

/// Authorization server mock publishing a key set at `/jwks`
pub struct MockAuthServer {
    pub server: MockServer,
    pub jwks_endpoint: String,
}

impl MockAuthServer {
    /// Start a mock server with nothing mounted
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let jwks_endpoint = format!("{}/jwks", server.uri());
        Self {
            server,
            jwks_endpoint,
        }
    }

    /// Serve `keys` as the key set
    pub async fn mock_jwks(&self, keys: Vec<Value>) {
        self.mount(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .await;
    }

    /// Serve `keys` after `delay`
    pub async fn mock_jwks_delayed(&self, keys: Vec<Value>, delay: Duration) {
        self.mount(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "keys": keys }))
                .set_delay(delay),
        )
        .await;
    }

    /// Answer every key set request with `status`
    pub async fn mock_jwks_status(&self, status: u16) {
        self.mount(ResponseTemplate::new(status)).await;
    }

    /// Drop every mounted response and recorded request
    pub async fn reset(&self) {
        self.server.reset().await;
    }

    /// Number of key set requests received so far
    pub async fn jwks_request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or_default()
    }

    async fn mount(&self, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }
}

/// Get current Unix timestamp
pub fn current_timestamp() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs();
    i64::try_from(secs).expect("Timestamp overflow")
}

/// Claims that pass every check, expiring `exp_offset_secs` from now
pub fn valid_claims(exp_offset_secs: i64) -> Value {
    json!({
        "iss": ISSUER,
        "sub": "user-1",
        "exp": current_timestamp() + exp_offset_secs,
        "iat": current_timestamp(),
        "scope": SCOPES.join(" "),
    })
}

/// Sign `claims` with RS256 under `kid`
pub fn sign_rs256(claims: &Value, private_pem: &[u8], kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    header.typ = Some("JWT".to_string());
    let key = EncodingKey::from_rsa_pem(private_pem).expect("Invalid RSA key");
    encode(&header, claims, &key).expect("Failed to encode test JWT")
}

/// Token signed by the primary fixture key
pub fn primary_token(claims: &Value) -> String {
    sign_rs256(claims, PRIMARY_PEM, PRIMARY_KID)
}

/// Configuration matching the fixtures, pointing at `jwks_url`
pub fn test_config(jwks_url: &str) -> ResourceServerConfig {
    ResourceServerConfig::builder()
        .authorization_server_url(ISSUER)
        .jwks_url(jwks_url)
        .resource_url(RESOURCE_URL)
        .scopes(SCOPES)
        .build()
}

/// Resolver holding only the primary fixture key
pub fn static_resolver() -> Arc<dyn KeyResolver> {
    let jwks: JwkSet =
        serde_json::from_value(json!({ "keys": [primary_jwk()] })).expect("Invalid JWKS");
    Arc::new(StaticKeyResolver::from_jwks(&jwks).expect("Unusable JWKS"))
}

/// Poll `condition` every 20ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_startup() {
        let mock = MockAuthServer::start().await;
        assert!(mock.jwks_endpoint.ends_with("/jwks"));
        assert!(mock.jwks_endpoint.starts_with("http://127.0.0.1"));
    }

    #[test]
    fn test_fixture_kids() {
        assert_eq!(primary_jwk()["kid"], PRIMARY_KID);
        assert_eq!(rotated_jwk()["kid"], ROTATED_KID);
    }
}
