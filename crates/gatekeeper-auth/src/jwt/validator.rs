//! JWT validation pipeline
//!
//! Strictly ordered, short-circuits on the first failure:
//!
//! 1. Structural parse of the compact token (three segments, JSON header and
//!    payload objects)
//! 2. Algorithm allowlist: exactly RS256. `none`, HMAC and every other
//!    algorithm are refused before any key is looked up, which blocks
//!    algorithm-substitution attacks
//! 3. Key lookup by `kid` (cache only) and signature verification
//! 4. `exp` with a fixed 10 second leeway
//! 5. `iss` exact match against the authorization server URL
//! 6. `aud` per the configured [`AudiencePolicy`]
//! 7. `scope` decoded fail-closed and checked with the [`ScopePolicy`]
//!
//! `jsonwebtoken` only checks the RS256 signature over `header.payload`.
//! Claims are decoded here from the payload segment, so every claim rule
//! above is an explicit, separately tested step.
//!
//! [`ScopePolicy`]: crate::config::ScopePolicy

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    ClaimSet, KeyResolver, VerifiedClaims, decode_audience_claim, decode_expiration,
    decode_scope_claim,
};
use crate::config::{ACCEPTED_ALGORITHM, AudiencePolicy, EXPIRATION_LEEWAY, ResourceServerConfig};
use crate::error::{AuthError, AuthResult};

/// Claims consumed by the pipeline itself; everything else lands in
/// [`VerifiedClaims::additional`]
const PIPELINE_CLAIMS: [&str; 5] = ["iss", "sub", "aud", "exp", "scope"];

/// The subset of the JOSE header the pipeline reads before verification
#[derive(Debug, Deserialize)]
struct UnverifiedHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Bearer token validator
///
/// Synchronous and side-effect free apart from logging; safe to share across
/// tasks behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use gatekeeper_auth::ResourceServerConfig;
/// use gatekeeper_auth::jwt::{StaticKeyResolver, TokenValidator};
///
/// let config = ResourceServerConfig::builder()
///     .authorization_server_url("https://auth.example.com")
///     .jwks_url("https://auth.example.com/jwks")
///     .resource_url("https://mcp.example.com")
///     .scope("rancher:resources")
///     .build();
///
/// let validator = TokenValidator::new(
///     Arc::new(config),
///     Arc::new(StaticKeyResolver::default()),
/// );
///
/// assert!(validator.validate("not-a-jwt").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct TokenValidator {
    config: Arc<ResourceServerConfig>,
    resolver: Arc<dyn KeyResolver>,
    leeway: Duration,
}

impl TokenValidator {
    /// Create a validator over a shared configuration and key resolver
    pub fn new(config: Arc<ResourceServerConfig>, resolver: Arc<dyn KeyResolver>) -> Self {
        if config.audience == AudiencePolicy::Unchecked {
            warn!(
                resource = %config.resource_url,
                "Audience check disabled: tokens issued for other resource servers will be accepted"
            );
        }

        Self {
            config,
            resolver,
            leeway: EXPIRATION_LEEWAY,
        }
    }

    /// Validate a raw bearer token against the current time
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] of the first failing pipeline step.
    pub fn validate(&self, token: &str) -> AuthResult<VerifiedClaims> {
        self.validate_at(token, SystemTime::now())
    }

    /// Validate a raw bearer token as of `now`
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] of the first failing pipeline step.
    pub fn validate_at(&self, token: &str, now: SystemTime) -> AuthResult<VerifiedClaims> {
        let (header, mut claims) = parse_compact(token)?;

        if header.alg != ACCEPTED_ALGORITHM {
            return Err(AuthError::TokenAlgorithmRejected(header.alg));
        }

        let key_id = header
            .kid
            .ok_or_else(|| AuthError::KeyNotFound("token header has no kid".into()))?;
        let key = self.resolver.resolve(&key_id)?;
        verify_signature(token, &key)?;

        let expires_at = decode_expiration(claims.get("exp"))?;
        self.check_expiration(expires_at, now)?;

        let issuer = self.check_issuer(&claims)?;
        let audience = self.check_audience(&claims)?;

        let scopes = decode_scope_claim(claims.get("scope"))?;
        self.config
            .scope_policy
            .check(&self.config.scopes_supported, &scopes)?;

        let subject = claims.get("sub").and_then(Value::as_str).map(str::to_owned);
        for name in PIPELINE_CLAIMS {
            claims.remove(name);
        }

        debug!(
            subject = ?subject,
            key_id = %key_id,
            expires_at,
            "JWT validation successful"
        );

        Ok(VerifiedClaims {
            issuer,
            subject,
            audience,
            expires_at,
            scopes,
            key_id,
            additional: claims,
        })
    }

    /// The configuration this validator enforces
    pub fn config(&self) -> &ResourceServerConfig {
        &self.config
    }

    fn check_expiration(&self, expires_at: i64, now: SystemTime) -> AuthResult<()> {
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let leeway = i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX);

        if now_secs > expires_at.saturating_add(leeway) {
            return Err(AuthError::TokenExpired(format!(
                "expired at {expires_at}, now {now_secs}, leeway {leeway}s"
            )));
        }
        Ok(())
    }

    fn check_issuer(&self, claims: &ClaimSet) -> AuthResult<String> {
        let expected = &self.config.authorization_server_url;
        match claims.get("iss").and_then(Value::as_str) {
            Some(iss) if iss == expected => Ok(iss.to_owned()),
            Some(iss) => Err(AuthError::TokenIssuerMismatch(format!(
                "expected {expected}, got {iss}"
            ))),
            None => Err(AuthError::TokenIssuerMismatch(
                "token has no string iss claim".into(),
            )),
        }
    }

    fn check_audience(&self, claims: &ClaimSet) -> AuthResult<Vec<String>> {
        match &self.config.audience {
            AudiencePolicy::Unchecked => {
                Ok(decode_audience_claim(claims.get("aud")).unwrap_or_default())
            }
            AudiencePolicy::Require(expected) => {
                let audience = decode_audience_claim(claims.get("aud"))?;
                if audience.iter().any(|aud| aud == expected) {
                    Ok(audience)
                } else {
                    Err(AuthError::TokenAudienceMismatch(format!(
                        "{expected} not in {audience:?}"
                    )))
                }
            }
        }
    }
}

/// Split a compact JWS and decode its header and payload. The signature
/// segment is left to [`verify_signature`].
fn parse_compact(token: &str) -> AuthResult<(UnverifiedHeader, ClaimSet)> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::malformed("expected three dot-separated segments"));
    };

    if header.is_empty() || payload.is_empty() {
        return Err(AuthError::malformed("empty header or payload segment"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| AuthError::malformed(format!("header is not base64url: {e}")))?;
    let header: UnverifiedHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| AuthError::malformed(format!("invalid header: {e}")))?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::malformed(format!("payload is not base64url: {e}")))?;
    let claims = serde_json::from_slice::<ClaimSet>(&payload_bytes)
        .map_err(|e| AuthError::malformed(format!("payload is not a JSON object: {e}")))?;

    Ok((header, claims))
}

/// Check the RS256 signature over the `header.payload` signing input
fn verify_signature(token: &str, key: &DecodingKey) -> AuthResult<()> {
    let Some((message, signature)) = token.rsplit_once('.') else {
        return Err(AuthError::malformed("expected three dot-separated segments"));
    };

    match jsonwebtoken::crypto::verify(signature, message.as_bytes(), key, Algorithm::RS256) {
        Ok(true) => Ok(()),
        Ok(false) => Err(AuthError::TokenSignatureInvalid(
            "signature does not match".into(),
        )),
        Err(e) => Err(AuthError::TokenSignatureInvalid(e.to_string())),
    }
}
