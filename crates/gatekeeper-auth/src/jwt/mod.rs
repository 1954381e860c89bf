//! JWT infrastructure for the resource server
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  TokenValidator (pipeline)   │
//! │  parse → alg → sig → exp →   │
//! │  iss → aud → scope           │
//! └──────────────┬───────────────┘
//!                │ resolve(kid)
//!       ┌────────┴─────────┐
//!       │   KeyResolver    │  cache-only, never blocks
//!       │ (JWKS, ArcSwap)  │◄── background refresher
//!       └──────────────────┘
//! ```
//!
//! - `jwks` - key set fetching, caching and background refresh
//! - `validator` - the validation pipeline
//!
//! Claims arrive in an untyped JSON object. Every claim the pipeline relies on
//! is pulled out through one of the explicit decoders below, which return a
//! classified [`AuthError`] on any unexpected shape.

pub mod jwks;
pub mod validator;

pub use jwks::{JwksKeyResolver, KeyResolver, StaticKeyResolver};
pub use validator::TokenValidator;

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{AuthError, AuthResult};

/// Untyped claims container as decoded from the token payload
pub type ClaimSet = Map<String, Value>;

/// Claims of a token that passed every validation step
///
/// Lives for one request; the middleware hands only the raw token downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedClaims {
    /// Issuer (`iss`), equal to the configured authorization server URL
    pub issuer: String,
    /// Subject (`sub`), if present as a string
    pub subject: Option<String>,
    /// Audience (`aud`) normalized to a list
    pub audience: Vec<String>,
    /// Expiration (`exp`) as Unix seconds
    pub expires_at: i64,
    /// Granted scopes decoded from `scope`
    pub scopes: Vec<String>,
    /// Key id (`kid`) of the verifying key
    pub key_id: String,
    /// All other claims
    pub additional: ClaimSet,
}

impl VerifiedClaims {
    /// Whether the token grants `scope`
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Expiration as a [`SystemTime`]
    #[must_use]
    pub fn expires_at_time(&self) -> SystemTime {
        let secs = u64::try_from(self.expires_at).unwrap_or(0);
        UNIX_EPOCH + Duration::from_secs(secs)
    }
}

/// Decode `exp` into Unix seconds.
///
/// Integral and fractional JSON numbers are accepted (RFC 7519 NumericDate);
/// fractions are truncated.
pub(crate) fn decode_expiration(value: Option<&Value>) -> AuthResult<i64> {
    let value = value.ok_or_else(|| AuthError::TokenExpired("token has no exp claim".into()))?;

    let Value::Number(number) = value else {
        return Err(AuthError::TokenExpired(format!(
            "exp claim is not a number: {}",
            json_type(value)
        )));
    };

    if let Some(secs) = number.as_i64() {
        return Ok(secs);
    }

    match number.as_f64() {
        Some(secs) if secs.is_finite() && secs.abs() < i64::MAX as f64 => Ok(secs.trunc() as i64),
        _ => Err(AuthError::TokenExpired(format!(
            "exp claim out of range: {number}"
        ))),
    }
}

/// Decode `scope` into a list of scope tokens.
///
/// The wire format is a single space-separated string; a JSON array of
/// strings is also accepted. Missing or any other shape fails.
pub(crate) fn decode_scope_claim(value: Option<&Value>) -> AuthResult<Vec<String>> {
    match value {
        None => Err(AuthError::TokenScopeClaimInvalid(
            "token has no scope claim".into(),
        )),
        Some(Value::String(scope)) => Ok(scope.split_whitespace().map(str::to_owned).collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(AuthError::TokenScopeClaimInvalid(format!(
                    "scope list contains a {}",
                    json_type(other)
                ))),
            })
            .collect(),
        Some(other) => Err(AuthError::TokenScopeClaimInvalid(format!(
            "scope claim is a {}",
            json_type(other)
        ))),
    }
}

/// Decode `aud` into a list. Absent decodes to an empty list.
pub(crate) fn decode_audience_claim(value: Option<&Value>) -> AuthResult<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::String(aud)) => Ok(vec![aud.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_owned).ok_or_else(|| {
                    AuthError::TokenAudienceMismatch(format!(
                        "audience list contains a {}",
                        json_type(item)
                    ))
                })
            })
            .collect(),
        Some(other) => Err(AuthError::TokenAudienceMismatch(format!(
            "aud claim is a {}",
            json_type(other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
