//! Request-scoped propagation of the verified bearer token
//!
//! The middleware stores the *raw* token string in the request's
//! [`http::Extensions`] once it has passed validation. Extensions are keyed by
//! type, and the key type here is private to this module, so no other code can
//! read or overwrite the value except through these functions.
//!
//! Downstream handlers get the raw token only, never decoded claims. Claim
//! extraction, if needed, is their business.
//!
//! ```rust
//! use gatekeeper_auth::context::{attach_token, token_from_extensions};
//!
//! let mut extensions = http::Extensions::new();
//! assert_eq!(token_from_extensions(&extensions), "");
//!
//! attach_token(&mut extensions, "eyJhbGciOi...");
//! assert_eq!(token_from_extensions(&extensions), "eyJhbGciOi...");
//! ```

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use http::request::Parts;
use tracing::{error, warn};

/// Extension key. Not exported.
#[derive(Debug, Clone)]
struct VerifiedBearerToken(Arc<str>);

/// Attach the raw verified token.
///
/// Write-once: if a token is already attached the existing value is kept and
/// `false` is returned.
pub fn attach_token(extensions: &mut http::Extensions, token: &str) -> bool {
    if extensions.get::<VerifiedBearerToken>().is_some() {
        warn!("Verified bearer token already attached to request; keeping the first value");
        return false;
    }
    extensions.insert(VerifiedBearerToken(Arc::from(token)));
    true
}

/// The attached token, if any
pub fn try_token_from_extensions(extensions: &http::Extensions) -> Option<&str> {
    extensions
        .get::<VerifiedBearerToken>()
        .map(|token| token.0.as_ref())
}

/// The attached token, or `""` if none is attached
pub fn token_from_extensions(extensions: &http::Extensions) -> &str {
    try_token_from_extensions(extensions).unwrap_or_default()
}

/// Return `request` carrying the verified token
pub fn with_token<B>(mut request: http::Request<B>, token: &str) -> http::Request<B> {
    attach_token(request.extensions_mut(), token);
    request
}

/// Axum extractor for the verified raw bearer token
///
/// Rejects with 500 if the gatekeeper middleware did not run for this route,
/// since reaching a protected handler without it is a deployment error.
///
/// ```rust,ignore
/// async fn list_clusters(BearerToken(token): BearerToken) -> String {
///     // forward `token` to the upstream API
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

/// Rejection for [`BearerToken`]
#[derive(Debug, Clone, Copy)]
pub struct MissingBearerToken;

impl IntoResponse for MissingBearerToken {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "verified bearer token missing from request context",
        )
            .into_response()
    }
}

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = MissingBearerToken;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match try_token_from_extensions(&parts.extensions) {
            Some(token) => Ok(Self(token.to_owned())),
            None => {
                error!(path = %parts.uri.path(), "Handler reached without gatekeeper middleware");
                Err(MissingBearerToken)
            }
        }
    }
}
