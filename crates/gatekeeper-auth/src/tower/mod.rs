//! # Tower middleware for bearer-token gatekeeping
//!
//! - [`GatekeeperLayer`] - a Tower Layer holding the validator and the
//!   precomputed `WWW-Authenticate` challenge
//! - [`GatekeeperService`] - the per-route Service that extracts, validates and
//!   forwards or rejects
//!
//! ## Request flow
//!
//! ```text
//! START ──► TOKEN_EXTRACTED ──► VALIDATED ──► FORWARDED
//!   │              │                 │
//!   └──────────────┴─────────────────┴──► REJECTED (401, or 500)
//! ```
//!
//! A layer built without a key resolver answers 500 to every request before
//! looking at the `Authorization` header.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::{Router, routing::post};
//! use gatekeeper_auth::server::metadata_router;
//! use gatekeeper_auth::tower::GatekeeperLayer;
//!
//! let app = Router::new()
//!     .route("/mcp", post(handle_mcp))
//!     .layer(GatekeeperLayer::new(config.clone()).key_resolver(resolver))
//!     .merge(metadata_router(&config));
//! ```
//!
//! ## Request Extensions
//!
//! On success the raw token is attached with [`crate::context::attach_token`]
//! and is readable downstream through [`crate::context::token_from_extensions`]
//! or the [`crate::context::BearerToken`] extractor.

mod layer;
mod service;

pub use layer::GatekeeperLayer;
pub use service::{GatekeeperService, GatekeeperServiceFuture};

use http::HeaderMap;
use http::header::AUTHORIZATION;

/// Scheme prefix, case-sensitive, exactly one separating space
const BEARER_PREFIX: &str = "Bearer ";

/// Extract the token from an `Authorization: Bearer <token>` header
///
/// Returns `None` when the header is missing, not valid visible ASCII, uses
/// another scheme, or carries an empty token.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix(BEARER_PREFIX)?;

    if token.is_empty() || token.starts_with(char::is_whitespace) {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer(&headers("Bearer abc.def.ghi")), Some("abc.def.ghi"));
    }

    #[test]
    fn test_extract_bearer_rejects() {
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
        for value in [
            "Basic dXNlcjpwYXNz",
            "Bearer ",
            "Bearer",
            "bearer abc",
            "BEARER abc",
            "Bearer  abc",
            "Bearerabc",
            "",
        ] {
            assert_eq!(extract_bearer(&headers(value)), None, "{value:?}");
        }
    }

    #[test]
    fn test_extract_bearer_non_ascii_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_bytes(b"Bearer \xffabc").unwrap(),
        );
        assert_eq!(extract_bearer(&headers), None);
    }
}
