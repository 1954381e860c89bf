//! Error taxonomy for the resource server layer
//!
//! Token-level errors carry enough detail for operators (they are logged with
//! their [`AuthError::kind`]) but are never written to an HTTP response. At the
//! HTTP boundary every token error collapses into the same opaque 401, while
//! deployment errors surface as 500.

use http::StatusCode;
use thiserror::Error;

/// Result type for gatekeeper operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Error type for configuration, key resolution and token validation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Invalid or incomplete configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fetching or parsing the published key set failed
    #[error("Key resolution error: {0}")]
    KeyResolution(String),

    /// Token header names no key, or names a key absent from the cache
    #[error("Signing key not found: {0}")]
    KeyNotFound(String),

    /// Token is not a structurally valid compact JWS
    #[error("Malformed token: {0}")]
    TokenMalformed(String),

    /// Token is signed with an algorithm other than RS256
    #[error("Signing algorithm rejected: {0}")]
    TokenAlgorithmRejected(String),

    /// Signature verification failed
    #[error("Invalid token signature: {0}")]
    TokenSignatureInvalid(String),

    /// Token expired beyond the permitted leeway, or carries no usable `exp`
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// `iss` missing or different from the configured authorization server
    #[error("Issuer mismatch: {0}")]
    TokenIssuerMismatch(String),

    /// `aud` does not name this resource server
    #[error("Audience mismatch: {0}")]
    TokenAudienceMismatch(String),

    /// `scope` claim missing or not a string / list of strings
    #[error("Invalid scope claim: {0}")]
    TokenScopeClaimInvalid(String),

    /// Token scopes do not satisfy the configured scope policy
    #[error("Insufficient scope: missing {}", .missing.join(" "))]
    TokenScopeInsufficient {
        /// Configured scopes absent from the token
        missing: Vec<String>,
    },

    /// Middleware was installed without a key resolver
    #[error("Gatekeeper middleware is not initialized: no key resolver configured")]
    MiddlewareNotInitialized,

    /// The resource metadata URL cannot be built from the resource URL
    #[error("Cannot build resource metadata URL: {0}")]
    MetadataUrl(String),
}

impl AuthError {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a key resolution error
    #[must_use]
    pub fn key_resolution(msg: impl Into<String>) -> Self {
        Self::KeyResolution(msg.into())
    }

    /// Create a malformed token error
    #[must_use]
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::TokenMalformed(msg.into())
    }

    /// Whether this error describes the presented credential.
    ///
    /// Key resolution failures count as token errors: on the request path an
    /// unresolvable key means the token cannot be trusted.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_) | Self::MiddlewareNotInitialized | Self::MetadataUrl(_)
        )
    }

    /// HTTP status this error maps to at the middleware boundary
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        if self.is_token_error() {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    /// Stable label used in log fields
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::KeyResolution(_) => "key_resolution",
            Self::KeyNotFound(_) => "key_not_found",
            Self::TokenMalformed(_) => "token_malformed",
            Self::TokenAlgorithmRejected(_) => "token_algorithm_rejected",
            Self::TokenSignatureInvalid(_) => "token_signature_invalid",
            Self::TokenExpired(_) => "token_expired",
            Self::TokenIssuerMismatch(_) => "token_issuer_mismatch",
            Self::TokenAudienceMismatch(_) => "token_audience_mismatch",
            Self::TokenScopeClaimInvalid(_) => "token_scope_claim_invalid",
            Self::TokenScopeInsufficient { .. } => "token_scope_insufficient",
            Self::MiddlewareNotInitialized => "middleware_not_initialized",
            Self::MetadataUrl(_) => "metadata_url",
        }
    }
}
