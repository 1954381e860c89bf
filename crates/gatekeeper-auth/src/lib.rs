//! # Gatekeeper Auth - OAuth 2.1 Resource Server Layer
//!
//! Bearer-token gatekeeping for HTTP services acting as an OAuth 2.1
//! resource server: JWKS key resolution, JWT validation, a Tower middleware
//! and the RFC 9728 Protected Resource Metadata endpoint.
//!
//! ## Design Principles
//!
//! - **Fail closed**: every token failure is an opaque 401; deployment defects
//!   are a 500, never a 401
//! - **No I/O on the request path**: keys are served from a cache refreshed in
//!   the background
//! - **Explicit claim checks**: issuer, audience and scope are separate,
//!   ordered pipeline steps
//!
//! ## Architecture
//!
//! - [`config`] - Resource server configuration and policies
//! - [`error`] - Error taxonomy and HTTP status mapping
//! - [`jwt`] - Key resolution ([`jwt::jwks`]) and the validation pipeline
//!   ([`jwt::validator`])
//! - [`context`] - Request-scoped propagation of the verified raw token
//! - [`tower`] - Gatekeeper Layer/Service
//! - [`server`] - Protected Resource Metadata and `WWW-Authenticate` challenges
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use axum::{Router, routing::post};
//! use gatekeeper_auth::{GatekeeperLayer, JwksKeyResolver, ResourceServerConfig};
//! use gatekeeper_auth::server::metadata_router;
//!
//! let config = Arc::new(
//!     ResourceServerConfig::builder()
//!         .authorization_server_url("https://auth.example.com")
//!         .jwks_url("https://auth.example.com/.well-known/jwks.json")
//!         .resource_url("https://mcp.example.com")
//!         .scopes(["rancher:resources", "rancher:cluster"])
//!         .build(),
//! );
//! config.validate()?;
//!
//! let resolver = JwksKeyResolver::initialize(&config.jwks_url, config.tls_policy()).await?;
//!
//! let app = Router::new()
//!     .route("/mcp", post(handle_mcp))
//!     .layer(GatekeeperLayer::new(Arc::clone(&config)).key_resolver(Arc::new(resolver)))
//!     .merge(metadata_router(&config));
//! ```
//!
//! ## Standards Compliance
//!
//! - **RFC 7519** - JSON Web Token (JWT)
//! - **RFC 7517** - JSON Web Key (JWK)
//! - **RFC 6750** - Bearer Token Usage
//! - **RFC 9728** - OAuth 2.0 Protected Resource Metadata

// Submodules
pub mod config;
pub mod context;
pub mod error;
pub mod jwt;
pub mod server;
pub mod tower;

// Re-export configuration types
#[doc(inline)]
pub use config::{
    AudiencePolicy, RefreshOptions, ResourceServerConfig, ResourceServerConfigBuilder,
    ScopePolicy, TlsPolicy,
};

#[doc(inline)]
pub use error::{AuthError, AuthResult};

#[doc(inline)]
pub use jwt::{JwksKeyResolver, KeyResolver, StaticKeyResolver, TokenValidator, VerifiedClaims};

#[doc(inline)]
pub use context::BearerToken;

#[doc(inline)]
pub use self::tower::{GatekeeperLayer, GatekeeperService};

#[doc(inline)]
pub use server::{ProtectedResourceMetadata, metadata_router};
