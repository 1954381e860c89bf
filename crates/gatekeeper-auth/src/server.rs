//! Server-side discovery helpers
//!
//! This module provides:
//! - Protected Resource Metadata (RFC 9728) and its unauthenticated endpoint
//! - `WWW-Authenticate` challenge construction for 401 responses
//!
//! The metadata endpoint must stay outside the gatekeeper middleware: it is
//! fetched by the same unauthenticated client that received the 401 pointing
//! at it.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;
use url::Url;

use crate::config::{PROTECTED_RESOURCE_METADATA_PATH, ResourceServerConfig};
use crate::error::{AuthError, AuthResult};

/// Protected Resource Metadata document (RFC 9728)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Resource server identifier
    pub resource: String,
    /// Authorization servers able to issue tokens for this resource
    pub authorization_servers: Vec<String>,
    /// Scopes a client may request
    pub scopes_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    /// Build the document from configuration. Scopes come out sorted.
    #[must_use]
    pub fn from_config(config: &ResourceServerConfig) -> Self {
        Self {
            resource: config.resource_url.clone(),
            authorization_servers: vec![config.authorization_server_url.clone()],
            scopes_supported: config.scopes_supported.iter().cloned().collect(),
        }
    }
}

/// URL of the metadata document for `resource_url`.
///
/// # Errors
///
/// Returns [`AuthError::MetadataUrl`] if `resource_url` is not an absolute URL,
/// carries a query or fragment, or cannot be embedded in a quoted header
/// parameter.
pub fn resource_metadata_url(resource_url: &str) -> AuthResult<String> {
    let url = Url::parse(resource_url)
        .map_err(|e| AuthError::MetadataUrl(format!("resource URL {resource_url:?}: {e}")))?;

    if url.query().is_some() || url.fragment().is_some() {
        return Err(AuthError::MetadataUrl(format!(
            "resource URL {resource_url:?} must not carry a query or fragment"
        )));
    }

    if resource_url.contains(['"', '\\']) || resource_url.chars().any(char::is_control) {
        return Err(AuthError::MetadataUrl(format!(
            "resource URL {resource_url:?} cannot be quoted"
        )));
    }

    Ok(format!(
        "{}{PROTECTED_RESOURCE_METADATA_PATH}",
        resource_url.trim_end_matches('/')
    ))
}

/// WWW-Authenticate header builder for 401 Unauthorized responses
///
/// Implements RFC 9728 Section 5.1 "WWW-Authenticate Response" for indicating
/// the location of Protected Resource Metadata.
#[derive(Debug, Clone)]
pub struct WwwAuthenticateBuilder {
    /// Resource metadata URI for .well-known endpoint
    metadata_uri: String,
}

impl WwwAuthenticateBuilder {
    /// Create a new WWW-Authenticate builder
    pub fn new(metadata_uri: impl Into<String>) -> Self {
        Self {
            metadata_uri: metadata_uri.into(),
        }
    }

    /// Challenge for the resource server described by `config`
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MetadataUrl`] if the resource URL is malformed.
    pub fn for_resource(config: &ResourceServerConfig) -> AuthResult<Self> {
        resource_metadata_url(&config.resource_url).map(Self::new)
    }

    /// Build the WWW-Authenticate header value
    ///
    /// Produces a header like:
    /// ```text
    /// Bearer resource_metadata="https://api.example.com/.well-known/oauth-protected-resource"
    /// ```
    pub fn build(&self) -> String {
        format!("Bearer resource_metadata=\"{}\"", self.metadata_uri)
    }

    /// Build as an HTTP header value
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MetadataUrl`] if the value contains bytes not
    /// allowed in a header.
    pub fn header_value(&self) -> AuthResult<HeaderValue> {
        HeaderValue::from_str(&self.build())
            .map_err(|e| AuthError::MetadataUrl(format!("invalid WWW-Authenticate value: {e}")))
    }
}

/// Body of every 401 response; identical whatever check failed
pub fn unauthorized_response_body() -> Value {
    json!({
        "error": "unauthorized",
        "error_description": "Valid bearer token required",
    })
}

/// Body of every 500 response
pub fn server_error_response_body() -> Value {
    json!({ "error": "server_error" })
}

fn with_cors_headers(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(server_error_response_body()),
    )
        .into_response()
}

/// Serve the metadata document for `method`
///
/// - `GET`/`HEAD`: 200 with the JSON document
/// - `OPTIONS`: 200 preflight, empty body
/// - anything else: 405
///
/// Every response carries permissive CORS headers.
pub fn metadata_response(method: &Method, metadata: &ProtectedResourceMetadata) -> Response {
    let builder = with_cors_headers(Response::builder());

    let result = match *method {
        Method::GET | Method::HEAD => match serde_json::to_vec(metadata) {
            Ok(body) => builder
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body)),
            Err(e) => {
                error!(error = %e, "Failed to serialize protected resource metadata");
                return internal_error();
            }
        },
        Method::OPTIONS => builder.status(StatusCode::OK).body(Body::empty()),
        _ => builder
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header(header::ALLOW, "GET, OPTIONS")
            .body(Body::empty()),
    };

    result.unwrap_or_else(|e| {
        error!(error = %e, "Failed to build metadata response");
        internal_error()
    })
}

/// Axum handler for `/.well-known/oauth-protected-resource`
pub async fn protected_resource_metadata(
    State(metadata): State<Arc<ProtectedResourceMetadata>>,
    method: Method,
) -> Response {
    metadata_response(&method, &metadata)
}

/// Router serving the metadata document at its well-known path
///
/// Merge it next to, not under, the routes protected by the gatekeeper layer.
pub fn metadata_router(config: &ResourceServerConfig) -> Router {
    Router::new()
        .route(
            PROTECTED_RESOURCE_METADATA_PATH,
            any(protected_resource_metadata),
        )
        .with_state(Arc::new(ProtectedResourceMetadata::from_config(config)))
}
