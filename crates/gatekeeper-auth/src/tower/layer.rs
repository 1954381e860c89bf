//! Tower Layer implementation for the gatekeeper

use std::sync::Arc;

use http::HeaderValue;
use tower::Layer;
use tracing::{error, info};

use crate::config::ResourceServerConfig;
use crate::error::AuthError;
use crate::jwt::{KeyResolver, TokenValidator};
use crate::server::WwwAuthenticateBuilder;

use super::service::GatekeeperService;

/// Tower Layer that puts bearer-token validation in front of services
///
/// # Example
///
/// ```rust,ignore
/// use tower::ServiceBuilder;
/// use gatekeeper_auth::tower::GatekeeperLayer;
///
/// let layer = GatekeeperLayer::new(Arc::new(config)).key_resolver(resolver);
///
/// let service = ServiceBuilder::new()
///     .layer(layer)
///     .service(my_inner_service);
/// ```
#[derive(Debug, Clone)]
pub struct GatekeeperLayer {
    config: Arc<ResourceServerConfig>,
    validator: Option<Arc<TokenValidator>>,
    challenge: Result<HeaderValue, AuthError>,
}

impl GatekeeperLayer {
    /// Create a layer with no key resolver attached yet
    ///
    /// Until [`key_resolver`](Self::key_resolver) is called every request is
    /// answered with 500.
    pub fn new(config: Arc<ResourceServerConfig>) -> Self {
        let challenge = WwwAuthenticateBuilder::for_resource(&config)
            .and_then(|builder| builder.header_value())
            .inspect_err(|e| {
                error!(
                    resource = %config.resource_url,
                    error = %e,
                    "Cannot build WWW-Authenticate challenge; rejections will be answered with 500"
                );
            });

        Self {
            config,
            validator: None,
            challenge,
        }
    }

    /// Attach the key resolver, enabling validation
    #[must_use]
    pub fn key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        info!(
            resource = %self.config.resource_url,
            issuer = %self.config.authorization_server_url,
            scopes = ?self.config.scopes_supported,
            "Gatekeeper middleware initialized"
        );
        self.validator = Some(Arc::new(TokenValidator::new(
            Arc::clone(&self.config),
            resolver,
        )));
        self
    }

    /// Whether a key resolver is attached
    pub fn is_initialized(&self) -> bool {
        self.validator.is_some()
    }

    /// The configuration this layer enforces
    pub fn config(&self) -> &ResourceServerConfig {
        &self.config
    }
}

impl<S> Layer<S> for GatekeeperLayer {
    type Service = GatekeeperService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GatekeeperService::new(inner, self.validator.clone(), self.challenge.clone())
    }
}
