//! Tower Service implementation for the gatekeeper
//!
//! Works with `http::Request<B>` for any body type and answers with axum
//! [`Response`]s, so it slots under `axum::Router::layer` or a plain
//! `tower::ServiceBuilder`.
//!
//! Validation runs synchronously inside `call`: keys come from the resolver's
//! cache and no I/O happens on the request path.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Json;
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use http::header::WWW_AUTHENTICATE;
use http::{HeaderValue, Request, StatusCode};
use tower_service::Service;
use tracing::{error, warn};

use crate::context::attach_token;
use crate::error::{AuthError, AuthResult};
use crate::jwt::TokenValidator;
use crate::server::{server_error_response_body, unauthorized_response_body};

use super::extract_bearer;

/// Future type for gatekeeper responses
pub type GatekeeperServiceFuture<E> = BoxFuture<'static, Result<Response, E>>;

/// Tower Service that validates bearer tokens before forwarding
///
/// On success the raw token is attached to the request extensions and the
/// request is passed to the inner service unchanged otherwise. On failure the
/// inner service is never called.
#[derive(Debug, Clone)]
pub struct GatekeeperService<S> {
    inner: S,
    validator: Option<Arc<TokenValidator>>,
    challenge: Result<HeaderValue, AuthError>,
}

impl<S> GatekeeperService<S> {
    /// Create a new gatekeeper service
    pub fn new(
        inner: S,
        validator: Option<Arc<TokenValidator>>,
        challenge: Result<HeaderValue, AuthError>,
    ) -> Self {
        Self {
            inner,
            validator,
            challenge,
        }
    }

    /// Get a reference to the inner service
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the inner service
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn authenticate<B>(validator: &TokenValidator, req: &Request<B>) -> AuthResult<String> {
        let token = extract_bearer(req.headers()).ok_or_else(|| {
            if req.headers().contains_key(http::header::AUTHORIZATION) {
                AuthError::malformed("Authorization header is not of the form `Bearer <token>`")
            } else {
                AuthError::malformed("missing Authorization header")
            }
        })?;

        validator.validate(token)?;
        Ok(token.to_owned())
    }

    /// Map a rejection to its response: a challenged 401 for token
    /// failures, an opaque 500 for everything else
    fn reject(&self, e: &AuthError) -> Response {
        if e.status_code() != StatusCode::UNAUTHORIZED {
            return server_error();
        }

        match &self.challenge {
            Ok(challenge) => (
                StatusCode::UNAUTHORIZED,
                [(WWW_AUTHENTICATE, challenge.clone())],
                Json(unauthorized_response_body()),
            )
                .into_response(),
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Cannot issue 401 challenge");
                server_error()
            }
        }
    }
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(server_error_response_body()),
    )
        .into_response()
}

impl<S, B> Service<Request<B>> for GatekeeperService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = GatekeeperServiceFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let Some(validator) = self.validator.as_deref() else {
            let e = AuthError::MiddlewareNotInitialized;
            error!(
                kind = e.kind(),
                method = %req.method(),
                path = %req.uri().path(),
                "{e}"
            );
            let response = self.reject(&e);
            return Box::pin(async move { Ok(response) });
        };

        match Self::authenticate(validator, &req) {
            Ok(token) => {
                attach_token(req.extensions_mut(), &token);

                let inner = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, inner);
                Box::pin(async move { inner.call(req).await })
            }
            Err(e) if e.is_token_error() => {
                warn!(
                    kind = e.kind(),
                    error = %e,
                    method = %req.method(),
                    path = %req.uri().path(),
                    "Rejected request"
                );
                let response = self.reject(&e);
                Box::pin(async move { Ok(response) })
            }
            Err(e) => {
                error!(
                    kind = e.kind(),
                    error = %e,
                    method = %req.method(),
                    path = %req.uri().path(),
                    "Request failed on a server-side error"
                );
                let response = self.reject(&e);
                Box::pin(async move { Ok(response) })
            }
        }
    }
}
