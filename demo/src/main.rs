//! Gatekeeper demo - a resource server protected by bearer tokens
//!
//! Serves:
//! - `POST /mcp` and `GET /whoami` behind the gatekeeper middleware
//! - `/.well-known/oauth-protected-resource` without authentication
//!
//! Logs go to stderr; set `RUST_LOG` to adjust verbosity.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use gatekeeper_auth::server::metadata_router;
use gatekeeper_auth::{
    BearerToken, GatekeeperLayer, JwksKeyResolver, ResourceServerConfig, ScopePolicy,
};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Demo resource server protected by gatekeeper-auth
#[derive(Parser, Debug)]
#[command(name = "gatekeeper-demo", version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "GATEKEEPER_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Authorization server URL, matched exactly against the token `iss`
    #[arg(long, env = "GATEKEEPER_AUTH_SERVER_URL")]
    auth_server_url: String,

    /// JWKS URL of the authorization server
    #[arg(long, env = "GATEKEEPER_JWKS_URL")]
    jwks_url: String,

    /// Public URL of this resource server
    #[arg(long, env = "GATEKEEPER_RESOURCE_URL")]
    resource_url: String,

    /// Supported scopes, comma separated
    #[arg(long, env = "GATEKEEPER_SCOPES", value_delimiter = ',')]
    scopes: Vec<String>,

    /// Accept a token granting any supported scope instead of all of them
    #[arg(long, env = "GATEKEEPER_REQUIRE_ANY_SCOPE")]
    require_any_scope: bool,

    /// Require the resource URL in the token audience
    #[arg(long, env = "GATEKEEPER_REQUIRE_AUDIENCE")]
    require_audience: bool,

    /// Skip TLS verification for JWKS fetches (testing only)
    #[arg(long, env = "GATEKEEPER_INSECURE_SKIP_TLS_VERIFY")]
    insecure_skip_tls_verify: bool,

    /// Emit logs as JSON
    #[arg(long, env = "GATEKEEPER_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn resource_server_config(&self) -> ResourceServerConfig {
        let mut builder = ResourceServerConfig::builder()
            .authorization_server_url(&self.auth_server_url)
            .jwks_url(&self.jwks_url)
            .resource_url(&self.resource_url)
            .scopes(self.scopes.iter().map(|s| s.trim()).filter(|s| !s.is_empty()))
            .insecure_skip_tls_verify(self.insecure_skip_tls_verify);

        if self.require_any_scope {
            builder = builder.scope_policy(ScopePolicy::RequireAny);
        }
        if self.require_audience {
            builder = builder.require_resource_audience();
        }
        builder.build()
    }
}

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

/// Stand-in for a downstream tool handler: receives only the raw token
async fn handle_mcp(BearerToken(token): BearerToken, Json(request): Json<Value>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "result": { "token_length": token.len() },
    }))
}

async fn whoami(BearerToken(token): BearerToken) -> Json<Value> {
    // Claims are not re-parsed here; only show the token is present
    Json(json!({ "authenticated": !token.is_empty() }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    let config = Arc::new(cli.resource_server_config());
    config.validate().context("invalid configuration")?;

    let resolver = JwksKeyResolver::initialize_with(
        config.jwks_url.clone(),
        config.tls_policy(),
        config.jwks.clone(),
    )
    .await
    .context("failed to load the authorization server key set")?;

    let gatekeeper = GatekeeperLayer::new(Arc::clone(&config)).key_resolver(Arc::new(resolver));

    let app = Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/whoami", get(whoami))
        .layer(gatekeeper)
        .merge(metadata_router(&config));

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;

    info!(
        listen = %cli.listen,
        resource = %config.resource_url,
        "Gatekeeper demo listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
