//! Resource server configuration
//!
//! A [`ResourceServerConfig`] is assembled once at startup (by the embedding
//! application's CLI/config layer) and shared read-only by the key resolver,
//! the validator, the middleware and the metadata endpoint.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, AuthResult};

/// Clock skew tolerance applied to the `exp` check
pub const EXPIRATION_LEEWAY: Duration = Duration::from_secs(10);

/// Well-known path of the RFC 9728 Protected Resource Metadata document
pub const PROTECTED_RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

/// The only accepted signing algorithm
pub const ACCEPTED_ALGORITHM: &str = "RS256";

/// How the token's scopes are compared with the configured supported scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePolicy {
    /// Every configured scope must be granted by the token (logical AND)
    #[default]
    RequireAll,
    /// At least one configured scope must be granted by the token (logical OR)
    RequireAny,
}

impl ScopePolicy {
    /// Check granted scopes against the configured set.
    ///
    /// An empty configured set satisfies both policies.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenScopeInsufficient`] listing the configured
    /// scopes the token lacks.
    pub fn check(&self, configured: &BTreeSet<String>, granted: &[String]) -> AuthResult<()> {
        if configured.is_empty() {
            return Ok(());
        }

        let missing: Vec<String> = configured
            .iter()
            .filter(|scope| !granted.iter().any(|g| g == *scope))
            .cloned()
            .collect();

        let satisfied = match self {
            Self::RequireAll => missing.is_empty(),
            Self::RequireAny => missing.len() < configured.len(),
        };

        if satisfied {
            Ok(())
        } else {
            Err(AuthError::TokenScopeInsufficient { missing })
        }
    }
}

/// Whether the validator checks the `aud` claim
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "audience", rename_all = "snake_case")]
pub enum AudiencePolicy {
    /// `aud` is not inspected
    #[default]
    Unchecked,
    /// `aud` (string or array) must contain this value
    Require(String),
}

/// Certificate verification policy for the key set transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Verify the authorization server's certificate chain
    #[default]
    Verify,
    /// Accept any certificate. Test environments only.
    InsecureSkipVerify,
}

/// Timings of the key set refresher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Interval between scheduled refreshes
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    /// Delay before retrying a failed refresh
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    /// Minimum spacing of refreshes triggered by unknown key ids
    #[serde(with = "duration_secs")]
    pub min_refresh_interval: Duration,
    /// Deadline for the blocking initial fetch
    #[serde(with = "duration_secs")]
    pub init_timeout: Duration,
    /// Timeout of a single key set HTTP request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(15 * 60),
            retry_interval: Duration::from_secs(30),
            min_refresh_interval: Duration::from_secs(5),
            init_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RefreshOptions {
    /// Reject timings that would make the refresher spin
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if the refresh or retry interval
    /// is zero.
    pub fn validate(&self) -> AuthResult<()> {
        if self.refresh_interval.is_zero() || self.retry_interval.is_zero() {
            return Err(AuthError::configuration(
                "key set refresh and retry intervals must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Resource server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceServerConfig {
    /// Authorization server URL; tokens must carry it verbatim as `iss`
    pub authorization_server_url: String,
    /// Published key set (JWKS) URL
    pub jwks_url: String,
    /// Canonical URL of this resource server
    pub resource_url: String,
    /// Scopes advertised in metadata and enforced by the scope policy
    #[serde(default)]
    pub scopes_supported: BTreeSet<String>,
    /// Disable certificate verification when fetching the key set
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Scope comparison policy
    #[serde(default)]
    pub scope_policy: ScopePolicy,
    /// Audience check policy
    #[serde(default)]
    pub audience: AudiencePolicy,
    /// Key set refresher timings
    #[serde(default)]
    pub jwks: RefreshOptions,
}

impl ResourceServerConfig {
    /// Start building a configuration
    #[must_use]
    pub fn builder() -> ResourceServerConfigBuilder {
        ResourceServerConfigBuilder::default()
    }

    /// Key set transport TLS policy derived from the insecure toggle
    #[must_use]
    pub fn tls_policy(&self) -> TlsPolicy {
        if self.insecure_skip_tls_verify {
            TlsPolicy::InsecureSkipVerify
        } else {
            TlsPolicy::Verify
        }
    }

    /// Strict startup checks.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if a URL is empty or unparseable,
    /// if a configured scope is empty or contains whitespace, or if a
    /// refresher interval is zero.
    pub fn validate(&self) -> AuthResult<()> {
        require_url("authorization server URL", &self.authorization_server_url)?;
        require_url("key set URL", &self.jwks_url)?;
        require_url("resource URL", &self.resource_url)?;

        for scope in &self.scopes_supported {
            if scope.is_empty() || scope.chars().any(char::is_whitespace) {
                return Err(AuthError::configuration(format!(
                    "invalid scope {scope:?}: scopes must be non-empty and contain no whitespace"
                )));
            }
        }

        self.jwks.validate()
    }
}

fn require_url(name: &str, value: &str) -> AuthResult<()> {
    if value.trim().is_empty() {
        return Err(AuthError::configuration(format!("{name} is empty")));
    }
    Url::parse(value)
        .map(|_| ())
        .map_err(|e| AuthError::configuration(format!("{name} {value:?} is invalid: {e}")))
}

/// Builder for [`ResourceServerConfig`]
#[derive(Debug, Clone, Default)]
pub struct ResourceServerConfigBuilder {
    authorization_server_url: String,
    jwks_url: String,
    resource_url: String,
    scopes_supported: BTreeSet<String>,
    insecure_skip_tls_verify: bool,
    scope_policy: ScopePolicy,
    audience: AudiencePolicy,
    require_resource_audience: bool,
    jwks: RefreshOptions,
}

impl ResourceServerConfigBuilder {
    /// Set the authorization server URL (expected issuer)
    #[must_use]
    pub fn authorization_server_url(mut self, url: impl Into<String>) -> Self {
        self.authorization_server_url = url.into();
        self
    }

    /// Set the key set URL
    #[must_use]
    pub fn jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks_url = url.into();
        self
    }

    /// Set the resource server URL
    #[must_use]
    pub fn resource_url(mut self, url: impl Into<String>) -> Self {
        self.resource_url = url.into();
        self
    }

    /// Add a supported scope; duplicates collapse
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes_supported.insert(scope.into());
        self
    }

    /// Add several supported scopes
    #[must_use]
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes_supported
            .extend(scopes.into_iter().map(Into::into));
        self
    }

    /// Disable certificate verification for the key set transport
    #[must_use]
    pub fn insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_tls_verify = insecure;
        self
    }

    /// Set the scope policy
    #[must_use]
    pub fn scope_policy(mut self, policy: ScopePolicy) -> Self {
        self.scope_policy = policy;
        self
    }

    /// Require `aud` to contain the given value
    #[must_use]
    pub fn require_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = AudiencePolicy::Require(audience.into());
        self.require_resource_audience = false;
        self
    }

    /// Require `aud` to contain the resource URL
    #[must_use]
    pub fn require_resource_audience(mut self) -> Self {
        self.require_resource_audience = true;
        self
    }

    /// Override the key set refresher timings
    #[must_use]
    pub fn refresh_options(mut self, options: RefreshOptions) -> Self {
        self.jwks = options;
        self
    }

    /// Assemble the configuration. Run [`ResourceServerConfig::validate`] for
    /// strict checks.
    #[must_use]
    pub fn build(self) -> ResourceServerConfig {
        let audience = if self.require_resource_audience {
            AudiencePolicy::Require(self.resource_url.clone())
        } else {
            self.audience
        };

        ResourceServerConfig {
            authorization_server_url: self.authorization_server_url,
            jwks_url: self.jwks_url,
            resource_url: self.resource_url,
            scopes_supported: self.scopes_supported,
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            scope_policy: self.scope_policy,
            audience,
            jwks: self.jwks,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
