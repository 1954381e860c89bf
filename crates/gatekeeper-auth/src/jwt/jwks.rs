//! JWKS (JSON Web Key Set) fetching and caching
//!
//! The request path only ever reads the cache. A background task owns all
//! network I/O:
//!
//! - **Blocking initial load**: bounded by `init_timeout`, fatal to startup
//! - **Scheduled refresh**: every `refresh_interval`, the whole key map is
//!   rebuilt and swapped in atomically
//! - **Retry on failure**: the previous keys stay live, next attempt after
//!   `retry_interval`
//! - **Unknown `kid` hint**: a cache miss wakes the refresher early, at most
//!   once per `min_refresh_interval`
//!
//! # Security Considerations
//!
//! - Plain HTTP to a non-loopback host is allowed for in-cluster endpoints
//!   but logged as a warning at startup
//! - Certificate verification can only be disabled through
//!   [`TlsPolicy::InsecureSkipVerify`]
//! - Readers never observe a partially updated key map

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use url::{Host, Url};

use crate::config::{RefreshOptions, TlsPolicy};
use crate::error::{AuthError, AuthResult};

/// Resolves a token's `kid` to a verification key.
///
/// Implementations must answer from memory: `resolve` runs on the request
/// path and must never perform network I/O.
pub trait KeyResolver: Send + Sync + fmt::Debug {
    /// Look up the verification key for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyNotFound`] if the key id is not cached.
    fn resolve(&self, key_id: &str) -> AuthResult<DecodingKey>;

    /// Key ids currently available, sorted
    fn key_ids(&self) -> Vec<String>;
}

/// Immutable snapshot of the key set
#[derive(Clone)]
struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: SystemTime,
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("key_ids", &sorted_ids(&self.keys))
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

/// Key set document with entries kept raw so one bad key cannot poison the set
#[derive(Debug, Deserialize)]
struct RawJwkSet {
    keys: Vec<serde_json::Value>,
}

impl KeyCache {
    fn from_document(document: RawJwkSet) -> AuthResult<Self> {
        let mut keys = HashMap::with_capacity(document.keys.len());

        for entry in document.keys {
            let jwk: Jwk = match serde_json::from_value(entry) {
                Ok(jwk) => jwk,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable JWK");
                    continue;
                }
            };

            let Some(kid) = jwk.common.key_id.clone() else {
                warn!("Skipping JWK without kid");
                continue;
            };

            match DecodingKey::from_jwk(&jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!(key_id = %kid, error = %e, "Skipping unusable JWK"),
            }
        }

        if keys.is_empty() {
            return Err(AuthError::key_resolution(
                "key set contains no usable keys",
            ));
        }

        Ok(Self {
            keys,
            fetched_at: SystemTime::now(),
        })
    }
}

fn sorted_ids(keys: &HashMap<String, DecodingKey>) -> Vec<String> {
    let mut ids: Vec<String> = keys.keys().cloned().collect();
    ids.sort();
    ids
}

/// Key resolver over a fixed set of keys
///
/// Use it for tests (deterministic keys, no network) or when keys are
/// provisioned out of band.
#[derive(Clone, Default)]
pub struct StaticKeyResolver {
    keys: Arc<HashMap<String, DecodingKey>>,
}

impl fmt::Debug for StaticKeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyResolver")
            .field("key_ids", &sorted_ids(&self.keys))
            .finish()
    }
}

impl StaticKeyResolver {
    /// Build from `(kid, key)` pairs
    pub fn from_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = (K, DecodingKey)>,
        K: Into<String>,
    {
        Self {
            keys: Arc::new(keys.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    /// Build from a parsed key set
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyResolution`] if a key has no `kid` or cannot be
    /// turned into a verification key.
    pub fn from_jwks(jwks: &JwkSet) -> AuthResult<Self> {
        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            let kid = jwk
                .common
                .key_id
                .clone()
                .ok_or_else(|| AuthError::key_resolution("JWK without kid"))?;
            let key = DecodingKey::from_jwk(jwk)
                .map_err(|e| AuthError::key_resolution(format!("Invalid JWK {kid}: {e}")))?;
            keys.insert(kid, key);
        }
        Ok(Self {
            keys: Arc::new(keys),
        })
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve(&self, key_id: &str) -> AuthResult<DecodingKey> {
        self.keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| AuthError::KeyNotFound(key_id.to_string()))
    }

    fn key_ids(&self) -> Vec<String> {
        sorted_ids(&self.keys)
    }
}

/// State shared between resolver handles and the refresher task
struct Shared {
    jwks_uri: String,
    http_client: reqwest::Client,
    cache: ArcSwap<KeyCache>,
    options: RefreshOptions,
    refresh_hint: Notify,
    /// Reference point for `last_refresh_ms`
    epoch: Instant,
    /// Milliseconds since `epoch` of the last refresh or accepted hint
    last_refresh_ms: AtomicU64,
}

impl Shared {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn refresh(&self) -> AuthResult<usize> {
        self.last_refresh_ms
            .store(self.elapsed_ms(), Ordering::Release);
        let cache = fetch_key_cache(&self.http_client, &self.jwks_uri).await?;
        let count = cache.keys.len();
        self.cache.store(Arc::new(cache));
        Ok(count)
    }

    /// Wake the refresher unless a refresh happened within `min_refresh_interval`
    fn request_refresh(&self) {
        let now = self.elapsed_ms();
        let last = self.last_refresh_ms.load(Ordering::Acquire);
        let min_ms =
            u64::try_from(self.options.min_refresh_interval.as_millis()).unwrap_or(u64::MAX);

        if now.saturating_sub(last) < min_ms {
            debug!(jwks_uri = %self.jwks_uri, "JWKS refresh hint rate limited");
            return;
        }

        if self
            .last_refresh_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(jwks_uri = %self.jwks_uri, "Unknown key id, requesting JWKS refresh");
            self.refresh_hint.notify_one();
        }
    }
}

/// Stops the refresher once the last resolver handle is gone
struct RefreshTask(AbortHandle);

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Key resolver backed by the authorization server's published key set
///
/// Cloning is cheap; all clones share one cache and one refresher task.
///
/// # Example
///
/// ```rust,no_run
/// # use gatekeeper_auth::jwt::{JwksKeyResolver, KeyResolver};
/// # use gatekeeper_auth::TlsPolicy;
/// # tokio_test::block_on(async {
/// let resolver = JwksKeyResolver::initialize(
///     "https://auth.example.com/.well-known/jwks.json",
///     TlsPolicy::Verify,
/// )
/// .await?;
///
/// let key = resolver.resolve("key-id-123")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// ```
#[derive(Clone)]
pub struct JwksKeyResolver {
    shared: Arc<Shared>,
    _refresher: Arc<RefreshTask>,
}

impl fmt::Debug for JwksKeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksKeyResolver")
            .field("jwks_uri", &self.shared.jwks_uri)
            .field("cache", &*self.shared.cache.load())
            .field("options", &self.shared.options)
            .finish()
    }
}

impl JwksKeyResolver {
    /// Fetch the key set and start the background refresher with default
    /// timings.
    ///
    /// # Errors
    ///
    /// See [`JwksKeyResolver::initialize_with`].
    pub async fn initialize(jwks_uri: impl Into<String>, tls: TlsPolicy) -> AuthResult<Self> {
        Self::initialize_with(jwks_uri, tls, RefreshOptions::default()).await
    }

    /// Fetch the key set and start the background refresher.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if the URL is empty, unparseable
    /// or not http(s), or if a refresher interval is zero, and
    /// [`AuthError::KeyResolution`] if the initial fetch fails or exceeds
    /// `init_timeout`.
    pub async fn initialize_with(
        jwks_uri: impl Into<String>,
        tls: TlsPolicy,
        options: RefreshOptions,
    ) -> AuthResult<Self> {
        let jwks_uri = jwks_uri.into();
        validate_jwks_uri(&jwks_uri)?;
        options.validate()?;

        let insecure = tls == TlsPolicy::InsecureSkipVerify;
        if insecure {
            warn!(
                jwks_uri = %jwks_uri,
                "TLS certificate verification disabled for JWKS fetches; \
                 never use this in production"
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| {
                AuthError::configuration(format!("Failed to create HTTP client: {e}"))
            })?;

        let cache = tokio::time::timeout(
            options.init_timeout,
            fetch_key_cache(&http_client, &jwks_uri),
        )
        .await
        .map_err(|_| {
            error!(
                jwks_uri = %jwks_uri,
                timeout = ?options.init_timeout,
                "Initial JWKS fetch timed out"
            );
            AuthError::key_resolution(format!(
                "initial JWKS fetch timed out after {:?}",
                options.init_timeout
            ))
        })??;

        let shared = Arc::new(Shared {
            jwks_uri,
            http_client,
            cache: ArcSwap::from_pointee(cache),
            options,
            refresh_hint: Notify::new(),
            epoch: Instant::now(),
            last_refresh_ms: AtomicU64::new(0),
        });

        let task = tokio::spawn(refresh_loop(Arc::clone(&shared)));

        Ok(Self {
            shared,
            _refresher: Arc::new(RefreshTask(task.abort_handle())),
        })
    }

    /// Refresh immediately, bypassing the schedule and rate limit.
    ///
    /// Returns the number of keys now cached. On failure the previous keys
    /// stay in place.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyResolution`] if the fetch fails.
    pub async fn refresh_now(&self) -> AuthResult<usize> {
        self.shared.refresh().await
    }

    /// The JWKS endpoint URI
    pub fn jwks_uri(&self) -> &str {
        &self.shared.jwks_uri
    }

    /// When the current key set was fetched
    pub fn fetched_at(&self) -> SystemTime {
        self.shared.cache.load().fetched_at
    }
}

impl KeyResolver for JwksKeyResolver {
    fn resolve(&self, key_id: &str) -> AuthResult<DecodingKey> {
        let cache = self.shared.cache.load();
        if let Some(key) = cache.keys.get(key_id) {
            return Ok(key.clone());
        }

        self.shared.request_refresh();
        Err(AuthError::KeyNotFound(key_id.to_string()))
    }

    fn key_ids(&self) -> Vec<String> {
        sorted_ids(&self.shared.cache.load().keys)
    }
}

async fn refresh_loop(shared: Arc<Shared>) {
    let mut delay = shared.options.refresh_interval;

    loop {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.refresh_hint.notified() => {}
        }

        delay = match shared.refresh().await {
            Ok(key_count) => {
                debug!(jwks_uri = %shared.jwks_uri, key_count, "JWKS refreshed");
                shared.options.refresh_interval
            }
            Err(e) => {
                warn!(
                    jwks_uri = %shared.jwks_uri,
                    error = %e,
                    retry_in = ?shared.options.retry_interval,
                    "JWKS refresh failed, keeping cached keys"
                );
                shared.options.retry_interval
            }
        };
    }
}

/// Fetch and parse the key set
async fn fetch_key_cache(client: &reqwest::Client, jwks_uri: &str) -> AuthResult<KeyCache> {
    info!(jwks_uri = %jwks_uri, "Fetching JWKS from endpoint");

    let response = client.get(jwks_uri).send().await.map_err(|e| {
        error!(jwks_uri = %jwks_uri, error = %e, "Failed to fetch JWKS");
        AuthError::key_resolution(format!("JWKS fetch failed: {e}"))
    })?;

    if !response.status().is_success() {
        error!(
            jwks_uri = %jwks_uri,
            status = %response.status(),
            "JWKS endpoint returned error status"
        );
        return Err(AuthError::key_resolution(format!(
            "JWKS endpoint returned status {}",
            response.status()
        )));
    }

    let document: RawJwkSet = response.json().await.map_err(|e| {
        error!(jwks_uri = %jwks_uri, error = %e, "Failed to parse JWKS JSON");
        AuthError::key_resolution(format!("Invalid JWKS format: {e}"))
    })?;

    let cache = KeyCache::from_document(document)?;

    info!(
        jwks_uri = %jwks_uri,
        key_count = cache.keys.len(),
        "Successfully fetched JWKS"
    );

    Ok(cache)
}

/// Require an absolute http(s) URL; plain http off loopback only warns
fn validate_jwks_uri(jwks_uri: &str) -> AuthResult<()> {
    if jwks_uri.trim().is_empty() {
        return Err(AuthError::configuration("JWKS URL is empty"));
    }

    let url = Url::parse(jwks_uri)
        .map_err(|e| AuthError::configuration(format!("Invalid JWKS URL {jwks_uri:?}: {e}")))?;

    match url.scheme() {
        "https" => Ok(()),
        "http" if url.host().is_some_and(|host| is_loopback(&host)) => Ok(()),
        "http" => {
            warn!(
                jwks_uri = %jwks_uri,
                "JWKS endpoint uses plain HTTP; keys can be substituted in transit"
            );
            Ok(())
        }
        scheme => Err(AuthError::configuration(format!(
            "JWKS URL must use http or https scheme, got: {scheme}"
        ))),
    }
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
    }
}
