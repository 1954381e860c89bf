//! JWKS caching and key rotation robustness tests
//!
//! Tests cover:
//! - Initialization failures (bad URL, error status, timeout, unusable keys)
//! - TLS policy: certificate verification on and off against a self-signed
//!   HTTPS endpoint
//! - Key rotation picked up by explicit and scheduled refresh
//! - JWKS endpoint failures (fallback to cached keys)
//! - Unknown `kid` triggering an early background refresh
//! - Concurrent validation against a shared, warm cache

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use gatekeeper_auth::{
    AuthError, JwksKeyResolver, KeyResolver, RefreshOptions, TlsPolicy, TokenValidator,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Self-signed certificate for `localhost` and `127.0.0.1`
const TLS_CERT_PEM: &[u8] = include_bytes!("fixtures/tls-localhost-cert.pem");
const TLS_KEY_PEM: &[u8] = include_bytes!("fixtures/tls-localhost-key.pem");

fn fast_options() -> RefreshOptions {
    RefreshOptions {
        retry_interval: Duration::from_millis(100),
        min_refresh_interval: Duration::ZERO,
        init_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..RefreshOptions::default()
    }
}

/// Serve the primary key set over HTTPS with the self-signed fixture
/// certificate, returning its URL
async fn start_self_signed_jwks() -> String {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert = CertificateDer::from_pem_slice(TLS_CERT_PEM).unwrap();
    let key = PrivateKeyDer::from_pem_slice(TLS_KEY_PEM).unwrap();
    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = json!({ "keys": [primary_jwk()] }).to_string();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let body = body.clone();
            tokio::spawn(async move {
                // Verifying clients abort the handshake
                let Ok(mut stream) = acceptor.accept(stream).await else {
                    return;
                };

                let mut request = Vec::new();
                let mut buf = [0_u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let response = format!(
                    concat!(
                        "HTTP/1.1 200 OK\r\n",
                        "content-type: application/json\r\n",
                        "content-length: {}\r\n",
                        "connection: close\r\n\r\n{}"
                    ),
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("https://127.0.0.1:{port}/jwks")
}

#[tokio::test]
async fn test_initialize_fetches_keys() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk(), rotated_jwk()]).await;

    let resolver = JwksKeyResolver::initialize(&mock.jwks_endpoint, TlsPolicy::Verify)
        .await
        .unwrap();

    assert_eq!(resolver.key_ids(), vec![PRIMARY_KID, ROTATED_KID]);
    assert_eq!(resolver.jwks_uri(), mock.jwks_endpoint);
    assert!(resolver.resolve(PRIMARY_KID).is_ok());
    assert_eq!(
        resolver.resolve("unknown").unwrap_err(),
        AuthError::KeyNotFound("unknown".into())
    );
}

#[tokio::test]
async fn test_initialize_error_status_is_fatal() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks_status(503).await;

    let err = JwksKeyResolver::initialize(&mock.jwks_endpoint, TlsPolicy::Verify)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::KeyResolution(_)), "{err:?}");
}

#[tokio::test]
async fn test_initialize_times_out() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks_delayed(vec![primary_jwk()], Duration::from_secs(5))
        .await;

    let options = RefreshOptions {
        init_timeout: Duration::from_millis(200),
        ..RefreshOptions::default()
    };
    let started = std::time::Instant::now();
    let err = JwksKeyResolver::initialize_with(&mock.jwks_endpoint, TlsPolicy::Verify, options)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::KeyResolution(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_initialize_rejects_unusable_key_sets() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![json!({ "kty": "RSA", "n": "AQAB", "e": "AQAB" })])
        .await;

    let err = JwksKeyResolver::initialize(&mock.jwks_endpoint, TlsPolicy::Verify)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::KeyResolution(_)), "{err:?}");
}

#[tokio::test]
async fn test_initialize_rejects_bad_urls() {
    for url in ["", "   ", "not a url", "ftp://auth.example.com/jwks"] {
        let err = JwksKeyResolver::initialize(url, TlsPolicy::Verify)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)), "{url:?}: {err:?}");
    }
}

#[tokio::test]
async fn test_initialize_rejects_zero_intervals() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let options = RefreshOptions {
        refresh_interval: Duration::ZERO,
        ..fast_options()
    };
    let err = JwksKeyResolver::initialize_with(&mock.jwks_endpoint, TlsPolicy::Verify, options)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::Configuration(_)), "{err:?}");
    assert_eq!(mock.jwks_request_count().await, 0);
}

#[tokio::test]
async fn test_plain_http_in_cluster_url_passes_validation() {
    // Unresolvable host: the attempt gets as far as the fetch and fails there
    let options = RefreshOptions {
        init_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        ..RefreshOptions::default()
    };
    let err = JwksKeyResolver::initialize_with(
        "http://keycloak.auth.svc.invalid:8080/realms/r/protocol/openid-connect/certs",
        TlsPolicy::Verify,
        options,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AuthError::KeyResolution(_)), "{err:?}");
}

#[tokio::test]
async fn test_self_signed_endpoint_requires_insecure_policy() {
    let jwks_uri = start_self_signed_jwks().await;

    let err = JwksKeyResolver::initialize_with(&jwks_uri, TlsPolicy::Verify, fast_options())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::KeyResolution(_)), "{err:?}");

    let resolver =
        JwksKeyResolver::initialize_with(&jwks_uri, TlsPolicy::InsecureSkipVerify, fast_options())
            .await
            .unwrap();
    assert_eq!(resolver.key_ids(), vec![PRIMARY_KID]);
    assert!(resolver.resolve(PRIMARY_KID).is_ok());
}

#[tokio::test]
async fn test_insecure_config_toggle_reaches_transport() {
    let jwks_uri = start_self_signed_jwks().await;

    let mut config = test_config(&jwks_uri);
    config.insecure_skip_tls_verify = true;

    let resolver = JwksKeyResolver::initialize_with(&jwks_uri, config.tls_policy(), fast_options())
        .await
        .unwrap();
    assert_eq!(resolver.key_ids(), vec![PRIMARY_KID]);
}

#[tokio::test]
async fn test_refresh_picks_up_rotated_keys() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let resolver = JwksKeyResolver::initialize(&mock.jwks_endpoint, TlsPolicy::Verify)
        .await
        .unwrap();
    let first_fetch = resolver.fetched_at();

    mock.reset().await;
    mock.mock_jwks(vec![rotated_jwk()]).await;

    assert_eq!(resolver.refresh_now().await.unwrap(), 1);
    assert_eq!(resolver.key_ids(), vec![ROTATED_KID]);
    assert!(resolver.resolve(PRIMARY_KID).is_err());
    assert!(resolver.fetched_at() >= first_fetch);
}

#[tokio::test]
async fn test_failed_refresh_keeps_cached_keys() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let resolver = JwksKeyResolver::initialize(&mock.jwks_endpoint, TlsPolicy::Verify)
        .await
        .unwrap();

    mock.reset().await;
    mock.mock_jwks_status(503).await;

    assert!(resolver.refresh_now().await.is_err());
    assert!(resolver.resolve(PRIMARY_KID).is_ok());
}

#[tokio::test]
async fn test_scheduled_refresh_rotates_in_background() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let options = RefreshOptions {
        refresh_interval: Duration::from_millis(100),
        ..fast_options()
    };
    let resolver =
        JwksKeyResolver::initialize_with(&mock.jwks_endpoint, TlsPolicy::Verify, options)
            .await
            .unwrap();

    mock.reset().await;
    mock.mock_jwks(vec![primary_jwk(), rotated_jwk()]).await;

    let rotated = eventually(Duration::from_secs(5), || {
        resolver.resolve(ROTATED_KID).is_ok()
    })
    .await;
    assert!(rotated, "rotated key never appeared");
}

#[tokio::test]
async fn test_unknown_kid_triggers_background_refresh() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let resolver =
        JwksKeyResolver::initialize_with(&mock.jwks_endpoint, TlsPolicy::Verify, fast_options())
            .await
            .unwrap();

    mock.reset().await;
    mock.mock_jwks(vec![primary_jwk(), rotated_jwk()]).await;

    // The miss itself fails immediately; the refresh happens behind it
    assert!(matches!(
        resolver.resolve(ROTATED_KID),
        Err(AuthError::KeyNotFound(_))
    ));

    let rotated = eventually(Duration::from_secs(5), || {
        resolver.key_ids().contains(&ROTATED_KID.to_string())
    })
    .await;
    assert!(rotated, "unknown kid did not trigger a refresh");
}

#[tokio::test]
async fn test_unknown_kid_refresh_is_rate_limited() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let options = RefreshOptions {
        min_refresh_interval: Duration::from_secs(60),
        ..fast_options()
    };
    let resolver =
        JwksKeyResolver::initialize_with(&mock.jwks_endpoint, TlsPolicy::Verify, options)
            .await
            .unwrap();
    assert_eq!(mock.jwks_request_count().await, 1);

    for _ in 0..50 {
        assert!(resolver.resolve("attacker-chosen-kid").is_err());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(mock.jwks_request_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_validations_share_warm_cache() {
    let mock = MockAuthServer::start().await;
    mock.mock_jwks(vec![primary_jwk()]).await;

    let config = Arc::new(test_config(&mock.jwks_endpoint));
    let resolver = JwksKeyResolver::initialize(&mock.jwks_endpoint, TlsPolicy::Verify)
        .await
        .unwrap();
    let validator = Arc::new(TokenValidator::new(config, Arc::new(resolver)));

    let mut handles = Vec::new();
    for i in 0..32_i64 {
        let validator = Arc::clone(&validator);
        handles.push(tokio::spawn(async move {
            let mut claims = valid_claims(300);
            claims["sub"] = json!(format!("user-{i}"));
            if i % 2 == 1 {
                claims["iss"] = json!("https://evil.example.com");
            }
            let token = primary_token(&claims);
            (i, validator.validate(&token))
        }));
    }

    for handle in handles {
        let (i, result) = handle.await.unwrap();
        if i % 2 == 0 {
            let claims = result.unwrap();
            assert_eq!(claims.subject, Some(format!("user-{i}")));
        } else {
            assert!(matches!(result, Err(AuthError::TokenIssuerMismatch(_))));
        }
    }

    assert_eq!(mock.jwks_request_count().await, 1);
}
