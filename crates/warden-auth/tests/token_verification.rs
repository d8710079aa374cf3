//! # Server-side verification against a rotating key set
//!
//! Exercises `KeySetCache` + `TokenVerifier` + `AuthGate` together with the
//! shared RSA fixtures from `warden_auth::testutil`.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use warden_auth::testutil::{self, AUDIENCE, CountingSource, ISSUER};
use warden_auth::{
    AuthGate, Claim, HttpKeySetSource, JwkSet, KeyCacheOptions, KeyLookupError, KeySetCache,
    Rejection, TokenVerifier, VerificationResult,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn verifier(
    source: &Arc<CountingSource>,
    options: KeyCacheOptions,
) -> TokenVerifier<Arc<CountingSource>> {
    TokenVerifier::new(Arc::new(KeySetCache::with_options(
        Arc::clone(source),
        options,
    )))
}

fn rejection(result: VerificationResult) -> Rejection {
    match result {
        VerificationResult::Rejected(reason) => reason,
        VerificationResult::Valid(claims) => panic!("expected rejection, got {claims:?}"),
    }
}

// ---------------------------------------------------------------------------
// Verification properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valid_token_yields_its_claims() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    let verifier = verifier(&source, KeyCacheOptions::default());

    let token = testutil::sign_primary(&testutil::claims(300));
    let claims = verifier
        .verify(&token, ISSUER, AUDIENCE)
        .await
        .into_result()
        .expect("valid");

    assert_eq!(claims.sub.as_deref(), Some(testutil::SUBJECT));
    assert_eq!(claims.scopes(), vec!["openid", "profile", "email"]);
}

#[tokio::test]
async fn expired_token_is_rejected_on_expiry() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    let verifier = verifier(&source, KeyCacheOptions::default());

    let token = testutil::sign_primary(&testutil::claims(-3600));
    assert_eq!(
        rejection(verifier.verify(&token, ISSUER, AUDIENCE).await),
        Rejection::ClaimInvalid(Claim::Expiry)
    );
}

#[tokio::test]
async fn token_for_another_api_is_rejected_on_audience() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    let verifier = verifier(&source, KeyCacheOptions::default());

    // Issued for TheSweetestAPI, presented to OtherAPI.
    let token = testutil::sign_primary(&testutil::claims(300));
    assert_eq!(
        rejection(verifier.verify(&token, ISSUER, "OtherAPI").await),
        Rejection::ClaimInvalid(Claim::Audience)
    );
    assert!(verifier.verify(&token, ISSUER, AUDIENCE).await.is_valid());
}

#[tokio::test]
async fn token_signed_by_unpublished_key_never_verifies() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    let verifier = verifier(&source, KeyCacheOptions::default());

    // Right kid, wrong private key.
    let forged = testutil::sign_with(
        testutil::PRIMARY_KID,
        testutil::ROTATED_PRIVATE_PEM,
        &testutil::claims(300),
    );
    assert_eq!(
        rejection(verifier.verify(&forged, ISSUER, AUDIENCE).await),
        Rejection::BadSignature
    );

    // Unknown kid.
    let unknown = testutil::sign_rotated(&testutil::claims(300));
    assert_eq!(
        rejection(verifier.verify(&unknown, ISSUER, AUDIENCE).await),
        Rejection::KeyUnavailable(KeyLookupError::NotFound)
    );
}

// ---------------------------------------------------------------------------
// Key rotation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rotated_key_is_picked_up_on_miss() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    let verifier = verifier(&source, KeyCacheOptions::default());

    let old = testutil::sign_primary(&testutil::claims(300));
    assert!(verifier.verify(&old, ISSUER, AUDIENCE).await.is_valid());

    source.publish(testutil::rotated_key_set());
    let new = testutil::sign_rotated(&testutil::claims(300));
    assert!(verifier.verify(&new, ISSUER, AUDIENCE).await.is_valid());
    assert_eq!(source.fetch_count(), 2);

    // The old key left the published set with the swap.
    assert_eq!(
        rejection(verifier.verify(&old, ISSUER, AUDIENCE).await),
        Rejection::KeyUnavailable(KeyLookupError::NotFound)
    );
}

#[tokio::test]
async fn invalidation_refetches_after_rotation() {
    let source = Arc::new(CountingSource::new(JwkSet {
        keys: vec![
            testutil::rsa_jwk(testutil::PRIMARY_KID, testutil::PRIMARY_N),
            testutil::rsa_jwk(testutil::ROTATED_KID, testutil::ROTATED_N),
        ],
    }));
    let verifier = verifier(&source, KeyCacheOptions::default());
    let new = testutil::sign_rotated(&testutil::claims(300));
    assert!(verifier.verify(&new, ISSUER, AUDIENCE).await.is_valid());

    // Provider retires the primary key; a known rotation invalidates the cache.
    source.publish(testutil::rotated_key_set());
    verifier.key_cache().invalidate().await;

    let old = testutil::sign_primary(&testutil::claims(300));
    assert!(!verifier.verify(&old, ISSUER, AUDIENCE).await.is_valid());
    assert!(verifier.verify(&new, ISSUER, AUDIENCE).await.is_valid());
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(verifier.key_cache().len().await, 1);
}

#[tokio::test]
async fn certificate_form_key_verifies() {
    let source = Arc::new(CountingSource::new(JwkSet {
        keys: vec![testutil::certificate_jwk(testutil::ROTATED_KID)],
    }));
    let verifier = verifier(&source, KeyCacheOptions::default());

    let token = testutil::sign_rotated(&testutil::claims(300));
    assert!(verifier.verify(&token, ISSUER, AUDIENCE).await.is_valid());
}

// ---------------------------------------------------------------------------
// Fetch protection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_kid_flood_is_rate_limited() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    let verifier = verifier(&source, KeyCacheOptions::default());

    let mut rate_limited = 0;
    for i in 0..20 {
        let token = testutil::sign_with(
            &format!("attacker-{i}"),
            testutil::PRIMARY_PRIVATE_PEM,
            &testutil::claims(300),
        );
        let reason = rejection(verifier.verify(&token, ISSUER, AUDIENCE).await);
        if reason == Rejection::KeyUnavailable(KeyLookupError::RateLimited) {
            rate_limited += 1;
        }
    }

    assert_eq!(source.fetch_count(), 5);
    assert_eq!(rate_limited, 15);

    // Legitimate traffic keeps verifying from cache.
    let token = testutil::sign_primary(&testutil::claims(300));
    assert!(verifier.verify(&token, ISSUER, AUDIENCE).await.is_valid());
}

#[tokio::test]
async fn concurrent_requests_on_cold_cache_fetch_once() {
    let source = Arc::new(
        CountingSource::new(testutil::primary_key_set()).with_delay(Duration::from_millis(50)),
    );
    let verifier = Arc::new(verifier(&source, KeyCacheOptions::default()));
    let token = Arc::new(testutil::sign_primary(&testutil::claims(300)));

    let requests: Vec<_> = (0..32)
        .map(|_| {
            let verifier = Arc::clone(&verifier);
            let token = Arc::clone(&token);
            tokio::spawn(async move { verifier.verify(&token, ISSUER, AUDIENCE).await })
        })
        .collect();

    for request in requests {
        assert!(request.await.expect("join").is_valid());
    }
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn fetch_failure_fails_closed() {
    let source = Arc::new(CountingSource::new(testutil::primary_key_set()));
    source.set_failing(true);
    let verifier = verifier(&source, KeyCacheOptions::default());

    let token = testutil::sign_primary(&testutil::claims(300));
    assert!(matches!(
        rejection(verifier.verify(&token, ISSUER, AUDIENCE).await),
        Rejection::KeyUnavailable(KeyLookupError::FetchFailed(_))
    ));
}

// ---------------------------------------------------------------------------
// Over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gate_authenticates_against_http_jwks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [testutil::rsa_jwk(testutil::PRIMARY_KID, testutil::PRIMARY_N)],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = HttpKeySetSource::new(
        format!("{}/.well-known/jwks.json", server.uri()),
        Duration::from_secs(5),
    )
    .expect("source");
    let verifier = TokenVerifier::new(Arc::new(KeySetCache::new(source)));
    let gate = AuthGate::new(Arc::new(verifier), ISSUER, AUDIENCE);

    let token = testutil::sign_primary(&testutil::claims(300));
    for _ in 0..3 {
        let ctx = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .await
            .expect("authenticated");
        assert_eq!(ctx.subject(), Some(testutil::SUBJECT));
    }
    assert!(gate.authenticate(Some("Bearer nope")).await.is_err());
}
