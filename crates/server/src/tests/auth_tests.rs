use super::*;
use axum::http::HeaderValue;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};

fn mint(secret: &str, id: i64, ttl_seconds: i64) -> String {
    let claims = Claims {
        id,
        exp: (Utc::now() + Duration::seconds(ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token")
}

#[test]
fn verify_resolves_the_embedded_identity() {
    let verifier = JwtVerifier::new("secret");
    let token = mint("secret", 42, 60);
    assert_eq!(verifier.verify(&token).expect("identity"), UserId(42));
}

#[test]
fn verify_rejects_wrong_secret_and_expired_tokens() {
    let verifier = JwtVerifier::new("secret");

    let forged = mint("other-secret", 42, 60);
    let err = verifier.verify(&forged).expect_err("forged");
    assert!(matches!(err.code, ErrorCode::AuthenticationFailed));

    let stale = mint("secret", 42, -300);
    let err = verifier.verify(&stale).expect_err("expired");
    assert!(matches!(err.code, ErrorCode::AuthenticationFailed));
}

#[test]
fn header_wins_over_cookie_and_query() {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_static("Bearer from-header"),
    );
    headers.insert(
        header::COOKIE,
        HeaderValue::from_static("theme=dark; token=from-cookie"),
    );

    assert_eq!(
        extract_credential(&headers, Some("from-query")).as_deref(),
        Some("from-header")
    );
}

#[test]
fn cookie_wins_over_query_when_header_is_absent() {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::COOKIE,
        HeaderValue::from_static("theme=dark; token=from-cookie; lang=en"),
    );

    assert_eq!(
        extract_credential(&headers, Some("from-query")).as_deref(),
        Some("from-cookie")
    );
}

#[test]
fn query_is_the_last_resort() {
    let headers = HeaderMap::new();
    assert_eq!(
        extract_credential(&headers, Some("from-query")).as_deref(),
        Some("from-query")
    );
    assert_eq!(extract_credential(&headers, Some("   ")), None);
    assert_eq!(extract_credential(&headers, None), None);
}
