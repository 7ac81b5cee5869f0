use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiException, ErrorCode},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub exp: i64,
}

/// External credential verifier: resolves an opaque bearer token into a user
/// identity or fails. Token issuance lives elsewhere; this side only checks.
pub struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ApiException> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| ApiException::new(ErrorCode::AuthenticationFailed, "invalid token"))?;
        Ok(UserId(data.claims.id))
    }
}

/// Credential extraction order at the handshake: Authorization header, then
/// `token` cookie, then `token` query parameter. First non-empty wins.
pub fn extract_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(value) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in value.split(';') {
            if let Some(token) = pair.trim().strip_prefix("token=") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    query_token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
