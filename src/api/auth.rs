// =============================================================================
// Bearer Token Authentication — Axum Extractor
// =============================================================================
//
// Every request outside /health carries `Authorization: Bearer <jwt>`. The
// engine does not verify signatures (token issuance and verification belong
// to the auth service in front of it); it decodes the payload segment and
// requires a non-empty `sub` claim, which is the user id. A `role` claim of
// `service_role` marks the caller as an admin.
//
// Usage as an Axum extractor:
//
//   async fn handler(auth: AuthUser, ...) { ... }
//
// A missing or malformed token short-circuits the request with 401 before
// the handler body executes.
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::warn;

use crate::error::ApiError;

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub is_admin: bool,
}

/// Decode the payload segment of a JWT and extract (user id, is_admin).
///
/// Only structural validation is performed here: three dot-separated
/// segments, base64url payload, JSON object with a non-empty `sub`.
pub fn decode_claims(token: &str) -> Result<AuthUser, String> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err("token is not a three-segment JWT".to_string());
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| format!("token payload is not valid base64url: {e}"))?;

    let claims: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| format!("token payload is not valid JSON: {e}"))?;

    let user_id = claims["sub"]
        .as_str()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "token payload has no sub claim".to_string())?;

    let is_admin = claims["role"].as_str() == Some("service_role");

    Ok(AuthUser { user_id, is_admin })
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(ApiError::Auth(
                    "missing or invalid authorization token".to_string(),
                ));
            }
        };

        decode_claims(token).map_err(|e| {
            warn!(error = %e, "rejected bearer token");
            ApiError::Auth(e)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod tests {
    use super::test_tokens::token_for;
    use super::*;

    #[test]
    fn valid_token_yields_user() {
        let token = token_for(serde_json::json!({ "sub": "user-123" }));
        let auth = decode_claims(&token).unwrap();
        assert_eq!(auth.user_id, "user-123");
        assert!(!auth.is_admin);
    }

    #[test]
    fn service_role_is_admin() {
        let token = token_for(serde_json::json!({ "sub": "ops", "role": "service_role" }));
        let auth = decode_claims(&token).unwrap();
        assert!(auth.is_admin);
    }

    #[test]
    fn other_roles_are_not_admin() {
        let token = token_for(serde_json::json!({ "sub": "u1", "role": "authenticated" }));
        assert!(!decode_claims(&token).unwrap().is_admin);
    }

    #[test]
    fn missing_sub_rejected() {
        let token = token_for(serde_json::json!({ "role": "authenticated" }));
        assert!(decode_claims(&token).is_err());
    }

    #[test]
    fn empty_sub_rejected() {
        let token = token_for(serde_json::json!({ "sub": "" }));
        assert!(decode_claims(&token).is_err());
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(decode_claims("").is_err());
        assert!(decode_claims("onesegment").is_err());
        assert!(decode_claims("a.b").is_err());
        assert!(decode_claims("a.b.c.d").is_err());
        assert!(decode_claims("x.!!!not-base64!!!.z").is_err());
    }

    #[test]
    fn non_json_payload_rejected() {
        let payload = URL_SAFE_NO_PAD.encode(b"not json");
        assert!(decode_claims(&format!("h.{payload}.s")).is_err());
    }
}
