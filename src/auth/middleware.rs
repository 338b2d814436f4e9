//! Request guards: bearer auth, internal service key, webhook signatures.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use super::jwt::TokenValidator;

type HmacSha256 = Hmac<Sha256>;

/// Authenticated user attached to the request extensions.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug)]
pub enum AuthError {
    Unauthorized,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Validates the user bearer token and exposes the claims to handlers.
///
/// WebSocket upgrades cannot set headers from browsers, so a `token` query
/// parameter is accepted as an alternative carrier.
pub async fn require_auth(
    State(validator): State<Arc<TokenValidator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    });
    let token_from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string);

    let token = token_from_query
        .or(token_from_header)
        .ok_or(AuthError::Unauthorized)?;
    let claims = validator
        .validate(&token)
        .map_err(|_| AuthError::Unauthorized)?;

    req.extensions_mut().insert(AuthedUser {
        user_id: claims.user_id().to_string(),
        role: claims.role.clone(),
    });
    Ok(next.run(req).await)
}

/// Guards the service-to-service surface with the shared internal key.
pub async fn require_internal_key(
    State(internal_key): State<Arc<String>>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let provided = req
        .headers()
        .get("X-Internal-Key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() || provided != internal_key.as_str() {
        return Err(AuthError::Forbidden);
    }
    Ok(next.run(req).await)
}

/// Verifies a provider webhook body against its hex HMAC-SHA256 signature.
///
/// An empty configured secret disables verification (development mode).
/// `Mac::verify_slice` performs the constant-time comparison.
pub fn verify_webhook_signature(
    headers: &HeaderMap,
    header_name: &str,
    body: &[u8],
    secret: &str,
) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(signature) = headers.get(header_name).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature.trim().to_lowercase()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}
