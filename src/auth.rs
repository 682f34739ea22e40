use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// JWT Tokens
// ---------------------------------------------------------------------------

/// Claims carried by a meshcast access token.
///
/// Token issuance lives outside this service; we only validate. The claims
/// shape is part of the contract with the issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User ID.
    pub sub: String,
    /// Peer ID the token was issued for. When present, the signaling plane
    /// requires it to match the `peer_id` query parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Expiration (unix timestamp).
    pub exp: usize,
    /// Issued-at (unix timestamp).
    pub iat: usize,
}

/// Create a signed JWT.  Used by tests and by deployments that co-locate
/// the issuer; production issuance is an external collaborator.
pub fn create_token(
    secret: &str,
    user_id: &str,
    peer_id: Option<&str>,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();

    let claims = TokenClaims {
        sub: user_id.to_string(),
        peer_id: peer_id.map(str::to_string),
        exp: (now + ttl_secs) as usize,
        iat: now as usize,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify and decode a JWT, returning the inner claims.
pub fn verify_token(
    secret: &str,
    token: &str,
) -> Result<TokenClaims, jsonwebtoken::errors::Error> {
    let token_data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(), // HS256 + exp validation
    )?;
    Ok(token_data.claims)
}

// ---------------------------------------------------------------------------
// Axum helper -- bearer-token gate
// ---------------------------------------------------------------------------

/// Validate the `Authorization: Bearer <jwt>` header.
///
/// Returns the decoded [`TokenClaims`] or an [`ApiError`].
pub fn require_bearer(
    headers: &axum::http::HeaderMap,
    secret: &str,
) -> Result<TokenClaims, ApiError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::auth_header_missing)?;

    let token = auth
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::auth_header_missing)?;

    verify_token(secret, token).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::token_expired(),
        _ => ApiError::token_invalid(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
