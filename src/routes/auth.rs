//! Session token extractor for the authenticated endpoints.
//!
//! The token is an HS256 JWT read from the session cookie, or from an
//! `Authorization: Bearer` header for non-browser clients. Issuing tokens is
//! somebody else's job; this side only validates them.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::reply::ApiError;
use super::AppState;
use crate::models::OwnerId;

// ---

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    // ---
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub pseudo: Option<String>,
    pub exp: usize,
}

/// The caller of an authenticated endpoint.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: OwnerId,
    pub login: String,
    pub pseudo: Option<String>,
}

impl AuthUser {
    /// Display name for logs: the pseudo when the token carries one.
    pub fn name(&self) -> &str {
        self.pseudo.as_deref().unwrap_or(&self.login)
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        // ---
        let token = session_token(parts, &state.config.cookie_name)
            .ok_or(ApiError::Unauthorized("missing session token"))?;
        let claims = validate(&token, &state.config.jwt_secret)?;

        let id = Uuid::try_parse(&claims.id)
            .map_err(|_| ApiError::Unauthorized("invalid session token"))?;
        Ok(AuthUser {
            id,
            login: claims.login,
            pseudo: claims.pseudo,
        })
    }
}

pub fn validate(token: &str, secret: &str) -> Result<Claims, ApiError> {
    // ---
    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(secret.as_bytes());
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            debug!("Rejected session token: {}", e);
            ApiError::Unauthorized("invalid session token")
        })
}

/// Cookie first, then bearer header.
fn session_token(parts: &Parts, cookie_name: &str) -> Option<String> {
    // ---
    let from_cookie = parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.to_string());

    from_cookie.or_else(|| {
        parts
            .headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(|t| t.trim().to_string())
    })
}
