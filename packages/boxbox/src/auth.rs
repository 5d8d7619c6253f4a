//! Authentication: HS256 bearer tokens resolved against the user directory.
//!
//! Handlers that need a signed-in, active user take an [`AuthUser`]
//! argument. Rejections use `{"detail": ...}` bodies so existing clients of
//! the REST API keep working.

use axum::{
    Json,
    extract::{FromRef, FromRequestParts},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::AuthConfig;
use crate::db::{Database, User};

// =============================================================================
// Tokens
// =============================================================================

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a decimal string
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

pub fn create_access_token(user_id: i64, secret: &str, ttl: Duration) -> Result<String, AuthError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| AuthError::Internal(e.to_string()))?;
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Internal(format!("failed to sign token: {e}")))
}

/// Verify the signature and expiry, returning the user id in `sub`.
pub fn verify_access_token(token: &str, secret: &str) -> Result<i64, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        warn!("JWT validation error: {}", e);
        AuthError::InvalidCredentials
    })?;

    data.claims.sub.parse().map_err(|_| {
        warn!("Invalid token payload: sub is not a user id");
        AuthError::InvalidCredentials
    })
}

// =============================================================================
// AuthUser
// =============================================================================

/// Authenticated, active user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
    pub is_superuser: bool,
}

impl From<User> for AuthUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            is_superuser: user.is_superuser,
        }
    }
}

// =============================================================================
// Auth Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Could not validate credentials")]
    InvalidCredentials,
    #[error("Inactive user")]
    InactiveUser,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            AuthError::InvalidCredentials => {
                let mut resp = (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "detail": self.to_string() })),
                )
                    .into_response();
                resp.headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                resp
            }
            AuthError::InactiveUser => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "detail": self.to_string() })),
            )
                .into_response(),
            AuthError::Internal(e) => {
                tracing::error!("auth failure: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "detail": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

// =============================================================================
// Auth State (shared with the extractor through FromRef)
// =============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub db: Arc<Database>,
    pub auth_config: Arc<AuthConfig>,
}

impl AuthState {
    /// Resolve a bearer token to an active user.
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser, AuthError> {
        let user_id = verify_access_token(token, &self.auth_config.secret_key)?;

        let user = self
            .db
            .get_user(user_id)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or_else(|| {
                warn!("User not found: {}", user_id);
                AuthError::InvalidCredentials
            })?;

        if !user.is_active {
            warn!("Inactive user: {}", user_id);
            return Err(AuthError::InactiveUser);
        }
        Ok(user.into())
    }
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Extract an active AuthUser from `Authorization: Bearer <token>`.
impl<S> FromRequestParts<S> for AuthUser
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AuthError::InvalidCredentials)?;

        AuthState::from_ref(state)
            .authenticate(bearer.token())
            .await
    }
}
