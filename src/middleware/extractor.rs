use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::{models::Actor, AppState};

/// Authenticated user extracted from JWT token. Every query a handler makes
/// is scoped to `workspace_id`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn actor(&self) -> Actor {
        Actor::User(self.id)
    }
}

/// Extractor rejection type
#[derive(Debug)]
pub enum AuthError {
    Unauthorized(String),
    Forbidden(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AuthError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| AuthError::Unauthorized("Missing Authorization header".to_string()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::Unauthorized("Invalid Authorization header format".to_string()))?;

        let claims = state
            .auth
            .validate_token(token)
            .map_err(|_| AuthError::Unauthorized("Invalid or expired token".to_string()))?;

        Ok(AuthUser {
            id: claims.sub,
            workspace_id: claims.workspace_id,
            role: claims.role,
        })
    }
}

/// Admin-only user extractor
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

impl<S> FromRequestParts<S> for AdminUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_user: AuthUser = AuthUser::from_request_parts(parts, state).await?;

        if !auth_user.is_admin() {
            return Err(AuthError::Forbidden("Admin access required".to_string()));
        }

        Ok(AdminUser(auth_user))
    }
}
