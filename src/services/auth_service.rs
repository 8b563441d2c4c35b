use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,          // user id
    pub workspace_id: Uuid, // workspace the token is scoped to
    pub role: String,
    pub exp: i64,           // expiration timestamp
    pub iat: i64,           // issued at timestamp
}

/// Issues and validates workspace-scoped access tokens (HS256)
#[derive(Clone)]
pub struct AuthService {
    secret: SecretString,
}

impl AuthService {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Generate JWT access token
    pub fn issue_token(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        role: &str,
        ttl: Duration,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            workspace_id,
            role: role.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Token encoding failed: {e}")))
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized)?;

        Ok(token_data.claims)
    }
}
