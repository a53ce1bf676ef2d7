//! Bearer-token authentication.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApiError;
use crate::routes::AppState;

const TOKEN_COOKIE: &str = "token";

/// Claims issued by the login service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    #[serde(default)]
    pub email: String,
    pub exp: usize,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized: no valid user token found")]
    Missing,

    #[error("Token has expired")]
    Expired,

    #[error("Invalid token")]
    Invalid,
}

/// Verify an HS256 token and its expiry.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => {
                tracing::debug!("Token rejected: {}", e);
                AuthError::Invalid
            }
        })
}

/// `Authorization: Bearer <token>`, else the `token` cookie.
fn token_from_parts(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

/// Authenticated caller. Rejects with 401 before the handler body runs.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn email(&self) -> &str {
        &self.0.email
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or(AuthError::Missing)?;
        let claims = decode_token(&token, &state.settings.secret_key)?;
        Ok(AuthUser(claims))
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use super::Claims;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub fn issue(secret: &str, id: &str, email: &str, exp: usize) -> String {
        let claims = Claims {
            id: id.to_string(),
            email: email.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    pub fn valid(secret: &str, id: &str) -> String {
        let exp = chrono::Utc::now().timestamp() as usize + 3600;
        issue(secret, id, &format!("{}@example.com", id), exp)
    }

    pub fn expired(secret: &str, id: &str) -> String {
        let exp = chrono::Utc::now().timestamp() as usize - 3600;
        issue(secret, id, &format!("{}@example.com", id), exp)
    }
}
