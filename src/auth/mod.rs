//! Authentication collaborators.
//!
//! The auth backend is modeled as a single capability: given a Cookie
//! header, resolve a user id. Cookie parsing and token validation live
//! here and nowhere else. The task API uses separate opaque bearer keys.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::user::UserRepository;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("no admin user configured")]
    NoAdminUser,

    #[error("auth backend error: {0}")]
    Internal(String),
}

/// JWT claims carried by the auth cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Disable authentication: every connection resolves to the first
    /// admin user.
    pub disabled: bool,
    /// HMAC secret for validating the auth cookie.
    pub jwt_secret: Option<String>,
    /// Cookie carrying the token.
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            jwt_secret: None,
            cookie_name: "auth_token".to_string(),
        }
    }
}

/// Extract a named cookie's value from a Cookie header.
fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Extract a Bearer token from an Authorization header value.
pub fn bearer_token_from_header(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = parts.next()?;
    if token.is_empty() || parts.next().is_some() {
        return None;
    }

    Some(token)
}

/// Resolves a Cookie header to a user id.
#[derive(Clone)]
pub struct AuthResolver {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
    users: UserRepository,
}

impl AuthResolver {
    pub fn new(config: AuthConfig, users: UserRepository) -> Self {
        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
            users,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    /// Resolve the Cookie header of an incoming request to a user id.
    pub async fn resolve_user(&self, cookie_header: Option<&str>) -> Result<String, AuthError> {
        if self.config.disabled {
            let admin = self
                .users
                .first_admin()
                .await
                .map_err(|e| AuthError::Internal(e.to_string()))?
                .ok_or(AuthError::NoAdminUser)?;
            return Ok(admin.id);
        }

        let header = cookie_header.ok_or(AuthError::MissingCredentials)?;
        let token = token_from_cookie_header(header, &self.config.cookie_name)
            .ok_or(AuthError::MissingCredentials)?;

        let claims = self.validate_token(token)?;
        Ok(claims.sub)
    }

    fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("token validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Mint a token for a user (used by tests and local tooling).
    pub fn generate_token(&self, user_id: &str) -> Result<String, AuthError> {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let claims = Claims {
            sub: user_id.to_string(),
            exp: chrono::Utc::now().timestamp() + 3600 * 24,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Opaque bearer keys for the task delegation API.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: Arc<Vec<String>>,
}

impl ApiKeys {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }

    /// Check an Authorization header against the configured keys.
    pub fn authorize(&self, authorization_header: Option<&str>) -> bool {
        let Some(header) = authorization_header else {
            return false;
        };
        let Some(token) = bearer_token_from_header(header) else {
            return false;
        };
        self.keys.iter().any(|key| key == token)
    }
}
