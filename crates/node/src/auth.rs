// Connection token validation.
//
// Clients present a short-lived HS256 JWT on the WebSocket query string.
// The token's subject must match the claimed user id; anything else is
// rejected before the upgrade.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token subject does not match the claimed user")]
    SubjectMismatch,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and return its subject (the user id).
    pub fn validate(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        Ok(data.claims.sub)
    }

    /// Validate and additionally require the subject to equal `user_id`.
    pub fn validate_for_user(&self, token: &str, user_id: &str) -> Result<(), AuthError> {
        let subject = self.validate(token)?;
        if subject != user_id {
            return Err(AuthError::SubjectMismatch);
        }
        Ok(())
    }

    /// Issue a token for a user. Used by tests and local tooling; in
    /// production tokens come from the auth service sharing this secret.
    pub fn issue(&self, user_id: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let exp = (chrono::Utc::now().timestamp() + ttl_secs).max(0) as usize;
        let claims = Claims { sub: user_id.to_string(), exp };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}
