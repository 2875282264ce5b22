use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AdmissionError;
use crate::repo::UserId;
use crate::store::KeyValueStore;

/// Access token claims. `sub` carries the numeric user ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Token ID, checked against the revocation list.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> Result<UserId, AdmissionError> {
        self.sub.parse().map_err(|_| AdmissionError::InvalidToken)
    }
}

/// Issue an HS256 access token.
pub fn issue_access_token(
    secret: &[u8],
    user_id: UserId,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        jti: Uuid::now_v7().to_string(),
        iat: now,
        exp: now + ttl.as_secs() as i64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

pub fn validate_access_token(
    secret: &[u8],
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}

pub fn revocation_key(jti: &str) -> String {
    format!("revoked:{jti}")
}

/// Mark a token ID as revoked until its natural expiry.
pub async fn revoke(
    store: &dyn KeyValueStore,
    jti: &str,
    remaining: Duration,
) -> Result<(), AdmissionError> {
    store.set_ex(&revocation_key(jti), "1", remaining).await?;
    Ok(())
}

/// Validate a bearer token and reject revoked ones.
pub async fn authenticate_bearer(
    secret: &[u8],
    store: &dyn KeyValueStore,
    token: &str,
) -> Result<UserId, AdmissionError> {
    let claims = validate_access_token(secret, token).map_err(|e| {
        tracing::debug!(error = %e, "Bearer token rejected");
        AdmissionError::InvalidToken
    })?;
    if store.exists(&revocation_key(&claims.jti)).await? {
        return Err(AdmissionError::Revoked);
    }
    claims.user_id()
}
