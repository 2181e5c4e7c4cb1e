//! HS256 bearer tokens and the revocation blacklist.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

const BLACKLIST_PREFIX: &str = "jwt:blacklist:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Numeric user id, as a string.
    pub sub: String,
    pub guard: String,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token guard mismatch")]
    GuardMismatch,
    #[error("token subject is not a user id")]
    BadSubject,
}

/// Sign a token for `user_id` valid for `ttl_secs`.
pub fn issue_token(
    secret: &str,
    guard: &str,
    user_id: i64,
    ttl_secs: i64,
) -> Result<String, TokenError> {
    let claims = Claims {
        sub: user_id.to_string(),
        guard: guard.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Verify signature, expiry and guard, returning the user id.
pub fn verify_token(secret: &str, guard: &str, token: &str) -> Result<i64, TokenError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;

    if data.claims.guard != guard {
        return Err(TokenError::GuardMismatch);
    }
    data.claims
        .sub
        .parse::<i64>()
        .map_err(|_| TokenError::BadSubject)
}

pub async fn is_blacklisted(kv: &dyn KeyValueStore, token: &str) -> Result<bool, StoreError> {
    Ok(kv.get(&format!("{BLACKLIST_PREFIX}{token}")).await?.is_some())
}

/// Revoke `token` for `ttl_secs`, normally its remaining lifetime.
pub async fn blacklist_token(
    kv: &dyn KeyValueStore,
    token: &str,
    ttl_secs: u64,
) -> Result<(), StoreError> {
    kv.set_ex(&format!("{BLACKLIST_PREFIX}{token}"), "1", ttl_secs)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    const SECRET: &str = "test-secret";

    #[test]
    fn issued_token_verifies() {
        let token = issue_token(SECRET, "api", 2054, 60).unwrap();
        assert_eq!(verify_token(SECRET, "api", &token).unwrap(), 2054);
    }

    #[test]
    fn wrong_guard_is_rejected() {
        let token = issue_token(SECRET, "admin", 1, 60).unwrap();
        assert!(matches!(
            verify_token(SECRET, "api", &token),
            Err(TokenError::GuardMismatch)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token("other", "api", 1, 60).unwrap();
        assert!(matches!(
            verify_token(SECRET, "api", &token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue_token(SECRET, "api", 1, -3600).unwrap();
        assert!(verify_token(SECRET, "api", &token).is_err());
    }

    #[tokio::test]
    async fn blacklist_round_trip() {
        let kv = MemoryStore::new();
        assert!(!is_blacklisted(&kv, "t").await.unwrap());
        blacklist_token(&kv, "t", 60).await.unwrap();
        assert!(is_blacklisted(&kv, "t").await.unwrap());
    }
}
