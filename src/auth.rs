//! Authentication
//!
//! - Argon2 password hashing
//! - HS256 bearer tokens carrying the user id

use std::time::Duration;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};

/// Hash a password into a PHC string with a random salt
pub fn hash_password(password: &str) -> LedgerResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| LedgerError::InvariantViolation(format!("password hashing failed: {}", e)))
}

/// Check a password against a stored PHC string
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let parsed = match PasswordHash::new(password_hash) {
        Ok(h) => h,
        Err(e) => {
            debug!("Stored password hash is not a PHC string: {}", e);
            return false;
        }
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub exp: i64,
}

/// Issues and verifies bearer tokens
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user_id: i64) -> LedgerResult<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| LedgerError::InvariantViolation(format!("token encoding failed: {}", e)))
    }

    /// Returns the user id carried by a valid, unexpired token
    pub fn verify(&self, token: &str) -> Option<i64> {
        match decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256)) {
            Ok(data) => data.claims.sub.parse().ok(),
            Err(e) => {
                debug!("Token rejected: {}", e);
                None
            }
        }
    }
}
