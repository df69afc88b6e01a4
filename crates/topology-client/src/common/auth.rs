//! Request signing for the heketi API
//!
//! heketi authenticates every request with an HS256 JWT whose `qsh` claim
//! binds the token to the request method and path.

use crate::error::TopologyError;
use crate::models::Claims;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifetime of a signed token in seconds
const TOKEN_TTL_SECS: u64 = 300;

/// Hex SHA-256 of `"<METHOD>&<path>"`.
pub fn query_hash(method: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{method}&{path}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the `Authorization` header value for one request.
pub fn bearer_token(user: &str, key: &str, method: &str, path: &str) -> Result<String, TopologyError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| TopologyError::Authentication(format!("system clock before epoch: {e}")))?
        .as_secs();

    let claims = Claims {
        iss: user.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
        qsh: query_hash(method, path),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .map_err(|e| TopologyError::Authentication(format!("failed to sign request: {e}")))?;

    Ok(format!("bearer {token}"))
}
