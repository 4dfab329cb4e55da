use anyhow::Result;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const KIND_ACCESS: &str = "access";
pub const KIND_REFRESH: &str = "refresh";

/// The signed envelope carried inside every bearer token.
///
/// The envelope alone is not sufficient for acceptance: the presented
/// secret's hash must also match a live descriptor on the user profile.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// user_id
    pub sub: String,
    pub email: String,
    pub exp: usize,
    pub iat: usize,
    pub jti: String,
    /// "access" or "refresh"
    pub kind: String,
}

pub fn create_token(
    user_id: &str,
    email: &str,
    kind: &str,
    lifetime: Duration,
    secret: &str,
) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_owned(),
        email: email.to_owned(),
        exp: (now + lifetime).timestamp() as usize,
        iat: now.timestamp() as usize,
        jti: uuid::Uuid::new_v4().to_string(),
        kind: kind.to_owned(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?;

    Ok(token)
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// One-way hash of an issued secret. Only this value is ever stored.
pub fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
