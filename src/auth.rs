//! Single-administrator login and HS256 bearer tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::AdminConfig;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_TTL_HOURS: i64 = 24;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub username: String,
    /// Issued-at, seconds since the Unix epoch
    pub iat: i64,
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("admin credentials or signing secret not configured")]
    NotConfigured,
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

struct Credentials {
    username: String,
    password: String,
    secret: Vec<u8>,
}

pub struct Authenticator {
    credentials: Option<Credentials>,
}

impl Authenticator {
    /// Without a username, password and secret every login is rejected.
    pub fn new(admin: &AdminConfig) -> Self {
        let credentials = match (&admin.username, &admin.password, &admin.jwt_secret) {
            (Some(username), Some(password), Some(secret)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
                secret: secret.as_bytes().to_vec(),
            }),
            _ => None,
        };
        Self { credentials }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let creds = self.credentials.as_ref().ok_or(AuthError::NotConfigured)?;

        // Evaluate both comparisons so timing does not reveal which field failed.
        let user_ok = username.as_bytes().ct_eq(creds.username.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(creds.password.as_bytes());
        if !bool::from(user_ok & pass_ok) {
            return Err(AuthError::InvalidCredentials);
        }

        let iat = Utc::now().timestamp();
        let claims = Claims {
            username: username.to_string(),
            iat,
            exp: iat + Duration::hours(TOKEN_TTL_HOURS).num_seconds(),
        };
        sign(&claims, &creds.secret)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let creds = self.credentials.as_ref().ok_or(AuthError::NotConfigured)?;
        verify(token, &creds.secret, Utc::now().timestamp())
    }
}

pub fn sign(claims: &Claims, secret: &[u8]) -> Result<String, AuthError> {
    let payload = serde_json::to_vec(claims).map_err(|_| AuthError::Malformed)?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(JWT_HEADER),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::NotConfigured)?;
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", signing_input, sig))
}

/// Check structure, signature and expiry against `now` (Unix seconds).
pub fn verify(token: &str, secret: &[u8], now: i64) -> Result<Claims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header, payload, sig] = parts.as_slice() else {
        return Err(AuthError::Malformed);
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| AuthError::Malformed)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;
    if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        return Err(AuthError::Malformed);
    }

    let expected = URL_SAFE_NO_PAD.decode(sig).map_err(|_| AuthError::Malformed)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::NotConfigured)?;
    mac.update(header_part(token).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| AuthError::BadSignature)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::Malformed)?;
    if claims.exp <= now {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// `header.payload`, the part of a token covered by the signature.
fn header_part(token: &str) -> &str {
    token.rsplit_once('.').map_or(token, |(signed, _)| signed)
}
