//! Shared-secret bearer credentials: `base64url(claims).base64url(hmac_sha256)`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential is not in payload.signature form")]
    Malformed,
    #[error("credential signature does not match")]
    BadSignature,
    #[error("credential expired")]
    Expired,
    #[error("secret must decode from base64url to at least 32 bytes")]
    InvalidSecret,
}

#[derive(Clone)]
pub struct SigningSecret(Vec<u8>);

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningSecret(..)")
    }
}

impl SigningSecret {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; MIN_SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim().trim_end_matches('='))
            .map_err(|_| CredentialError::InvalidSecret)?;
        if bytes.len() < MIN_SECRET_LEN {
            return Err(CredentialError::InvalidSecret);
        }
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    fn mac(&self) -> Result<HmacSha256, CredentialError> {
        HmacSha256::new_from_slice(&self.0).map_err(|_| CredentialError::InvalidSecret)
    }
}

/// Claims carried by a bearer credential. Times are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn new(sub: Uuid, issued_at: i64, ttl_secs: i64) -> Self {
        Self {
            sub,
            iat: issued_at,
            exp: issued_at + ttl_secs,
        }
    }
}

pub fn sign_credential(secret: &SigningSecret, claims: &Claims) -> Result<String, CredentialError> {
    // Serializing a struct of plain scalars into a Vec cannot fail.
    let payload = serde_json::to_vec(claims).unwrap_or_default();
    let encoded = URL_SAFE_NO_PAD.encode(payload);
    let mut mac = secret.mac()?;
    mac.update(encoded.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{encoded}.{signature}"))
}

/// Checks signature and expiry against `now` (unix seconds).
pub fn verify_credential(
    secret: &SigningSecret,
    token: &str,
    now: i64,
) -> Result<Claims, CredentialError> {
    let (encoded, signature) = token
        .trim()
        .split_once('.')
        .ok_or(CredentialError::Malformed)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| CredentialError::Malformed)?;

    let mut mac = secret.mac()?;
    mac.update(encoded.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| CredentialError::BadSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| CredentialError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&payload).map_err(|_| CredentialError::Malformed)?;
    if claims.exp <= now {
        return Err(CredentialError::Expired);
    }
    Ok(claims)
}
