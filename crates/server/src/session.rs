use std::sync::Arc;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use huddle_core::identity::Identity;
use huddle_crypto::{sign_credential, verify_credential, Claims, CredentialError, SigningSecret};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::users::{identity_of, UserDirectory};

/// Why a connection attempt was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no bearer credential supplied")]
    MissingCredential,
    #[error("credential is malformed")]
    MalformedCredential,
    #[error("credential signature is invalid")]
    BadSignature,
    #[error("credential expired")]
    Expired,
    #[error("credential subject does not exist")]
    UnknownSubject,
    #[error("user is deactivated")]
    Deactivated,
    #[error("user directory unavailable")]
    DirectoryUnavailable,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::MalformedCredential => "malformed_credential",
            AuthError::BadSignature => "bad_signature",
            AuthError::Expired => "credential_expired",
            AuthError::UnknownSubject => "unknown_user",
            AuthError::Deactivated => "user_deactivated",
            AuthError::DirectoryUnavailable => "directory_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::DirectoryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<CredentialError> for AuthError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::BadSignature => AuthError::BadSignature,
            CredentialError::Expired => AuthError::Expired,
            CredentialError::Malformed | CredentialError::InvalidSecret => {
                AuthError::MalformedCredential
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody { error: self.code() })).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Verifies bearer credentials and resolves them to a live identity.
#[derive(Clone)]
pub struct IdentityGate {
    secret: SigningSecret,
    users: Arc<dyn UserDirectory>,
    ttl: Duration,
}

impl IdentityGate {
    pub fn new(secret: SigningSecret, users: Arc<dyn UserDirectory>, ttl_hours: i64) -> Self {
        Self {
            secret,
            users,
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn issue(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredential, CredentialError> {
        let claims = Claims::new(user_id, now.timestamp(), self.ttl.num_seconds());
        Ok(IssuedCredential {
            token: sign_credential(&self.secret, &claims)?,
            expires_at: now + self.ttl,
        })
    }

    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        let claims = verify_credential(&self.secret, token, Utc::now().timestamp())?;

        let record = self
            .users
            .find_by_id(claims.sub)
            .await
            .map_err(|err| {
                tracing::error!(?err, user_id = %claims.sub, "user lookup failed during authentication");
                AuthError::DirectoryUnavailable
            })?
            .ok_or(AuthError::UnknownSubject)?;
        if !record.active {
            return Err(AuthError::Deactivated);
        }
        Ok(identity_of(&record))
    }
}

/// Extracts the credential from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}
