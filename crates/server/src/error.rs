use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_core::{channel::ChannelError, message::MessageError, ServerEvent};
use serde_json::json;
use thiserror::Error;

use crate::session::AuthError;

/// Failure of a single gateway operation. `Authentication` refuses the
/// WebSocket upgrade; everything else is reported to the requesting
/// connection and the session carries on.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Authentication(#[from] AuthError),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Transient(#[from] anyhow::Error),
}

impl ChatError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        ChatError::Authorization(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ChatError::NotFound(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Authentication(_) => "authentication_error",
            ChatError::Authorization(_) => "authorization_error",
            ChatError::NotFound(_) => "not_found",
            ChatError::Conflict(_) => "conflict",
            ChatError::Validation(_) => "validation_error",
            ChatError::Transient(_) => "transient_error",
        }
    }

    /// Caller-facing text. Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Transient(_) => "temporarily unable to complete the request".to_string(),
            other => other.to_string(),
        }
    }

    /// Errors the caller cannot fix by changing the request.
    pub fn is_server_side(&self) -> bool {
        matches!(self, ChatError::Transient(_))
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.client_message(), self.code())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::Authentication(auth) => return auth.clone().into_response(),
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}

impl From<ChannelError> for ChatError {
    fn from(err: ChannelError) -> Self {
        ChatError::Validation(err.to_string())
    }
}

impl From<MessageError> for ChatError {
    fn from(err: MessageError) -> Self {
        ChatError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChatError::forbidden("no").code(), "authorization_error");
        assert_eq!(ChatError::not_found("gone").code(), "not_found");
        assert_eq!(ChatError::Conflict("dup".into()).code(), "conflict");
        assert_eq!(ChatError::invalid("bad").code(), "validation_error");
        assert_eq!(
            ChatError::from(AuthError::Expired).code(),
            "authentication_error"
        );
    }

    #[tokio::test]
    async fn rejected_handshakes_keep_the_credential_reason() {
        let response = ChatError::from(AuthError::Expired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["error"], "credential_expired");

        let response = ChatError::from(AuthError::DirectoryUnavailable).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn transient_details_are_not_leaked() {
        let err = ChatError::from(anyhow::anyhow!("connection refused on 10.0.0.5"));
        assert!(err.is_server_side());
        assert!(!err.client_message().contains("10.0.0.5"));
        match err.to_event() {
            ServerEvent::Error { code, .. } => assert_eq!(code, "transient_error"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn domain_errors_become_validation_errors() {
        let err = ChatError::from(MessageError::EmptyMessage);
        assert_eq!(err.code(), "validation_error");
        assert_eq!(err.client_message(), "message text must be provided");
        assert_eq!(ChatError::from(ChannelError::EmptyName).code(), "validation_error");
    }
}
