//! Error types for the gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::AuthError;
use crate::credentials::ResolutionError;
use crate::exec_proxy::SessionError;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Authentication failed (missing, invalid or expired token)
    #[error("authentication failed: {0}")]
    Unauthorized(AuthError),

    /// Cluster credentials could not be resolved
    #[error("failed to get cluster info: {0}")]
    Resolution(#[from] ResolutionError),

    /// Target pod does not exist
    #[error("Pod not found: pods \"{0}\" not found")]
    PodNotFound(String),

    /// Exec session could not be created or run
    #[error("{0}")]
    Session(SessionError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::PodNotFound(_) => StatusCode::NOT_FOUND,
            Error::Resolution(_) | Error::Session(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            // Clients switch on the bare reason code
            Error::Unauthorized(e) => (status, Json(e.reason_code())).into_response(),
            _ => (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response(),
        }
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Unauthorized(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::PodNotFound(pod) => Error::PodNotFound(pod),
            other => Error::Session(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(error: Error) -> (StatusCode, String) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_unauthorized_body_is_reason_code() {
        let (status, body) = body_of(Error::Unauthorized(AuthError::TokenExpired)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "\"TOKEN_EXPIRED\"");
    }

    #[tokio::test]
    async fn test_pod_not_found_names_the_pod() {
        let (status, body) = body_of(SessionError::PodNotFound("test-pod".into()).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["error"], "Pod not found: pods \"test-pod\" not found");
    }

    #[tokio::test]
    async fn test_resolution_failure_is_server_error() {
        let (status, body) =
            body_of(ResolutionError::SecretNotFound("cluster/c1".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            json["error"],
            "failed to get cluster info: no secret found at cluster/c1"
        );
    }

    #[test]
    fn test_session_errors_other_than_not_found_stay_sessions() {
        let error: Error = SessionError::Exec("connection refused".into()).into();
        assert!(matches!(error, Error::Session(_)));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
