use axum::Json;
use axum::response::{IntoResponse, Response};
use hyper::StatusCode;
use serde_json::json;

/// The one error currency that crosses every component boundary and
/// terminates at the RPC surface, where `kind` picks the HTTP status.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("container error: exit={exit_code:?}")]
    ContainerError {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("agent error: {0}")]
    AgentError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AppError::Timeout
            | AppError::ConnectionFailed(_)
            | AppError::ContainerError { .. }
            | AppError::AgentError(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error stderr is debug-only; the caller-facing message never includes it.
    fn public_message(&self) -> String {
        match self {
            AppError::ContainerError { exit_code, .. } => {
                format!("container command failed (exit {exit_code:?})")
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::InvalidArgument(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "internal error surfaced to RPC caller");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            AppError::NotFound("workspace a".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn already_exists_maps_to_409() {
        assert_eq!(
            AppError::AlreadyExists("a".into()).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn precondition_failed_maps_to_412() {
        assert_eq!(
            AppError::PreconditionFailed("not running".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
    }

    #[test]
    fn timeout_and_connection_failed_fall_into_the_500_catch_all() {
        assert_eq!(AppError::Timeout.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AppError::ConnectionFailed("refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn container_error_hides_stderr_from_public_message() {
        let err = AppError::ContainerError {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "super secret token leak".into(),
        };
        assert!(!err.public_message().contains("secret"));
    }
}
