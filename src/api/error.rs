//! API error handling for consistent JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::{QueueError, SessionError};

/// API error type that converts to JSON responses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": true,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::InvalidTransition { .. } | QueueError::RetryLimitReached { .. } => {
                StatusCode::CONFLICT
            }
            QueueError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::AlreadyActive { .. } | SessionError::InvalidState { .. } => {
                StatusCode::CONFLICT
            }
            SessionError::CaptureUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Engine(_) => StatusCode::BAD_GATEWAY,
            SessionError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobStatus;
    use uuid::Uuid;

    #[test]
    fn test_queue_error_status_codes() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(QueueError::NotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(QueueError::InvalidTransition {
                job_id: id,
                status: JobStatus::Completed,
                action: "cancel",
            })
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_session_error_status_codes() {
        assert_eq!(
            ApiError::from(SessionError::CaptureUnavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(SessionError::AlreadyActive {
                event_id: "e".to_string(),
                session_id: Uuid::new_v4(),
            })
            .status(),
            StatusCode::CONFLICT
        );
    }
}
