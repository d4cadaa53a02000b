//! HTTP error mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use quickdock_core::{ComposeError, EngineError, UnknownAction};
use quickdock_session::SessionError;
use serde::Serialize;
use thiserror::Error;

/// Error body returned by every route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// API error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::ContainerNotFound(_) => Self::NotFound(message),
            EngineError::ContainerNotRunning(_) => Self::Conflict(message),
            EngineError::Unavailable(_) => Self::Unavailable(message),
            EngineError::Rejected(_) => Self::Internal(message),
        }
    }
}

impl From<ComposeError> for ApiError {
    fn from(err: ComposeError) -> Self {
        match err {
            ComposeError::Engine(e) => e.into(),
            ComposeError::ProjectNotFound(_) => Self::NotFound(err.to_string()),
            ComposeError::NoWorkingDir(_) => Self::BadRequest(err.to_string()),
            ComposeError::Failed(_) | ComposeError::Spawn(_) | ComposeError::Timeout(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Engine(e) => e.into(),
            SessionError::AlreadyClosed => Self::Conflict(err.to_string()),
        }
    }
}

impl From<UnknownAction> for ApiError {
    fn from(err: UnknownAction) -> Self {
        Self::BadRequest(err.to_string())
    }
}
