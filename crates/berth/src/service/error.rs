//! HTTP error responses for the service API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use berth_protocol::wire::ErrorResponse;
use tracing::{debug, error, warn};

use crate::error::EngineError;

/// An [`EngineError`] on its way back to a tunnel client.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(EngineError::validation(msg))
    }

    fn status_code(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::UnsupportedMode { .. } | EngineError::ModeNotAvailable { .. } => {
                StatusCode::NOT_IMPLEMENTED
            }
            EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Transport(_) | EngineError::Remote { .. } => StatusCode::BAD_GATEWAY,
            EngineError::Runtime(_) | EngineError::Io(_) | EngineError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self(EngineError::Io(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.0.code();
        let message = self.0.to_string();

        if status.is_server_error() {
            error!(error_code = code, message = %message, "API error");
        } else if status == StatusCode::CONFLICT {
            warn!(error_code = code, message = %message, "Conflict");
        } else {
            debug!(error_code = code, message = %message, "Client error");
        }

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for service handlers.
pub type ApiResult<T> = Result<T, ApiError>;
