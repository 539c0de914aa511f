//! Engine error types.

use berth_protocol::ExecutionMode;
use berth_protocol::wire::{ErrorResponse, codes};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Exit status for a handled domain failure.
pub const EXIT_FAILURE: u8 = 125;

/// Errors returned by every capability operation, local or tunneled.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad user input, reported before any side effect.
    #[error("{0}")]
    Validation(String),

    /// The backend for this mode cannot perform the operation at all.
    #[error("{operation} is not supported in {mode} mode")]
    UnsupportedMode {
        operation: &'static str,
        mode: ExecutionMode,
    },

    /// The command is not registered for the active mode.
    #[error("command \"{command}\" is not available in {mode} mode")]
    ModeNotAvailable {
        command: String,
        mode: ExecutionMode,
    },

    #[error("{0}: no such object")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The connection to the service failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with an error body.
    #[error("remote error ({status} {code}): {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn unsupported(operation: &'static str, mode: ExecutionMode) -> Self {
        Self::UnsupportedMode { operation, mode }
    }

    /// Process exit status the CLI uses for this failure.
    pub fn exit_code(&self) -> u8 {
        EXIT_FAILURE
    }

    /// Wire code used when the service reports this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => codes::BAD_REQUEST,
            Self::UnsupportedMode { .. } | Self::ModeNotAvailable { .. } => {
                codes::UNSUPPORTED_MODE
            }
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::Conflict(_) => codes::CONFLICT,
            Self::Cancelled => codes::CANCELLED,
            Self::Transport(_)
            | Self::Remote { .. }
            | Self::Runtime(_)
            | Self::Io(_)
            | Self::Serialization(_) => codes::INTERNAL,
        }
    }

    /// Rebuild an error from a service error body.
    ///
    /// Not-found and conflict keep their message so callers can match on them
    /// the same way in both modes.
    pub fn from_response(status: u16, body: ErrorResponse) -> Self {
        match body.code.as_str() {
            codes::NOT_FOUND => Self::NotFound(
                body.error
                    .strip_suffix(": no such object")
                    .unwrap_or(&body.error)
                    .to_string(),
            ),
            codes::CONFLICT => Self::Conflict(body.error),
            codes::BAD_REQUEST => Self::Validation(body.error),
            codes::CANCELLED => Self::Cancelled,
            _ => Self::Remote {
                status,
                code: body.code,
                message: body.error,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_is_125() {
        let errors = [
            EngineError::validation("bad"),
            EngineError::unsupported("system renumber", ExecutionMode::Tunnel),
            EngineError::Cancelled,
        ];
        for err in errors {
            assert_eq!(err.exit_code(), 125);
        }
    }

    #[test]
    fn test_unsupported_message_names_mode() {
        let err = EngineError::unsupported("system migrate", ExecutionMode::Tunnel);
        assert_eq!(err.to_string(), "system migrate is not supported in tunnel mode");
    }

    #[test]
    fn test_from_response_round_trips_not_found() {
        let original = EngineError::not_found("alpine");
        let body = ErrorResponse {
            error: original.to_string(),
            code: original.code().to_string(),
            details: None,
        };
        let rebuilt = EngineError::from_response(404, body);
        match rebuilt {
            EngineError::NotFound(name) => assert_eq!(name, "alpine"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_response_unknown_code_is_remote() {
        let body = ErrorResponse {
            error: "disk full".to_string(),
            code: "INTERNAL_ERROR".to_string(),
            details: None,
        };
        match EngineError::from_response(500, body) {
            EngineError::Remote { status, message, .. } => {
                assert_eq!(status, 500);
                assert_eq!(message, "disk full");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
