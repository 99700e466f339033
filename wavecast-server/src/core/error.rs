use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for chat operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ChatError {
    /// Wire code for this error as it appears in client-facing frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomFull(_) => "ROOM_FULL",
            Self::StreamNotFound(_) => "STREAM_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RoomFull(_) => StatusCode::CONFLICT,
            Self::StreamNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;
