use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::view::command::CommandError;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum ViewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("View stopped")]
    Stopped,

    #[error("Input queue full")]
    InputFull,

    #[error("Invalid click message: {0}")]
    InvalidClick(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<webrtc::Error> for ViewError {
    fn from(e: webrtc::Error) -> Self {
        ViewError::Transport(e.to_string())
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl ViewError {
    fn status_code(&self) -> StatusCode {
        match self {
            ViewError::BadRequest(_)
            | ViewError::Serialization(_)
            | ViewError::Base64(_)
            | ViewError::InvalidClick(_) => StatusCode::BAD_REQUEST,
            ViewError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ViewError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            status = status.as_u16(),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ViewError>;
