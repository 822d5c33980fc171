use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the recognition core
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("failed to open video '{reference}': {reason}")]
    VideoOpen { reference: String, reason: String },

    #[error("video read failed after {failures} consecutive bad frames: {reason}")]
    VideoRead { failures: u32, reason: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("task '{0}' not found")]
    UnknownTask(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("frame at {timestamp}s arrived after frame at {last}s")]
    OutOfOrderFrame { timestamp: f64, last: f64 },

    #[error("face detection failed: {0}")]
    Detector(String),

    #[error("gallery unavailable: {0}")]
    Gallery(String),
}

impl RecognitionError {
    pub fn invalid_parameter(msg: impl std::fmt::Display) -> Self {
        Self::InvalidParameter(msg.to_string())
    }

    pub fn gallery(err: impl std::fmt::Display) -> Self {
        Self::Gallery(err.to_string())
    }

    pub fn detector(err: impl std::fmt::Display) -> Self {
        Self::Detector(err.to_string())
    }
}

pub type RecognitionResult<T> = std::result::Result<T, RecognitionError>;

/// HTTP-facing error
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::Unprocessable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unprocessable(msg)
            | ApiError::Internal(msg) => msg.clone(),
        };

        let body = Json(json!({
            "error": message,
        }));

        (self.status(), body).into_response()
    }
}

impl From<RecognitionError> for ApiError {
    fn from(err: RecognitionError) -> Self {
        let message = err.to_string();
        match err {
            RecognitionError::InvalidParameter(_) => ApiError::BadRequest(message),
            RecognitionError::UnknownTask(_) => ApiError::NotFound(message),
            RecognitionError::InvalidEmbedding(_)
            | RecognitionError::DimensionMismatch { .. }
            | RecognitionError::VideoOpen { .. } => ApiError::Unprocessable(message),
            RecognitionError::VideoRead { .. }
            | RecognitionError::Cancelled
            | RecognitionError::OutOfOrderFrame { .. }
            | RecognitionError::Detector(_)
            | RecognitionError::Gallery(_) => ApiError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(format!("{:#}", err))
    }
}
