//! # Error Handling
//!
//! One error type for the whole service, mapped onto HTTP responses with a
//! consistent JSON envelope:
//!
//! ```json
//! {
//!   "error": {
//!     "type": "transcription_error",
//!     "message": "decoder produced no tokens",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! ## Failure categories:
//! - **ModelLoad**: model identifier unresolvable or weights failed to load (500)
//! - **Classification**: a VAD frame with a disallowed length was submitted (400)
//! - **Transcription**: decode/inference failure for one audio artifact (500)
//! - **AudioIo**: malformed or unreadable audio input (400)
//! - **Storage**: interview database failures (500)
//! - **SessionLimit**: realtime session capacity exhausted (503)
//! - **Conflict**: resource exists but is in the wrong state for the request (409)
//! - plus the usual NotFound / BadRequest / Validation / Config / Internal
//!
//! Realtime sessions catch `Transcription` errors per segment and keep running;
//! the batch path lets them fail the whole request. See the session and handler
//! modules for where that split is enforced.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Service-wide error type.
#[derive(Debug)]
pub enum AppError {
    /// Model identifier could not be resolved or the load itself failed.
    ModelLoad(String),

    /// A frame handed to the voice-activity gate had a disallowed length.
    Classification(String),

    /// Speech-to-text inference failed for one audio artifact.
    Transcription(String),

    /// Audio bytes could not be parsed, read, or written.
    AudioIo(String),

    /// Interview store (SQLite) failure.
    Storage(String),

    /// Requested resource was not found.
    NotFound(String),

    /// Client sent invalid or malformed data.
    BadRequest(String),

    /// Realtime session capacity is exhausted.
    SessionLimit(String),

    /// Resource exists but is not in a state that allows the request.
    Conflict(String),

    /// User input failed validation rules.
    ValidationError(String),

    /// Configuration file or environment variable problems.
    ConfigError(String),

    /// Anything else that went wrong server-side.
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ModelLoad(msg) => write!(f, "Model load error: {}", msg),
            AppError::Classification(msg) => write!(f, "Classification error: {}", msg),
            AppError::Transcription(msg) => write!(f, "Transcription error: {}", msg),
            AppError::AudioIo(msg) => write!(f, "Audio I/O error: {}", msg),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::SessionLimit(msg) => write!(f, "Session limit reached: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable tag used in the JSON envelope and in logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::ModelLoad(_) => "model_load_error",
            AppError::Classification(_) => "classification_error",
            AppError::Transcription(_) => "transcription_error",
            AppError::AudioIo(_) => "audio_io_error",
            AppError::Storage(_) => "storage_error",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::SessionLimit(_) => "session_limit",
            AppError::Conflict(_) => "conflict",
            AppError::ValidationError(_) => "validation_error",
            AppError::ConfigError(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::ModelLoad(msg)
            | AppError::Classification(msg)
            | AppError::Transcription(msg)
            | AppError::AudioIo(msg)
            | AppError::Storage(msg)
            | AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::SessionLimit(msg)
            | AppError::Conflict(msg)
            | AppError::ValidationError(msg)
            | AppError::ConfigError(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::ModelLoad(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Classification(_) => StatusCode::BAD_REQUEST,
            AppError::Transcription(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::AudioIo(_) => StatusCode::BAD_REQUEST,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// anyhow carries context through the model loading and inference internals;
/// by the time one reaches a handler boundary it is a plain internal error.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// JSON parsing failures are almost always malformed client input.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

/// Shorthand for results carrying the service error.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            AppError::ModelLoad("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Classification("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Transcription("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::AudioIo("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::SessionLimit("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = AppError::Transcription("decoder produced no tokens".into());
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = resp.into_body();
        let bytes = futures_util::executor::block_on(actix_web::body::to_bytes(body))
            .expect("body readable");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("valid JSON");

        assert_eq!(value["error"]["type"], "transcription_error");
        assert_eq!(value["error"]["message"], "decoder produced no tokens");
        assert!(value["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_display_includes_message() {
        let err = AppError::ModelLoad("unknown repo".into());
        assert_eq!(err.to_string(), "Model load error: unknown repo");
    }
}
