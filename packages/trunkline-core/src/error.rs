//! Centralized error types for the Trunkline core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Trunkline server.
#[derive(Debug, Error)]
pub enum TrunklineError {
    /// Failed to bind a required socket at startup. Fatal.
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        /// Human-readable endpoint description (e.g. "audio UDP 0.0.0.0:9000").
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Transient or unexpected I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence layer failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Malformed input that could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A subscriber or decoder violated the wire protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Recording and replaying are mutually exclusive.
    #[error("Spectrum service busy: {0}")]
    SpectrumBusy(String),

    /// Requested entity (recording, call) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal channel closed unexpectedly (component shut down).
    #[error("Component unavailable: {0}")]
    ChannelClosed(&'static str),
}

impl TrunklineError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind_failed",
            Self::Io(_) => "io_error",
            Self::Persistence(_) => "persistence_error",
            Self::Parse(_) => "parse_error",
            Self::Protocol(_) => "protocol_violation",
            Self::SpectrumBusy(_) => "spectrum_busy",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "configuration_error",
            Self::ChannelClosed(_) => "component_unavailable",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Parse(_) | Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::SpectrumBusy(_) => StatusCode::CONFLICT,
            Self::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for TrunklineError {
    fn code(&self) -> &'static str {
        TrunklineError::code(self)
    }
}

impl From<sqlx::Error> for TrunklineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for TrunklineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Convenient Result alias for application-wide operations.
pub type TrunklineResult<T> = Result<T, TrunklineError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for TrunklineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
