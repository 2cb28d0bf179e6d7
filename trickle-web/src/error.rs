//! HTTP error responses

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use trickle_core::{EngineError, StreamingError};

/// Errors a handler can answer with.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    /// The `s` query parameter is missing or empty
    #[error("Missing stream ID.")]
    MissingStreamId,

    /// The `f` query parameter is missing or not a file index
    #[error("Missing file index.")]
    InvalidFileIndex,

    /// A path segment is not a hex info hash
    #[error("Invalid info hash: {value}")]
    InvalidInfoHash {
        /// Rejected path segment
        value: String,
    },

    /// The streaming core refused the request
    #[error(transparent)]
    Streaming(#[from] StreamingError),

    /// Building the response failed
    #[error("Failed to build response: {reason}")]
    Response {
        /// Underlying failure
        reason: String,
    },
}

impl WebError {
    /// Status code this error is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::MissingStreamId
            | WebError::InvalidFileIndex
            | WebError::InvalidInfoHash { .. } => StatusCode::BAD_REQUEST,
            WebError::Streaming(e) => match e {
                StreamingError::NotRegistered { .. } | StreamingError::FileNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                StreamingError::OutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
                StreamingError::Engine(EngineError::InvalidUri { .. }) => StatusCode::BAD_REQUEST,
                StreamingError::Engine(_) | StreamingError::ReadFailure { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            WebError::Response { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            WebError::Streaming(e) => match e {
                StreamingError::NotRegistered { .. } => "Torrent not found.".to_string(),
                StreamingError::FileNotFound { .. } => "File not found in torrent.".to_string(),
                StreamingError::Engine(EngineError::AddTimeout { .. }) => {
                    "Failed to add torrent.".to_string()
                }
                other => other.to_string(),
            },
            other => other.to_string(),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let WebError::Streaming(StreamingError::OutOfRange { file_length }) = &self {
            return (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{file_length}"))],
            )
                .into_response();
        }

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}
