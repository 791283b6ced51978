use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::transcription::{LoadError, TranscriptionError};

/// Request-level failures, each mapped to one HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller error: no audio, bad parameter
    #[error("{0}")]
    InvalidRequest(String),

    /// Body extraction rejected by the framework (size limit, malformed multipart)
    #[error("{message}")]
    Rejected {
        /// Status chosen by the extractor
        status: StatusCode,
        /// Extractor message
        message: String,
    },

    /// The shared model could not be constructed
    #[error(transparent)]
    ResourceLoad(#[from] LoadError),

    /// The model failed on this input
    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    /// Inference exceeded the configured bound
    #[error("transcription timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else (temp file I/O, task join)
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP status for this error
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Rejected { status, .. } => *status,
            Self::ResourceLoad(_) | Self::Transcription(_) | Self::Timeout(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {self}");
        } else {
            tracing::warn!(status = status.as_u16(), "request rejected: {self}");
        }

        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
