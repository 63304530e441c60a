//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`. The response body is always
//! `{"error": <ErrorKind>, "message": "..."}`; throttling errors add a
//! `Retry-After` header and poll throttling also `retryAfterMs`.
//!
//! Internal errors are logged with full detail but only a generic message is
//! returned to the caller.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use kiln_core::{ConvertError, ErrorKind};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Anything the core reports: admission, validation, conversion.
    #[error(transparent)]
    Convert(#[from] ConvertError),

    /// The multipart body could not be read.
    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::RateLimited | ErrorKind::PollTooFrequent => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Busy | ErrorKind::ToolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ConversionFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Convert(e) => e.kind(),
            ServerError::Multipart(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                ErrorKind::PayloadTooLarge
            }
            ServerError::Multipart(_) => ErrorKind::BadRequest,
            ServerError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);

        let message = match &self {
            ServerError::Convert(ConvertError::Internal(m)) | ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                "internal server error".to_owned()
            }
            ServerError::Convert(e) => e.to_string(),
            ServerError::Multipart(e) => e.body_text(),
        };

        let mut body = json!({ "error": kind, "message": message });
        let retry_after = match &self {
            ServerError::Convert(e) => e.retry_after(),
            _ => None,
        };
        if let ServerError::Convert(ConvertError::PollTooFrequent { retry_after_ms }) = &self {
            body["retryAfterMs"] = json!(retry_after_ms);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(after) = retry_after {
            // Whole seconds, rounded up so clients never retry early.
            let secs = after.as_millis().div_ceil(1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        // Lets the trace middleware count admission and validation rejections.
        response.extensions_mut().insert(kind);
        response
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
