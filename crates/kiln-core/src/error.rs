//! Error taxonomy shared by the core and its HTTP adapter.
//!
//! Every failure that can reach a client carries a short machine-readable
//! [`ErrorKind`] plus a human-readable message (the `Display` impl).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Machine-readable failure kind exposed in `{"error": <kind>, "message": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
pub enum ErrorKind {
    RateLimited,
    Busy,
    BadRequest,
    PayloadTooLarge,
    ToolUnavailable,
    Timeout,
    ConversionFailed,
    NotFound,
    PollTooFrequent,
    Internal,
}

/// Errors produced while admitting, scheduling or running a conversion.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// The client exhausted its request quota for the current window.
    #[error("rate limit exceeded; retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// All concurrency slots for the client or the service are taken.
    #[error("server busy: {0}")]
    Busy(String),

    /// Missing file, unknown format, or a format outside the allowed set.
    #[error("{0}")]
    BadRequest(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// The external converter is not installed or does not answer its probe.
    #[error("conversion tool '{tool}' is not available")]
    ToolUnavailable { tool: String },

    /// A subprocess (or the whole request) ran past its deadline.
    #[error("'{operation}' timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    /// The tool ran but produced no usable output, fallback included.
    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("polling too frequently; retry after {retry_after_ms}ms")]
    PollTooFrequent { retry_after_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::RateLimited { .. } => ErrorKind::RateLimited,
            ConvertError::Busy(_) => ErrorKind::Busy,
            ConvertError::BadRequest(_) => ErrorKind::BadRequest,
            ConvertError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ConvertError::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            ConvertError::Timeout { .. } => ErrorKind::Timeout,
            ConvertError::ConversionFailed(_) => ErrorKind::ConversionFailed,
            ConvertError::NotFound(_) => ErrorKind::NotFound,
            ConvertError::PollTooFrequent { .. } => ErrorKind::PollTooFrequent,
            ConvertError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Suggested client back-off for throttling errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConvertError::RateLimited { retry_after } => Some(*retry_after),
            ConvertError::PollTooFrequent { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_bare_names() {
        let json = serde_json::to_string(&ErrorKind::PollTooFrequent).unwrap();
        assert_eq!(json, "\"PollTooFrequent\"");
        assert_eq!(ErrorKind::ToolUnavailable.as_ref(), "ToolUnavailable");
    }

    #[test]
    fn throttling_errors_expose_retry_after() {
        let err = ConvertError::PollTooFrequent { retry_after_ms: 750 };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(750)));
        assert_eq!(err.kind(), ErrorKind::PollTooFrequent);
        assert!(ConvertError::Busy("full".into()).retry_after().is_none());
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = ConvertError::Timeout {
            operation: "soffice".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "'soffice' timed out after 30000ms");
    }
}
