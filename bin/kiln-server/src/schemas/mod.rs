//! Request and response bodies exposed through the OpenAPI document.

pub mod convert;
pub mod health;
pub mod task;

use serde::Serialize;
use utoipa::ToSchema;

/// Body of every error response.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable kind, e.g. `RateLimited` or `ToolUnavailable`.
    pub error: String,
    pub message: String,
    /// Only on `PollTooFrequent`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}
