use chrono::{DateTime, Utc};
use kiln_core::Progress;
use serde::Serialize;
use utoipa::ToSchema;

/// Progress snapshot returned by `GET /tasks/{id}`. Result bytes are fetched
/// separately from `/tasks/{id}/result`.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressResponse {
    pub task_id: String,
    /// `queued`, `running`, `done` or `error`.
    pub state: String,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Suggested wait before the next poll; absent once the task is finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl TaskProgressResponse {
    pub fn new(progress: Progress, retry_after_ms: Option<u64>) -> Self {
        Self {
            task_id: progress.task_id.to_string(),
            state: progress.state.to_string(),
            percent: progress.percent,
            message: progress.message,
            warning: progress.warning,
            error: progress.error_kind.map(|k| k.to_string()),
            mime: progress.mime,
            output_filename: progress.output_filename,
            cache_hit: progress.cache_hit,
            created_at: progress.created_at,
            updated_at: progress.updated_at,
            retry_after_ms,
        }
    }
}
