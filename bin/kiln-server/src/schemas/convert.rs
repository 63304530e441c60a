use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;
use utoipa::ToSchema;

/// Multipart upload accepted by `POST /convert/{category}` and `POST /tasks`.
///
/// Parts: `file` (required), `to` (required), `from`, `category` (`/tasks`
/// only). Any other text part, such as `quality`, `width` or `height`, is
/// passed through as a conversion option.
#[derive(Debug, Default, ToSchema)]
pub struct UploadForm {
    /// `image`, `document` or `vector`.
    pub category: Option<String>,
    /// Target format, e.g. `webp` or `pdf`.
    pub to: String,
    /// Source format; inferred from the file name when omitted.
    pub from: Option<String>,
    #[schema(value_type = String, format = Binary)]
    pub file: Bytes,
    /// File name sent with the `file` part.
    pub filename: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: String,
    /// Set when the queue is above its soft limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
