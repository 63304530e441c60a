//! Asynchronous conversion tasks.
//!
//! `POST /tasks` enqueues and answers immediately with a task id; clients
//! poll `GET /tasks/{id}` (throttled per client, with a `retryAfterMs` hint)
//! and download the bytes from `GET /tasks/{id}/result` once `done`.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::{ConvertError, ConvertedFile, Progress, TaskId, TaskState};
use tracing::info;

use crate::client::ClientId;
use crate::error::ServerError;
use crate::routes::convert::{check_rate, file_response, parse_category, read_upload};
use crate::schemas::ErrorBody;
use crate::schemas::convert::{TaskAccepted, UploadForm};
use crate::schemas::task::TaskProgressResponse;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/result", get(get_task_result))
}

/// Enqueue a conversion and return its task id.
#[utoipa::path(
    post,
    path = "/tasks",
    tag = "tasks",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Task queued", body = TaskAccepted),
        (status = 400, description = "Missing file or unsupported format", body = ErrorBody),
        (status = 413, description = "Upload too large", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
    )
)]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    client: ClientId,
    multipart: Multipart,
) -> Result<(StatusCode, Json<TaskAccepted>), ServerError> {
    check_rate(&state, &client)?;
    let form = read_upload(multipart).await?;
    let category = parse_category(form.category.as_deref().unwrap_or_default())?;

    let task_id = state.scheduler.submit(form.into_request(category, &client)).await?;
    let warning = state
        .scheduler
        .get_progress(&task_id)
        .await
        .and_then(|p| p.warning);
    info!(task_id = %task_id, client = %client.as_str(), %category, "task accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id: task_id.to_string(),
            warning,
        }),
    ))
}

async fn lookup(state: &AppState, id: &TaskId) -> Result<Progress, ConvertError> {
    state
        .scheduler
        .get_progress(id)
        .await
        .ok_or_else(|| ConvertError::NotFound(id.to_string()))
}

/// Current progress plus a suggested poll interval.
#[utoipa::path(
    get,
    path = "/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id returned by POST /tasks")),
    responses(
        (status = 200, description = "Task progress", body = TaskProgressResponse),
        (status = 404, description = "Unknown or expired task", body = ErrorBody),
        (status = 429, description = "Polled too frequently", body = ErrorBody),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    client: ClientId,
    Path(id): Path<String>,
) -> Result<Json<TaskProgressResponse>, ServerError> {
    let task_id: TaskId = id.parse()?;
    state.poll_guard.check(client.as_str(), &task_id)?;
    let progress = lookup(&state, &task_id).await?;

    let retry_after_ms = (!progress.state.is_terminal()).then(|| {
        state
            .poll_policy
            .retry_after_ms(state.scheduler.load(), state.health.last_score())
    });
    Ok(Json(TaskProgressResponse::new(progress, retry_after_ms)))
}

/// Download the converted bytes of a finished task.
#[utoipa::path(
    get,
    path = "/tasks/{id}/result",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id returned by POST /tasks")),
    responses(
        (status = 200, description = "Converted file bytes with Content-Type and Content-Disposition"),
        (status = 400, description = "Task has not finished successfully", body = ErrorBody),
        (status = 404, description = "Unknown or expired task", body = ErrorBody),
    )
)]
pub async fn get_task_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ServerError> {
    let task_id: TaskId = id.parse()?;
    let progress = lookup(&state, &task_id).await?;
    match progress.state {
        TaskState::Done => {}
        TaskState::Error => {
            return Err(ConvertError::BadRequest(format!("task {task_id} failed: {}", progress.message)).into());
        }
        other => {
            return Err(ConvertError::BadRequest(format!("task {task_id} is not done yet (state: {other})")).into());
        }
    }

    let (Some(mime), Some(bytes)) = (progress.mime, progress.result) else {
        return Err(ServerError::Internal(format!("task {task_id} is done without a result")));
    };
    let filename = progress.output_filename.unwrap_or_else(|| "output".to_owned());
    let file = ConvertedFile {
        extension: std::path::Path::new(&filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_owned(),
        mime,
        bytes,
    };
    file_response(file, &filename, progress.cache_hit)
}
