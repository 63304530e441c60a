use utoipa::OpenApi;

use crate::routes::{convert, health, tasks};
use crate::schemas::ErrorBody;
use crate::schemas::convert::{TaskAccepted, UploadForm};
use crate::schemas::health::HealthResponse;
use crate::schemas::task::TaskProgressResponse;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "kiln-server",
        description = "File conversion service: images, documents and vector graphics",
        contact(name = "kiln", url = "https://github.com/Cyberhan123/kiln")
    ),
    paths(
        convert::convert,
        tasks::create_task,
        tasks::get_task,
        tasks::get_task_result,
        health::get_health,
        health::get_formats,
    ),
    components(schemas(ErrorBody, UploadForm, TaskAccepted, TaskProgressResponse, HealthResponse)),
    tags(
        (name = "convert", description = "Synchronous conversion"),
        (name = "tasks", description = "Queued conversion with progress polling"),
        (name = "health", description = "Service health and capabilities"),
    )
)]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
